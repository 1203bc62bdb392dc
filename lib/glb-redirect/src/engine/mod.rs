// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The engine: wire codecs, flow extraction, and the redirect
//! decision, along with the seams to the world around it.
pub mod checksum;
pub mod conn_table;
pub mod encap;
pub mod flow;
pub mod flow_table;
pub mod gue;
pub mod hop_chain;
pub mod icmp;
pub mod ip4;
pub mod ip6;
pub mod packet;
pub mod redirect;
pub mod stat;
pub mod tcp;
pub mod udp;

use crate::api::FlowKey;
use crate::api::IpAddr;
use crate::api::Ownership;
use core::fmt;
use std::io;

/// Answers whether this node terminates a given connection.
///
/// Implementations are shared by every redirect worker and must do
/// their own synchronization.
pub trait OwnershipOracle: Send + Sync {
    /// Look up `flow` as it arrives at this node, client to server.
    fn lookup(&self, flow: &FlowKey) -> Result<Ownership, OracleError>;

    /// Take ownership of `flow`, which is being established here.
    fn adopt(&self, flow: &FlowKey) -> Result<(), OracleError>;

    /// Forget `flow`, which has been torn down.
    fn release(&self, _flow: &FlowKey) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OracleError {
    /// The oracle could not be consulted.
    Unavailable,

    /// There is no room to record another flow.
    MaxCapacity(u64),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "ownership oracle unavailable"),
            Self::MaxCapacity(limit) => {
                write!(f, "connection table full ({limit} flows)")
            }
        }
    }
}

/// Sends a complete encapsulated frame toward another node.
pub trait Transport {
    fn send(&self, dst: IpAddr, frame: &[u8]) -> io::Result<()>;
}

/// Hands a decapsulated packet to this node's own network stack.
pub trait LocalDelivery {
    fn deliver(&self, inner: &[u8]) -> io::Result<()>;
}
