// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The GLB chained-routing private data carried in the GUE options.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Private type          |   Next hop    |   Hop count   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ~          Hops (4 or 16 bytes each, per outer family)          ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The hop list is written once by the encapsulating node and never
//! edited. Each node that passes the packet on advances `next_hop`, so
//! the chain still to be tried is `hops[next_hop..]` and the hops before
//! it record the path taken so far.

use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::api::AddrFamily;
use crate::api::GLB_PRIVATE_TYPE;
use crate::api::IpAddr;
use crate::api::Ipv4Addr;
use crate::api::Ipv6Addr;
use crate::api::MAX_HOPS;
use crate::api::max_hops_for;
use crate::d_error::DError;
use core::fmt;
use core::fmt::Display;
use heapless::Vec as HVec;

/// The fixed part of the private data: type, next hop, hop count.
pub const HOP_CHAIN_HDR_LEN: usize = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HopChain {
    private_type: u16,
    next_hop: u8,
    family: AddrFamily,
    hops: HVec<IpAddr, MAX_HOPS>,
}

/// There is no hop left to pop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainExhausted;

impl HopChain {
    /// Author a new chain, as the encapsulating node would.
    pub fn new(
        family: AddrFamily,
        hops: &[IpAddr],
    ) -> Result<Self, HopChainError> {
        if hops.len() > max_hops_for(family.addr_len()) {
            return Err(HopChainError::TooManyHops {
                hop_count: hops.len() as u8,
            });
        }

        if hops.iter().any(|h| h.family() != family) {
            return Err(HopChainError::MixedFamilies);
        }

        let mut chain = Self::empty(family);
        for hop in hops {
            chain
                .hops
                .push(*hop)
                .map_err(|_| HopChainError::TooManyHops {
                    hop_count: hops.len() as u8,
                })?;
        }
        Ok(chain)
    }

    /// A chain with no candidates at all.
    pub fn empty(family: AddrFamily) -> Self {
        Self {
            private_type: GLB_PRIVATE_TYPE,
            next_hop: 0,
            family,
            hops: HVec::new(),
        }
    }

    /// Decode the GUE optional data of a packet whose outer header is
    /// of `family`.
    ///
    /// An empty option area is an empty chain. Bytes after the hop
    /// list are padding and are ignored.
    pub fn parse(
        bytes: &[u8],
        family: AddrFamily,
        max_hops: u8,
    ) -> Result<Self, HopChainError> {
        if bytes.is_empty() {
            return Ok(Self::empty(family));
        }

        let mut rdr = PacketReader::new(bytes);
        let hdr = rdr.slice(HOP_CHAIN_HDR_LEN)?;
        let private_type = u16::from_be_bytes([hdr[0], hdr[1]]);
        let next_hop = hdr[2];
        let hop_count = hdr[3];

        if private_type != GLB_PRIVATE_TYPE {
            return Err(HopChainError::UnknownPrivateType { private_type });
        }

        if hop_count > max_hops
            || usize::from(hop_count) > max_hops_for(family.addr_len())
        {
            return Err(HopChainError::TooManyHops { hop_count });
        }

        if next_hop > hop_count {
            return Err(HopChainError::NextHopOutOfRange {
                next_hop,
                hop_count,
            });
        }

        let addr_len = family.addr_len();
        let list = rdr
            .slice(usize::from(hop_count) * addr_len)
            .map_err(|_| HopChainError::HopsTruncated { hop_count })?;

        let mut hops = HVec::new();
        for raw in list.chunks_exact(addr_len) {
            let hop = match family {
                AddrFamily::V4 => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(raw);
                    IpAddr::from(Ipv4Addr::from(b))
                }
                AddrFamily::V6 => {
                    let mut b = [0u8; 16];
                    b.copy_from_slice(raw);
                    IpAddr::from(Ipv6Addr::from(b))
                }
            };
            hops.push(hop)
                .map_err(|_| HopChainError::TooManyHops { hop_count })?;
        }

        Ok(Self { private_type, next_hop, family, hops })
    }

    /// The encoded length, always a whole number of GUE words.
    pub fn wire_len(&self) -> usize {
        HOP_CHAIN_HDR_LEN + self.hops.len() * self.family.addr_len()
    }

    pub fn emit_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.private_type.to_be_bytes());
        dst.push(self.next_hop);
        dst.push(self.hops.len() as u8);
        for hop in &self.hops {
            match hop {
                IpAddr::Ip4(ip4) => dst.extend_from_slice(&ip4.bytes()),
                IpAddr::Ip6(ip6) => dst.extend_from_slice(&ip6.bytes()),
            }
        }
    }

    /// The candidates not yet tried, head first.
    pub fn remaining(&self) -> &[IpAddr] {
        &self.hops[usize::from(self.next_hop)..]
    }

    /// The complete hop list as authored.
    pub fn hops(&self) -> &[IpAddr] {
        &self.hops
    }

    pub fn next_hop(&self) -> u8 {
        self.next_hop
    }

    pub fn hop_count(&self) -> u8 {
        self.hops.len() as u8
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    pub fn private_type(&self) -> u16 {
        self.private_type
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Take the head of the remaining chain, returning it along with
    /// the chain the next hop should see.
    pub fn pop_head(&self) -> Result<(IpAddr, HopChain), ChainExhausted> {
        let head = *self.remaining().first().ok_or(ChainExhausted)?;
        let mut rest = self.clone();
        rest.next_hop += 1;
        Ok((head, rest))
    }

    /// The hop most recently popped, which is the node the packet was
    /// last sent to by way of this chain.
    pub fn last_consumed(&self) -> Option<IpAddr> {
        let idx = usize::from(self.next_hop).checked_sub(1)?;
        self.hops.get(idx).copied()
    }
}

impl Display for HopChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if i == usize::from(self.next_hop) {
                write!(f, "^")?;
            }
            write!(f, "{hop}")?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
#[derror(leaf_data = HopChainError::derror_data)]
pub enum HopChainError {
    UnknownPrivateType { private_type: u16 },
    TooManyHops { hop_count: u8 },
    NextHopOutOfRange { next_hop: u8, hop_count: u8 },
    HopsTruncated { hop_count: u8 },
    MixedFamilies,
    ReadError(ReadErr),
}

impl HopChainError {
    fn derror_data(&self, data: &mut [u64]) {
        match self {
            Self::UnknownPrivateType { private_type } => {
                data[0] = *private_type as u64;
            }
            Self::TooManyHops { hop_count }
            | Self::HopsTruncated { hop_count } => {
                data[0] = *hop_count as u64;
            }
            Self::NextHopOutOfRange { next_hop, hop_count } => {
                data[0] = *next_hop as u64;
                data[1] = *hop_count as u64;
            }
            _ => {}
        }
    }
}

impl From<ReadErr> for HopChainError {
    fn from(error: ReadErr) -> Self {
        HopChainError::ReadError(error)
    }
}
