// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use crate::ip::IpAddr;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// A node's answer to "is this connection mine?".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Ownership {
    /// The node already terminates this connection.
    Owned,

    /// The node knows nothing about the connection.
    NotOwned,

    /// The node has no state for the connection, but would accept it
    /// if this packet establishes it.
    Adopt,
}

impl Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Owned => "owned",
            Self::NotOwned => "not-owned",
            Self::Adopt => "adopt",
        };
        write!(f, "{s}")
    }
}

/// A local service accepting new connections.
///
/// A listener without an address accepts on every local address.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Listener {
    #[serde(default)]
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl Listener {
    pub fn any(port: u16) -> Self {
        Self { addr: None, port }
    }

    pub fn matches(&self, addr: IpAddr, port: u16) -> bool {
        self.port == port && self.addr.is_none_or(|a| a == addr)
    }
}

impl Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{addr}:{}", self.port),
            None => write!(f, "*:{}", self.port),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listener_matching() {
        let any = Listener::any(22);
        let addr: IpAddr = "192.168.50.10".parse().unwrap();
        let other: IpAddr = "192.168.50.11".parse().unwrap();
        assert!(any.matches(addr, 22));
        assert!(!any.matches(addr, 80));

        let bound = Listener { addr: Some(addr), port: 22 };
        assert!(bound.matches(addr, 22));
        assert!(!bound.matches(other, 22));
    }

    #[test]
    fn listener_from_json() {
        let l: Listener = serde_json::from_str(r#"{"port": 80}"#).unwrap();
        assert_eq!(l, Listener::any(80));
    }
}
