// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Counters kept by the redirect engine.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use serde::Deserialize;
use serde::Serialize;

/// Live counters, bumped by every worker.
#[derive(Debug, Default)]
pub struct RedirectStats {
    /// Frames handed to the engine.
    pub rx: AtomicU64,

    /// Inner packets handed to the local stack, for any reason.
    pub delivered: AtomicU64,

    /// Informational ICMP delivered without consulting the oracle.
    pub delivered_icmp_info: AtomicU64,

    /// Connections adopted on their first packet.
    pub adopted: AtomicU64,

    /// Packets delivered because the chain ran out.
    pub default_accepted: AtomicU64,

    pub forwarded: AtomicU64,
    pub bounced: AtomicU64,
    pub dropped: AtomicU64,

    /// Forwards, bounces, and deliveries the transport refused.
    pub send_errors: AtomicU64,

    /// Oracle lookups or adoptions that failed.
    pub oracle_errors: AtomicU64,
}

impl RedirectStats {
    pub fn incr(stat: &AtomicU64) {
        stat.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RedirectStatsSnapshot {
        let get = |s: &AtomicU64| s.load(Ordering::Relaxed);

        RedirectStatsSnapshot {
            rx: get(&self.rx),
            delivered: get(&self.delivered),
            delivered_icmp_info: get(&self.delivered_icmp_info),
            adopted: get(&self.adopted),
            default_accepted: get(&self.default_accepted),
            forwarded: get(&self.forwarded),
            bounced: get(&self.bounced),
            dropped: get(&self.dropped),
            send_errors: get(&self.send_errors),
            oracle_errors: get(&self.oracle_errors),
        }
    }
}

/// A point-in-time copy of [`RedirectStats`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct RedirectStatsSnapshot {
    pub rx: u64,
    pub delivered: u64,
    pub delivered_icmp_info: u64,
    pub adopted: u64,
    pub default_accepted: u64,
    pub forwarded: u64,
    pub bounced: u64,
    pub dropped: u64,
    pub send_errors: u64,
    pub oracle_errors: u64,
}

impl RedirectStatsSnapshot {
    /// The counters as name/value pairs, in a stable order.
    pub fn fields(&self) -> [(&'static str, u64); 10] {
        [
            ("rx", self.rx),
            ("delivered", self.delivered),
            ("delivered_icmp_info", self.delivered_icmp_info),
            ("adopted", self.adopted),
            ("default_accepted", self.default_accepted),
            ("forwarded", self.forwarded),
            ("bounced", self.bounced),
            ("dropped", self.dropped),
            ("send_errors", self.send_errors),
            ("oracle_errors", self.oracle_errors),
        ]
    }
}
