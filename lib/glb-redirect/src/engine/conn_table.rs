// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The in-memory connection table.
//!
//! This is the default [`OwnershipOracle`]: the set of connections
//! adopted by this node, plus the listeners that new connections may
//! be adopted for. The table is split into shards by flow hash so that
//! workers handling unrelated flows rarely contend on a lock.

use super::OracleError;
use super::OwnershipOracle;
use super::flow_table::Dump;
use super::flow_table::FLOW_DEF_TTL;
use super::flow_table::FLOW_TABLE_DEF_MAX_ENTRIES;
use super::flow_table::FlowTable;
use super::flow_table::FlowTableDump;
use super::flow_table::Ttl;
use crate::api::FlowKey;
use crate::api::Listener;
use crate::api::Ownership;
use crate::sync::KMutex;
use crate::time::Moment;
use core::num::NonZeroU32;
use core::num::NonZeroUsize;
use serde::Deserialize;
use serde::Serialize;

pub const CONN_TABLE_DEF_SHARDS: usize = 16;

#[derive(Clone, Debug)]
pub struct ConnTableCfg {
    pub listeners: Vec<Listener>,
    pub ttl: Ttl,
    pub max_flows: NonZeroU32,
    pub shards: NonZeroUsize,
}

impl Default for ConnTableCfg {
    fn default() -> Self {
        Self {
            listeners: vec![],
            ttl: FLOW_DEF_TTL,
            max_flows: NonZeroU32::new(FLOW_TABLE_DEF_MAX_ENTRIES)
                .unwrap_or(NonZeroU32::MIN),
            shards: NonZeroUsize::new(CONN_TABLE_DEF_SHARDS)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnState {
    adopted: Moment,
}

/// The external view of an owned connection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConnDump {
    pub hits: u64,
    pub age_ms: u64,
}

impl Dump for ConnState {
    type DumpVal = ConnDump;

    fn dump(&self, hits: u64) -> ConnDump {
        ConnDump { hits, age_ms: Moment::now().delta_as_millis(self.adopted) }
    }
}

#[derive(Debug)]
pub struct ConnTable {
    listeners: Vec<Listener>,
    ttl: Ttl,
    shards: Vec<KMutex<FlowTable<ConnState>>>,
}

impl ConnTable {
    pub fn new(cfg: ConnTableCfg) -> Self {
        let nshards = cfg.shards.get();
        let per_shard = (cfg.max_flows.get() as usize).div_ceil(nshards);
        let limit =
            NonZeroU32::new(per_shard as u32).unwrap_or(NonZeroU32::MIN);

        let shards = (0..nshards)
            .map(|_| KMutex::new(FlowTable::new(limit, cfg.ttl)))
            .collect();

        Self { listeners: cfg.listeners, ttl: cfg.ttl, shards }
    }

    fn shard(&self, flow: &FlowKey) -> &KMutex<FlowTable<ConnState>> {
        let idx = flow.crc32() as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Is `flow` owned, as of `now`? A hit refreshes the entry.
    pub fn lookup_at(&self, flow: &FlowKey, now: Moment) -> Ownership {
        {
            let mut shard = self.shard(flow).lock();
            if let Some(entry) = shard.get_mut(flow) {
                if !entry.is_expired(now, self.ttl) {
                    entry.hit_at(now);
                    return Ownership::Owned;
                }

                // Not yet swept, but no longer ours.
                shard.remove(flow);
            }
        }

        let dst = flow.dst_ip();
        if self.listeners.iter().any(|l| l.matches(dst, flow.dst_port)) {
            Ownership::Adopt
        } else {
            Ownership::NotOwned
        }
    }

    /// Remove every connection idle for longer than the TTL, returning
    /// the number removed.
    pub fn expire_flows(&self, now: Moment) -> usize {
        self.shards.iter().map(|s| s.lock().expire_flows(now).len()).sum()
    }

    pub fn num_flows(&self) -> u32 {
        self.shards.iter().map(|s| s.lock().num_flows()).sum()
    }

    /// Every owned connection, in flow order.
    pub fn dump(&self) -> FlowTableDump<ConnDump> {
        let mut flows: Vec<_> =
            self.shards.iter().flat_map(|s| s.lock().dump()).collect();
        flows.sort_by(|a, b| a.0.cmp(&b.0));
        flows
    }
}

impl OwnershipOracle for ConnTable {
    fn lookup(&self, flow: &FlowKey) -> Result<Ownership, OracleError> {
        Ok(self.lookup_at(flow, Moment::now()))
    }

    fn adopt(&self, flow: &FlowKey) -> Result<(), OracleError> {
        self.shard(flow)
            .lock()
            .add(*flow, ConnState { adopted: Moment::now() })
            .map_err(|e| OracleError::MaxCapacity(u64::from(e.limit)))
    }

    fn release(&self, flow: &FlowKey) {
        self.shard(flow).lock().remove(flow);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use core::time::Duration;

    fn flow(dst: &str, dport: u16) -> FlowKey {
        FlowKey::new(
            Protocol::TCP,
            "192.168.50.5".parse().unwrap(),
            40000,
            dst.parse().unwrap(),
            dport,
        )
        .unwrap()
    }

    fn table(listeners: Vec<Listener>) -> ConnTable {
        ConnTable::new(ConnTableCfg {
            listeners,
            shards: NonZeroUsize::new(4).unwrap(),
            ..Default::default()
        })
    }

    #[test]
    fn listeners_make_flows_adoptable() {
        let vip: crate::api::IpAddr = "10.0.0.1".parse().unwrap();
        let ct = table(vec![
            Listener::any(22),
            Listener { addr: Some(vip), port: 80 },
        ]);

        assert_eq!(ct.lookup(&flow("10.0.0.9", 22)), Ok(Ownership::Adopt));
        assert_eq!(ct.lookup(&flow("10.0.0.1", 80)), Ok(Ownership::Adopt));
        assert_eq!(ct.lookup(&flow("10.0.0.9", 80)), Ok(Ownership::NotOwned));
        assert_eq!(ct.lookup(&flow("10.0.0.1", 443)), Ok(Ownership::NotOwned));
    }

    #[test]
    fn adopt_release_expire() {
        let ct = table(vec![Listener::any(22)]);
        let f = flow("10.0.0.1", 22);

        ct.adopt(&f).unwrap();
        assert_eq!(ct.lookup(&f), Ok(Ownership::Owned));
        assert_eq!(ct.num_flows(), 1);
        assert_eq!(ct.dump()[0].0, f);
        assert_eq!(ct.dump()[0].1.hits, 1);

        ct.release(&f);
        assert_eq!(ct.lookup(&f), Ok(Ownership::Adopt));

        ct.adopt(&f).unwrap();
        let later = Moment::now() + Duration::from_secs(ct.ttl().as_seconds());
        // An expired entry is dropped at lookup even before a sweep.
        assert_eq!(ct.lookup_at(&f, later), Ownership::Adopt);
        assert_eq!(ct.num_flows(), 0);

        ct.adopt(&f).unwrap();
        let now = Moment::now();
        assert_eq!(ct.expire_flows(now), 0);
        let later = now + Duration::from_secs(ct.ttl().as_seconds());
        assert_eq!(ct.expire_flows(later), 1);
    }

    #[test]
    fn capacity_is_per_shard() {
        let ct = ConnTable::new(ConnTableCfg {
            max_flows: NonZeroU32::new(1).unwrap(),
            shards: NonZeroUsize::new(1).unwrap(),
            ..Default::default()
        });
        ct.adopt(&flow("10.0.0.1", 22)).unwrap();
        assert_eq!(
            ct.adopt(&flow("10.0.0.2", 22)),
            Err(OracleError::MaxCapacity(1))
        );
    }
}
