// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow table implementation.
//!
//! A bounded map from [`FlowKey`] to per-flow state, where entries
//! that go unmatched for longer than the table's TTL are expired.

use crate::api::FlowKey;
use crate::time::MILLIS;
use crate::time::Moment;
use core::fmt;
use core::num::NonZeroU32;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

pub const FLOW_DEF_EXPIRE_SECS: u64 = 120;
pub const FLOW_DEF_TTL: Ttl = Ttl::new_seconds(FLOW_DEF_EXPIRE_SECS);

pub const FLOW_TABLE_DEF_MAX_ENTRIES: u32 = 8192;

/// The Time To Live in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub fn as_seconds(&self) -> u64 {
        self.0 / MILLIS
    }

    /// Is `last_hit` expired?
    pub fn is_expired(&self, last_hit: Moment, now: Moment) -> bool {
        now.delta_as_millis(last_hit) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }
}

/// The table is at its limit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableFull {
    pub limit: u32,
}

impl fmt::Display for TableFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow table full ({} entries)", self.limit)
    }
}

pub type FlowTableDump<T> = Vec<(FlowKey, T)>;

#[derive(Debug)]
pub struct FlowTable<S: Dump> {
    limit: NonZeroU32,
    ttl: Ttl,
    map: BTreeMap<FlowKey, FlowEntry<S>>,
}

impl<S> FlowTable<S>
where
    S: Clone + fmt::Debug + Dump,
{
    /// Add a new entry to the flow table.
    ///
    /// # Errors
    ///
    /// If the table is at max capacity, an error is returned and no
    /// modification is made to the table.
    ///
    /// If an entry already exists for this flow, it is overwritten.
    pub fn add(&mut self, flow: FlowKey, state: S) -> Result<(), TableFull> {
        if !self.map.contains_key(&flow)
            && self.map.len() == self.limit.get() as usize
        {
            return Err(TableFull { limit: self.limit.get() });
        }

        self.map.insert(flow, FlowEntry::new(state));
        Ok(())
    }

    pub fn dump(&self) -> FlowTableDump<S::DumpVal> {
        self.map.iter().map(|(flow, entry)| (*flow, entry.dump())).collect()
    }

    /// Remove every entry not hit within the TTL, returning the flows
    /// removed.
    pub fn expire_flows(&mut self, now: Moment) -> Vec<FlowKey> {
        let ttl = self.ttl;
        let mut expired = vec![];

        self.map.retain(|flow, entry| {
            if entry.is_expired(now, ttl) {
                expired.push(*flow);
                return false;
            }

            true
        });

        expired
    }

    pub fn get(&self, flow: &FlowKey) -> Option<&FlowEntry<S>> {
        self.map.get(flow)
    }

    pub fn get_mut(&mut self, flow: &FlowKey) -> Option<&mut FlowEntry<S>> {
        self.map.get_mut(flow)
    }

    pub fn new(limit: NonZeroU32, ttl: Ttl) -> Self {
        Self { limit, ttl, map: BTreeMap::new() }
    }

    pub fn num_flows(&self) -> u32 {
        self.map.len() as u32
    }

    pub fn remove(&mut self, flow: &FlowKey) -> Option<FlowEntry<S>> {
        self.map.remove(flow)
    }
}

/// A type that can be "dumped" for the purposes of presenting an
/// external view into internal state of the [`FlowEntry<T>`].
pub trait Dump {
    type DumpVal: DeserializeOwned + Serialize;

    fn dump(&self, hits: u64) -> Self::DumpVal;
}

/// Per-flow state plus its hit count and the time of the last hit.
#[derive(Clone, Debug)]
pub struct FlowEntry<S: Dump> {
    state: S,
    hits: u64,
    last_hit: Moment,
}

impl<S: Dump> FlowEntry<S> {
    fn dump(&self) -> S::DumpVal {
        self.state.dump(self.hits)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn hit_at(&mut self, now: Moment) {
        self.hits += 1;
        self.last_hit = now;
    }

    pub fn is_expired(&self, now: Moment, ttl: Ttl) -> bool {
        ttl.is_expired(self.last_hit, now)
    }

    fn new(state: S) -> Self {
        FlowEntry { state, hits: 0, last_hit: Moment::now() }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use core::time::Duration;

    const FT_SIZE: Option<NonZeroU32> = NonZeroU32::new(2);

    impl Dump for () {
        type DumpVal = ();

        fn dump(&self, _hits: u64) {}
    }

    fn flow(sport: u16) -> FlowKey {
        FlowKey::new(
            Protocol::TCP,
            "192.168.2.10".parse().unwrap(),
            sport,
            "76.76.21.21".parse().unwrap(),
            443,
        )
        .unwrap()
    }

    #[test]
    fn flow_expired() {
        let mut ft = FlowTable::new(FT_SIZE.unwrap(), FLOW_DEF_TTL);
        assert_eq!(ft.num_flows(), 0);
        ft.add(flow(37890), ()).unwrap();
        let now = Moment::now();
        assert_eq!(ft.num_flows(), 1);
        assert!(ft.expire_flows(now).is_empty());
        assert_eq!(ft.num_flows(), 1);
        let later = now + Duration::new(FLOW_DEF_EXPIRE_SECS, 0);
        assert_eq!(ft.expire_flows(later), vec![flow(37890)]);
        assert_eq!(ft.num_flows(), 0);
    }

    #[test]
    fn flow_limit() {
        let mut ft = FlowTable::new(FT_SIZE.unwrap(), FLOW_DEF_TTL);
        ft.add(flow(1), ()).unwrap();
        ft.add(flow(2), ()).unwrap();
        assert_eq!(ft.add(flow(3), ()), Err(TableFull { limit: 2 }));
        // Replacing an existing entry is not growth.
        ft.add(flow(2), ()).unwrap();
        assert_eq!(ft.num_flows(), 2);

        ft.get_mut(&flow(1)).unwrap().hit_at(Moment::now());
        assert_eq!(ft.get(&flow(1)).unwrap().hits(), 1);
        assert_eq!(ft.dump().len(), 2);

        assert!(ft.remove(&flow(1)).is_some());
        assert_eq!(ft.num_flows(), 1);
    }
}
