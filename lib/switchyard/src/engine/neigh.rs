// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The neighbor table: network address to link address and port.
//!
//! Entries are refreshed by every ARP request or reply we observe and
//! never expire.

use crate::sync::RwLock;
use std::collections::BTreeMap;
use std::time::Instant;
use switchyard_api::Ipv4Addr;
use switchyard_api::MacAddr;
use switchyard_api::NeighEntryDump;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NeighEntry {
    pub network_addr: Ipv4Addr,
    pub link_addr: MacAddr,
    pub port: u32,
    pub updated: Instant,
}

#[derive(Default)]
pub struct NeighTable {
    entries: RwLock<BTreeMap<Ipv4Addr, NeighEntry>>,
}

impl NeighTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `network_addr` lives at `link_addr` behind `port`,
    /// replacing whatever we knew before.
    pub fn populate(&self, network_addr: Ipv4Addr, link_addr: MacAddr, port: u32) {
        let entry = NeighEntry {
            network_addr,
            link_addr,
            port,
            updated: Instant::now(),
        };
        self.entries.write().insert(network_addr, entry);
    }

    pub fn lookup(&self, network_addr: Ipv4Addr) -> Option<NeighEntry> {
        self.entries.read().get(&network_addr).copied()
    }

    pub fn remove(&self, network_addr: Ipv4Addr) -> Option<NeighEntry> {
        self.entries.write().remove(&network_addr)
    }

    /// Forget every neighbor learned on `port`.
    pub fn flush_port(&self, port: u32) {
        self.entries.write().retain(|_, e| e.port != port);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) -> Vec<NeighEntryDump> {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .map(|e| NeighEntryDump {
                network_addr: e.network_addr,
                link_addr: e.link_addr,
                port: e.port,
                age_secs: now.duration_since(e.updated).as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 5]);
    const MAC1: MacAddr = MacAddr::from_const([2, 0, 0, 0, 0, 1]);
    const MAC2: MacAddr = MacAddr::from_const([2, 0, 0, 0, 0, 2]);

    #[test]
    fn populate_is_last_write_wins() {
        let t = NeighTable::new();
        t.populate(IP, MAC1, 1);
        t.populate(IP, MAC1, 1);
        assert_eq!(t.len(), 1);

        t.populate(IP, MAC2, 3);
        assert_eq!(t.len(), 1);
        let e = t.lookup(IP).unwrap();
        assert_eq!(e.link_addr, MAC2);
        assert_eq!(e.port, 3);
    }

    #[test]
    fn absent_is_none() {
        let t = NeighTable::new();
        assert!(t.lookup(IP).is_none());
        t.populate(IP, MAC1, 1);
        assert!(t.lookup(Ipv4Addr::from_const([10, 0, 0, 6])).is_none());
    }

    #[test]
    fn flush_port() {
        let t = NeighTable::new();
        t.populate(IP, MAC1, 1);
        t.populate(Ipv4Addr::from_const([10, 0, 0, 6]), MAC2, 2);
        t.flush_port(1);
        assert!(t.lookup(IP).is_none());
        assert_eq!(t.dump().len(), 1);
    }
}
