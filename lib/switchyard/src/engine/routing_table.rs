// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv4 routing table.
//!
//! Routes are kept sorted best-first and a lookup returns the first
//! route whose network holds the address. "Best" means: a more specific
//! network first, then lower administrative distance, then lower
//! metric. Any two routes that can both match one address are nested,
//! so for those the specificity test is just a prefix-length compare,
//! which also keeps the sort a total order.

use crate::sync::RwLock;
use core::cmp::Ordering;
use std::time::Instant;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::RouteType;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteEntry {
    pub route_type: RouteType,
    pub network: Ipv4Cidr,
    pub next_hop: Option<Ipv4Addr>,
    pub metric: u32,
    pub port: u32,
    pub updated: Instant,
}

impl RouteEntry {
    pub fn new(
        route_type: RouteType,
        network: Ipv4Cidr,
        next_hop: Option<Ipv4Addr>,
        metric: u32,
        port: u32,
    ) -> Self {
        Self { route_type, network, next_hop, metric, port, updated: Instant::now() }
    }

    pub fn distance(&self) -> u8 {
        self.route_type.distance()
    }

    /// Best-first ordering.
    pub fn precedence(&self, other: &Self) -> Ordering {
        other
            .network
            .prefix_len()
            .cmp(&self.network.prefix_len())
            .then_with(|| self.distance().cmp(&other.distance()))
            .then_with(|| self.metric.cmp(&other.metric))
    }

    /// Whether `self` is the route `(network, port, next_hop)` names. A
    /// missing next hop on either side matches any.
    pub fn is_keyed_by(
        &self,
        network: Ipv4Cidr,
        port: u32,
        next_hop: Option<Ipv4Addr>,
    ) -> bool {
        let hop_matches = match (self.next_hop, next_hop) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.network == network && self.port == port && hop_matches
    }
}

#[derive(Default)]
pub struct RoutingTable {
    entries: RwLock<Vec<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `entry`, replacing any route with the same network, port and
    /// next hop.
    pub fn insert(&self, entry: RouteEntry) {
        let mut entries = self.entries.write();
        entries.retain(|e| {
            !(e.network == entry.network
                && e.port == entry.port
                && e.next_hop == entry.next_hop)
        });
        entries.push(entry);
        // Stable, so equally good routes keep their insertion order.
        entries.sort_by(RouteEntry::precedence);
    }

    pub fn lookup(&self, addr: Ipv4Addr) -> Option<RouteEntry> {
        self.entries.read().iter().find(|e| e.network.is_member(addr)).copied()
    }

    /// Remove every route keyed by `(network, port, next_hop)`,
    /// returning what was removed.
    pub fn evict(
        &self,
        network: Ipv4Cidr,
        port: u32,
        next_hop: Option<Ipv4Addr>,
    ) -> Vec<RouteEntry> {
        let mut entries = self.entries.write();
        let (evicted, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.is_keyed_by(network, port, next_hop));
        *entries = kept;
        evicted
    }

    pub fn entries(&self) -> Vec<RouteEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn specificity_beats_distance() {
        let rt = RoutingTable::new();
        rt.insert(RouteEntry::new(RouteType::Eigrp, cidr("10.0.0.0/8"), None, 0, 1));
        rt.insert(RouteEntry::new(
            RouteType::Static,
            cidr("10.0.1.0/24"),
            None,
            0,
            2,
        ));

        let e = rt.lookup(ip("10.0.1.5")).unwrap();
        assert_eq!(e.network, cidr("10.0.1.0/24"));

        let e = rt.lookup(ip("10.0.2.5")).unwrap();
        assert_eq!(e.network, cidr("10.0.0.0/8"));
    }

    #[test]
    fn distance_breaks_ties() {
        let rt = RoutingTable::new();
        rt.insert(RouteEntry::new(RouteType::Eigrp, cidr("10.0.1.0/24"), None, 0, 1));
        rt.insert(RouteEntry::new(RouteType::Static, cidr("10.0.1.0/24"), None, 0, 2));
        assert_eq!(rt.lookup(ip("10.0.1.5")).unwrap().port, 2);
    }

    #[test]
    fn metric_breaks_distance_ties() {
        let rt = RoutingTable::new();
        rt.insert(RouteEntry::new(RouteType::Ospf, cidr("10.0.1.0/24"), None, 20, 1));
        rt.insert(RouteEntry::new(RouteType::Ospf, cidr("10.0.1.0/24"), None, 10, 2));
        assert_eq!(rt.lookup(ip("10.0.1.5")).unwrap().port, 2);
    }

    #[test]
    fn miss() {
        let rt = RoutingTable::new();
        rt.insert(RouteEntry::new(RouteType::Static, cidr("10.0.1.0/24"), None, 0, 1));
        assert!(rt.lookup(ip("192.168.1.1")).is_none());
    }

    #[test]
    fn evict_matches_all_keys() {
        let rt = RoutingTable::new();
        let net = cidr("10.2.0.0/16");
        rt.insert(RouteEntry::new(RouteType::Static, net, Some(ip("10.0.1.254")), 0, 1));
        rt.insert(RouteEntry::new(RouteType::Static, net, Some(ip("10.0.2.254")), 0, 2));
        rt.insert(RouteEntry::new(RouteType::Static, net, Some(ip("10.0.1.253")), 0, 1));

        let gone = rt.evict(net, 1, Some(ip("10.0.1.254")));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].next_hop, Some(ip("10.0.1.254")));
        assert_eq!(rt.len(), 2);
    }

    #[test]
    fn evict_without_next_hop_matches_any() {
        let rt = RoutingTable::new();
        let net = cidr("10.2.0.0/16");
        rt.insert(RouteEntry::new(RouteType::Static, net, Some(ip("10.0.1.254")), 0, 1));
        rt.insert(RouteEntry::new(RouteType::Static, net, Some(ip("10.0.2.254")), 0, 2));
        assert_eq!(rt.evict(net, 1, None).len(), 1);
        assert_eq!(rt.len(), 1);
        assert!(rt.evict(net, 7, None).is_empty());
    }

    #[test]
    fn reinsert_replaces() {
        let rt = RoutingTable::new();
        let net = cidr("10.2.0.0/16");
        rt.insert(RouteEntry::new(RouteType::Static, net, None, 5, 1));
        rt.insert(RouteEntry::new(RouteType::Static, net, None, 1, 1));
        assert_eq!(rt.len(), 1);
        assert_eq!(rt.entries()[0].metric, 1);
    }
}
