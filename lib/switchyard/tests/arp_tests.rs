// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ARP: answering for our addresses, learning neighbors, and resolving
//! on behalf of other mechanisms.

use common::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use switchyard::engine::SwitchContext;
use switchyard::engine::mechanism::AddressResolver;
use switchyard::engine::mechanism::NetworkMechanism;
use switchyard::engine::mechanism::ResolveError;
use switchyard::engine::mechanism::arp::ArpMechanism;
use switchyard::ofp::ETHERTYPE_ARP;
use switchyard::persist::MemoryPersister;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::MacAddr;
use switchyard_test_utils as common;

const HOST_MAC: MacAddr = MacAddr::from_const([0xa8, 0x40, 0x25, 0, 0, 0x10]);

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn resolver(sc: &SwitchContext) -> Arc<dyn AddressResolver> {
    sc.network
        .mechanisms()
        .get(ArpMechanism::NAME)
        .cloned()
        .and_then(|m| m.resolver())
        .expect("arp resolves")
}

/// Boot a switch with 10.0.1.1/24 on port 1 and wait for the ARP rules
/// to land.
fn boot(
    mgr: &Arc<switchyard::engine::SwitchManager>,
    dpid: u64,
) -> (FakeDatapath, Arc<SwitchContext>, u8) {
    let (dp, sc) = connect(mgr, DatapathConfig::new(dpid, 4, 2));
    sc.network
        .update_networks(&networks(sc.dpid(), &[(1, "10.0.1.1/24")]))
        .unwrap();

    assert!(wait_for(DEFAULT_WAIT, || dp.steered_table(ETHERTYPE_ARP).is_some()));
    let table = dp.steered_table(ETHERTYPE_ARP).unwrap();
    // The drop rule plus one request and one reply rule.
    assert!(dp.wait_flows(table, DEFAULT_WAIT, |flows| flows.len() == 3));
    (dp, sc, table)
}

/// Broadcast requests the controller sent for `tpa`.
fn requests_for(dp: &FakeDatapath, tpa: Ipv4Addr) -> usize {
    dp.packet_outs()
        .iter()
        .filter_map(|po| parse_arp(&po.data))
        .filter(|a| a.request && a.tpa == tpa)
        .count()
}

#[test]
fn answer_request_for_own_address() {
    let mgr = test_manager();
    let (dp, sc, table) = boot(&mgr, 1);

    // Both per-address rules carry a cookie of their own.
    let cookies: Vec<u64> = dp
        .flows(table)
        .iter()
        .filter(|f| f.priority > 0)
        .map(|f| f.cookie)
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().all(|c| *c != 0));
    assert_ne!(cookies[0], cookies[1]);

    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.1.10"), ip("10.0.1.1")));
    let (port, frame) = dp
        .wait_emitted(DEFAULT_WAIT, |_, f| parse_arp(f).is_some_and(|a| !a.request))
        .expect("arp reply");
    let reply = parse_arp(&frame).unwrap();
    assert_eq!(port, 1);
    assert_eq!(reply.eth_dst, HOST_MAC);
    assert_eq!(reply.sha, port_mac(1, 1));
    assert_eq!(reply.spa, ip("10.0.1.1"));
    assert_eq!(reply.tha, HOST_MAC);
    assert_eq!(reply.tpa, ip("10.0.1.10"));

    // The asker was learned on the way.
    assert!(wait_for(DEFAULT_WAIT, || !sc.network.neighbors().is_empty()));
    let n = &sc.network.neighbors()[0];
    assert_eq!(n.network_addr, ip("10.0.1.10"));
    assert_eq!(n.link_addr, HOST_MAC);
    assert_eq!(n.port, 1);
}

#[test]
fn ignore_request_for_other_address() {
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 2);

    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.1.10"), ip("10.0.1.99")));
    thread::sleep(Duration::from_millis(100));
    assert!(dp.packet_outs().is_empty());
    assert!(sc.network.neighbors().is_empty());
}

#[test]
fn neighbor_learning_is_idempotent() {
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 3);
    let req = arp_request(HOST_MAC, ip("10.0.1.10"), ip("10.0.1.1"));

    dp.inject(1, &req);
    dp.inject(1, &req);
    assert!(wait_for(DEFAULT_WAIT, || dp.packet_outs().len() == 2));
    assert_eq!(sc.network.neighbors().len(), 1);

    // The same address showing up elsewhere replaces the entry.
    let moved = MacAddr::from_const([0xa8, 0x40, 0x25, 0, 0, 0x11]);
    dp.inject(1, &arp_request(moved, ip("10.0.1.10"), ip("10.0.1.1")));
    assert!(wait_for(DEFAULT_WAIT, || {
        sc.network.neighbors().first().is_some_and(|n| n.link_addr == moved)
    }));
    assert_eq!(sc.network.neighbors().len(), 1);
}

#[test]
fn resolve_asks_once_then_caches() {
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 4);
    dp.add_host(1, ip("10.0.1.20"), HOST_MAC);
    let arp = resolver(&sc);

    assert_eq!(arp.resolve(ip("10.0.1.20"), 1).unwrap(), HOST_MAC);
    assert_eq!(requests_for(&dp, ip("10.0.1.20")), 1);

    // The request went out of the asked-for port, from our address.
    let (port, frame) = dp
        .wait_emitted(DEFAULT_WAIT, |_, f| parse_arp(f).is_some_and(|a| a.request))
        .unwrap();
    let req = parse_arp(&frame).unwrap();
    assert_eq!(port, 1);
    assert_eq!(req.eth_dst, MacAddr::BROADCAST);
    assert_eq!(req.sha, port_mac(4, 1));
    assert_eq!(req.spa, ip("10.0.1.1"));

    assert_eq!(arp.resolve(ip("10.0.1.20"), 1).unwrap(), HOST_MAC);
    assert_eq!(requests_for(&dp, ip("10.0.1.20")), 1);
}

#[test]
fn concurrent_lookups_share_one_request() {
    let mgr = test_manager_with(
        Arc::new(MemoryPersister::new()),
        Duration::from_secs(5),
    );
    let (dp, sc, _) = boot(&mgr, 5);
    dp.mute_hosts(true);
    let target = ip("10.0.1.30");

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let arp = resolver(&sc);
            thread::spawn(move || arp.resolve(target, 1))
        })
        .collect();

    assert!(wait_for(DEFAULT_WAIT, || requests_for(&dp, target) == 1));
    // Let the stragglers register behind the first.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(requests_for(&dp, target), 1);

    dp.inject(1, &arp_reply(HOST_MAC, target, port_mac(5, 1), ip("10.0.1.1")));
    for w in waiters {
        assert_eq!(w.join().unwrap().unwrap(), HOST_MAC);
    }
    assert_eq!(requests_for(&dp, target), 1);
}

#[test]
fn lookup_times_out() {
    // test_manager() waits 500ms for an answer.
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 6);
    dp.mute_hosts(true);
    let arp = resolver(&sc);
    let target = ip("10.0.1.40");

    let start = Instant::now();
    let res = arp.resolve(target, 1);
    assert!(matches!(res, Err(ResolveError::Timeout(a)) if a == target));
    assert!(start.elapsed() >= Duration::from_millis(450));

    // Nobody is left waiting, so the next lookup asks again.
    assert!(arp.resolve(target, 1).is_err());
    assert_eq!(requests_for(&dp, target), 2);
}

#[test]
fn lookup_on_unaddressed_port_fails() {
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 7);
    let arp = resolver(&sc);

    // Port 2 has no network address to ask from.
    let res = arp.resolve(ip("10.0.2.5"), 2);
    assert!(matches!(res, Err(ResolveError::Rpc(_))));
    assert!(dp.packet_outs().is_empty());
}

#[test]
fn delete_network_retracts_rules() {
    let mgr = test_manager();
    let (dp, sc, table) = boot(&mgr, 8);

    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.1.10"), ip("10.0.1.1")));
    assert!(wait_for(DEFAULT_WAIT, || sc.network.neighbors().len() == 1));
    let answered = dp.packet_outs().len();

    sc.network
        .delete_networks(&networks(sc.dpid(), &[(1, "10.0.1.1/24")]))
        .unwrap();
    assert!(dp.wait_flows(table, DEFAULT_WAIT, |flows| flows.len() == 1));
    assert!(sc.network.neighbors().is_empty());
    assert!(sc.network.context().ports.is_empty());

    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.1.10"), ip("10.0.1.1")));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(dp.packet_outs().len(), answered);
}

#[test]
fn readdressing_port_retracts_old_address() {
    let mgr = test_manager();
    let (dp, sc, _) = boot(&mgr, 20);

    sc.network
        .update_networks(&networks(sc.dpid(), &[(1, "10.0.3.1/24")]))
        .unwrap();
    let connected: Vec<Ipv4Cidr> =
        sc.routing.routes().iter().map(|r| r.network).collect();
    assert_eq!(connected, vec!["10.0.3.0/24".parse().unwrap()]);
    assert_eq!(
        sc.network.context().ports,
        networks(sc.dpid(), &[(1, "10.0.3.1/24")]).ports
    );

    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.3.10"), ip("10.0.3.1")));
    let (_, frame) = dp
        .wait_emitted(DEFAULT_WAIT, |_, f| parse_arp(f).is_some_and(|a| !a.request))
        .expect("arp reply");
    assert_eq!(parse_arp(&frame).unwrap().spa, ip("10.0.3.1"));

    // Nobody answers for the old address any more.
    let answered = dp.packet_outs().len();
    dp.inject(1, &arp_request(HOST_MAC, ip("10.0.3.10"), ip("10.0.1.1")));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(dp.packet_outs().len(), answered);
}
