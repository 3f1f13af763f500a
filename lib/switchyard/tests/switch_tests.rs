// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Switch boot, registration, teardown, and mechanism lifecycle,
//! driven through a fake datapath.

use common::*;
use std::time::Duration;
use switchyard::Error;
use switchyard::engine::mechanism::Mechanism;
use switchyard::engine::mechanism::MechanismError;
use switchyard::engine::switch::SwitchError;
use switchyard::ofp::ETHERTYPE_ARP;
use switchyard::ofp::ETHERTYPE_IPV4;
use switchyard::ofp::FlowModCommand;
use switchyard::ofp::Match;
use switchyard::ofp::Message;
use switchyard::ofp::MultipartRequest;
use switchyard::ofp::PacketIn;
use switchyard_api::Dpid;
use switchyard_api::RouteType;
use switchyard_test_utils as common;

#[test]
fn boot_handshake() {
    let mgr = test_manager();
    let (dp, sc) = connect(&mgr, DatapathConfig::new(1, 8, 3));
    assert!(dp.wait_until(DEFAULT_WAIT, |msgs| msgs.len() >= 5));

    let msgs: Vec<Message> = dp.received().into_iter().map(|e| e.msg).collect();
    assert_eq!(msgs[0], Message::Hello);
    assert_eq!(msgs[1], Message::FeaturesRequest);
    assert_eq!(msgs[2], Message::MultipartRequest(MultipartRequest::PortDesc));

    // Table 0 is wiped and left dropping before anything else lands.
    let Message::FlowMod(flush) = &msgs[3] else {
        panic!("expected table flush, got {:?}", msgs[3]);
    };
    assert_eq!(flush.command, FlowModCommand::Delete);
    assert_eq!(flush.table_id, 0);
    assert_eq!(flush.matches, Match::any());
    let Message::FlowMod(drop) = &msgs[4] else {
        panic!("expected drop rule, got {:?}", msgs[4]);
    };
    assert_eq!(drop.command, FlowModCommand::Add);
    assert_eq!(drop.priority, 0);
    assert!(drop.instructions.is_empty());

    assert_eq!(sc.dpid(), Dpid::new(1));
    assert_eq!(sc.dpid().to_string(), "00:00:00:00:00:00:00:01");
    assert_eq!(sc.switch.port_list().len(), 3);
    assert_eq!(sc.switch.name(), Some("sw1"));
    assert_eq!(sc.switch.port_by_name("eth2").map(|p| p.port_no), Some(2));
    assert_eq!(mgr.switches(), vec![Dpid::new(1)]);
    assert!(mgr.switch_context(Dpid::new(1)).is_ok());
}

#[test]
fn boot_activates_everything() {
    let mgr = test_manager();
    let (dp, sc) = connect(&mgr, DatapathConfig::new(2, 8, 2));

    for name in sc.link.mechanisms().names() {
        assert!(sc.link.mechanisms().get(name).unwrap().activated(), "{name}");
    }
    for name in sc.network.mechanisms().names() {
        assert!(sc.network.mechanisms().get(name).unwrap().activated(), "{name}");
    }
    for name in sc.routing.mechanisms().names() {
        assert!(sc.routing.mechanisms().get(name).unwrap().activated(), "{name}");
    }
    for name in sc.extension.mechanisms().names() {
        assert!(
            sc.extension.mechanisms().get(name).unwrap().activated(),
            "{name}"
        );
    }

    // ARP and IPv4 each get a table of their own.
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 3));
    let arp = dp.steered_table(ETHERTYPE_ARP).expect("arp steered");
    let ip = dp.steered_table(ETHERTYPE_IPV4).expect("ipv4 steered");
    assert_ne!(arp, 0);
    assert_ne!(ip, 0);
    assert_ne!(arp, ip);
    assert_eq!(sc.switch.free_tables(), 8 - 1 - 2);
}

#[test]
fn disconnect_removes_switch() {
    let mgr = test_manager();
    let (dp, _sc) = connect(&mgr, DatapathConfig::new(3, 4, 1));
    assert_eq!(mgr.switches().len(), 1);

    dp.disconnect();
    assert!(wait_for(DEFAULT_WAIT, || mgr.switches().is_empty()));
    assert!(matches!(
        mgr.switch_context(Dpid::new(3)),
        Err(SwitchError::NotFound(_))
    ));
}

#[test]
fn switches_are_independent() {
    let mgr = test_manager();
    let (dp1, _) = connect(&mgr, DatapathConfig::new(4, 4, 1));
    let (_dp2, _) = connect(&mgr, DatapathConfig::new(5, 4, 1));
    assert_eq!(mgr.switches(), vec![Dpid::new(4), Dpid::new(5)]);

    dp1.disconnect();
    assert!(wait_for(DEFAULT_WAIT, || mgr.switches().len() == 1));
    assert!(mgr.switch_context(Dpid::new(5)).is_ok());
}

#[test]
fn reconnect_replaces_previous() {
    let mgr = test_manager();
    let (_dp1, first) = connect(&mgr, DatapathConfig::new(6, 4, 1));
    let (_dp2, second) = connect(&mgr, DatapathConfig::new(6, 4, 1));

    assert_eq!(mgr.switches(), vec![Dpid::new(6)]);
    let cur = mgr.switch_context(Dpid::new(6)).unwrap();
    assert!(std::sync::Arc::ptr_eq(&cur, &second));
    assert!(!std::sync::Arc::ptr_eq(&cur, &first));

    // The old connection was closed and its mechanisms let go.
    for name in first.network.mechanisms().names() {
        assert!(!first.network.mechanisms().get(name).unwrap().enabled());
    }
}

#[test]
fn unknown_version_is_refused() {
    let mgr = test_manager();
    let mut cfg = DatapathConfig::new(7, 4, 1);
    cfg.version = 0x05;
    let (_dp, conn) = FakeDatapath::connect(cfg);

    let res = mgr.create_switch(conn);
    assert!(matches!(
        res,
        Err(Error::Switch(SwitchError::UnknownVersion(0x05)))
    ));
    assert!(mgr.switches().is_empty());
}

#[test]
fn table_exhaustion_spares_siblings() {
    // Table 0 plus a single table to hand out: ARP claims it, so IPv4
    // routing can't activate.
    let mgr = test_manager();
    let (dp, sc) = connect(&mgr, DatapathConfig::new(8, 2, 2));

    let arp = sc.network.mechanisms().get("arp").unwrap();
    let ipv4 = sc.routing.mechanisms().get("ipv4").unwrap();
    assert!(arp.activated());
    assert!(ipv4.enabled());
    assert!(!ipv4.activated());
    assert_eq!(sc.switch.free_tables(), 0);

    // The connection and the other mechanisms carry on.
    assert!(sc.extension.mechanisms().get("icmp").unwrap().activated());
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 2));
    assert_eq!(dp.steered_table(ETHERTYPE_ARP), Some(1));
    assert_eq!(dp.steered_table(ETHERTYPE_IPV4), None);
    assert_eq!(mgr.switches(), vec![Dpid::new(8)]);

    // Routes are accepted but only active mechanisms act on them.
    sc.routing
        .update_routes(&routes(
            sc.dpid(),
            &[route(
                RouteType::Static,
                "10.9.0.0/16",
                Some("10.0.1.254"),
                1,
            )],
        ))
        .unwrap();
    assert!(sc.routing.routes().is_empty());
    assert_eq!(sc.routing.context().routes.len(), 1);
}

#[test]
fn lifecycle_by_name() {
    let mgr = test_manager();
    let (_dp, sc) = connect(&mgr, DatapathConfig::new(9, 4, 1));
    let ext = sc.extension.mechanisms();

    assert!(matches!(
        ext.disable_by_name("nope"),
        Err(MechanismError::NotRegistered(_))
    ));
    assert!(matches!(
        ext.activate_by_name("icmp"),
        Err(MechanismError::AlreadyActivated(_))
    ));
    assert!(matches!(
        ext.enable_by_name("icmp", &sc.ctx),
        Err(MechanismError::AlreadyEnabled(_))
    ));

    ext.disable_by_name("icmp").unwrap();
    assert!(!ext.get("icmp").unwrap().enabled());
    assert!(matches!(
        ext.disable_by_name("icmp"),
        Err(MechanismError::AlreadyDisabled(_))
    ));
    assert!(matches!(
        ext.activate_by_name("icmp"),
        Err(MechanismError::NotEnabled(_))
    ));

    ext.enable_by_name("icmp", &sc.ctx).unwrap();
    assert!(ext.get("icmp").unwrap().enabled());
    assert!(!ext.get("icmp").unwrap().activated());
    ext.activate_by_name("icmp").unwrap();
    assert!(ext.get("icmp").unwrap().activated());

    // The others were never touched.
    assert!(ext.get("ofp-base").unwrap().activated());
}

#[test]
fn disable_returns_table() {
    let mgr = test_manager();
    let (dp, sc) = connect(&mgr, DatapathConfig::new(10, 4, 1));
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 3));
    let free = sc.switch.free_tables();
    let arp_table = dp.steered_table(ETHERTYPE_ARP).unwrap();

    sc.network.mechanisms().disable_by_name("arp").unwrap();
    assert_eq!(sc.switch.free_tables(), free + 1);
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 2));
    assert_eq!(dp.steered_table(ETHERTYPE_ARP), None);
    assert!(dp.flows(arp_table).is_empty());

    // Enabling and activating again claims a table afresh.
    let net = sc.network.mechanisms();
    net.enable_by_name("arp", &sc.ctx).unwrap();
    net.activate_by_name("arp").unwrap();
    assert_eq!(sc.switch.free_tables(), free);
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 3));
}

#[test]
fn echo_request_answered_with_same_xid() {
    let mgr = test_manager();
    let (dp, _sc) = connect(&mgr, DatapathConfig::new(11, 4, 1));

    dp.send(0x4242, &Message::EchoRequest(b"are you there".to_vec()));
    assert!(dp.wait_until(DEFAULT_WAIT, |msgs| {
        msgs.iter().any(|e| {
            e.xid == 0x4242
                && e.msg == Message::EchoReply(b"are you there".to_vec())
        })
    }));
}

#[test]
fn stale_cookie_is_ignored() {
    let mgr = test_manager();
    let (dp, _sc) = connect(&mgr, DatapathConfig::new(12, 4, 1));
    assert!(dp.wait_flows(0, DEFAULT_WAIT, |flows| flows.len() == 3));
    let before = dp.received().len();

    let frame = arp_request(
        port_mac(99, 1),
        "10.0.1.10".parse().unwrap(),
        "10.0.1.1".parse().unwrap(),
    );
    dp.send(77, &Message::PacketIn(PacketIn::new(1, 0xdead_beef, 1, frame)));
    std::thread::sleep(Duration::from_millis(100));

    // Nothing answered it, and the switch is still being served.
    assert!(dp.packet_outs().is_empty());
    assert_eq!(dp.received().len(), before);
    dp.send(78, &Message::EchoRequest(vec![]));
    assert!(dp.wait_until(DEFAULT_WAIT, |msgs| {
        msgs.iter().any(|e| e.xid == 78)
    }));
    assert_eq!(mgr.switches().len(), 1);
}

#[test]
fn malformed_message_spares_the_connection() {
    let mgr = test_manager();
    let (dp, _sc) = connect(&mgr, DatapathConfig::new(13, 4, 1));

    // A PACKET_IN whose body is too short to hold the fixed fields.
    dp.send_raw(&[4, 10, 0, 12, 0, 0, 0, 9, 0, 0, 0, 0]);
    dp.send(79, &Message::EchoRequest(vec![]));
    assert!(dp.wait_until(DEFAULT_WAIT, |msgs| {
        msgs.iter().any(|e| e.xid == 79 && e.msg == Message::EchoReply(vec![]))
    }));
    assert!(mgr.switch_context(Dpid::new(13)).is_ok());
}
