// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A fake OpenFlow switch.
//!
//! The datapath answers the handshake, keeps a flow pipeline, and
//! records every message the controller sends it. Frames injected on a
//! port run through the pipeline; whatever lands at the controller is
//! sent up as a PACKET_IN carrying the matching flow's cookie. Hosts
//! may be attached to ports so that ARP requests sent out of those
//! ports get answered.

use crate::conn::ChanConn;
use crate::conn::decode;
use crate::packet::arp_reply;
use crate::packet::parse_arp;
use crate::pipeline::Pipeline;
use crate::pipeline::Verdict;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;
use switchyard::engine::conn::Envelope;
use switchyard::engine::conn::XidGen;
use switchyard::ofp::Action;
use switchyard::ofp::FlowMod;
use switchyard::ofp::Instruction;
use switchyard::ofp::Message;
use switchyard::ofp::MultipartReply;
use switchyard::ofp::MultipartRequest;
use switchyard::ofp::OxmField;
use switchyard::ofp::PacketIn;
use switchyard::ofp::PacketOut;
use switchyard::ofp::PortDesc;
use switchyard::ofp::SwitchFeatures;
use switchyard::ofp::ports;
use switchyard::sync::Condvar;
use switchyard::sync::Mutex;
use switchyard_api::Dpid;
use switchyard_api::Ipv4Addr;
use switchyard_api::MacAddr;
use switchyard_api::OFP_VERSION;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DatapathConfig {
    pub dpid: Dpid,
    pub n_tables: u8,
    pub ports: Vec<PortDesc>,
    /// Version announced in our HELLO.
    pub version: u8,
}

impl DatapathConfig {
    /// A switch with `n_ports` ports numbered from 1, each with MAC
    /// `02:00:00:00:<dpid>:<port>`, plus the LOCAL port.
    pub fn new(dpid: u64, n_tables: u8, n_ports: u32) -> Self {
        let mut ports: Vec<PortDesc> = (1..=n_ports)
            .map(|p| PortDesc::new(p, &format!("eth{p}"), port_mac(dpid, p)))
            .collect();
        ports.push(PortDesc::new(ports::LOCAL, &format!("sw{dpid}"), port_mac(dpid, 0)));
        Self { dpid: Dpid::new(dpid), n_tables, ports, version: OFP_VERSION }
    }
}

/// The hardware address [`DatapathConfig::new`] gives `port`.
pub fn port_mac(dpid: u64, port: u32) -> MacAddr {
    MacAddr::from_const([0x02, 0, 0, 0, dpid as u8, port as u8])
}

#[derive(Default)]
struct State {
    received: Vec<Envelope>,
    pipeline: Pipeline,
    /// Frames transmitted on physical ports, in order.
    emitted: Vec<(u32, Vec<u8>)>,
    hosts: BTreeMap<Ipv4Addr, (u32, MacAddr)>,
    /// ARP requests hosts should ignore.
    mute: bool,
}

struct Inner {
    cfg: DatapathConfig,
    to_ctl: Mutex<Option<Sender<Vec<u8>>>>,
    state: Mutex<State>,
    cv: Condvar,
    xids: XidGen,
}

impl Inner {
    fn send(&self, xid: u32, msg: &Message) {
        let Ok(buf) = msg.encode(xid) else {
            return;
        };
        if let Some(tx) = self.to_ctl.lock().as_ref() {
            let _ = tx.send(buf);
        }
    }

    /// Our HELLO, announcing the configured version.
    fn hello(&self) {
        let Ok(mut buf) = Message::Hello.encode(self.xids.next()) else {
            return;
        };
        buf[0] = self.cfg.version;
        if let Some(tx) = self.to_ctl.lock().as_ref() {
            let _ = tx.send(buf);
        }
    }

    fn features(&self) -> SwitchFeatures {
        SwitchFeatures {
            datapath_id: self.cfg.dpid.val(),
            n_buffers: 0,
            n_tables: self.cfg.n_tables,
            auxiliary_id: 0,
            capabilities: 0,
        }
    }

    fn handle(&self, env: Envelope) {
        let mut state = self.state.lock();
        match &env.msg {
            Message::FeaturesRequest => {
                self.send(env.xid, &Message::FeaturesReply(self.features()));
            }
            Message::MultipartRequest(MultipartRequest::PortDesc) => {
                let reply = MultipartReply::PortDesc { flags: 0, ports: self.cfg.ports.clone() };
                self.send(env.xid, &Message::MultipartReply(reply));
            }
            Message::EchoRequest(data) => {
                self.send(env.xid, &Message::EchoReply(data.clone()));
            }
            Message::BarrierRequest => self.send(env.xid, &Message::BarrierReply),
            Message::FlowMod(fm) => state.pipeline.apply(fm),
            Message::PacketOut(po) => self.packet_out(&mut state, po),
            _ => {}
        }
        state.received.push(env);
        self.cv.notify_all();
    }

    fn packet_out(&self, state: &mut State, po: &PacketOut) {
        for a in &po.actions {
            let Action::Output { port, .. } = a else {
                continue;
            };
            match *port {
                ports::TABLE => self.run(state, po.in_port, &po.data),
                ports::IN_PORT => self.transmit(state, po.in_port, &po.data),
                ports::CONTROLLER => {}
                p => self.transmit(state, p, &po.data),
            }
        }
    }

    /// Put `frame` on the wire out of `port`, letting an attached host
    /// answer it.
    fn transmit(&self, state: &mut State, port: u32, frame: &[u8]) {
        state.emitted.push((port, frame.to_vec()));

        let Some(req) = parse_arp(frame).filter(|a| a.request) else {
            return;
        };
        if state.mute {
            return;
        }
        let host = state.hosts.get(&req.tpa).copied();
        if let Some((hport, hmac)) = host.filter(|(p, _)| *p == port) {
            let reply = arp_reply(hmac, req.tpa, req.sha, req.spa);
            self.run(state, hport, &reply);
        }
    }

    fn run(&self, state: &mut State, in_port: u32, frame: &[u8]) {
        for v in state.pipeline.process(in_port, frame) {
            match v {
                Verdict::Controller { table, cookie, frame } => {
                    let pi = PacketIn::new(table, cookie, in_port, frame);
                    self.send(self.xids.next(), &Message::PacketIn(pi));
                }
                Verdict::Output { port, frame } => {
                    state.emitted.push((port, frame));
                }
            }
        }
    }
}

pub struct FakeDatapath {
    inner: Arc<Inner>,
}

impl FakeDatapath {
    /// Create a datapath and the controller connection attached to it.
    /// The datapath's HELLO is already waiting on the connection.
    pub fn connect(cfg: DatapathConfig) -> (Self, Arc<ChanConn>) {
        let (to_ctl, ctl_rx) = mpsc::channel();
        let (ctl_tx, from_ctl) = mpsc::channel();
        let conn = Arc::new(ChanConn::new(ctl_rx, ctl_tx));

        let inner = Arc::new(Inner {
            cfg,
            to_ctl: Mutex::new(Some(to_ctl)),
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
            xids: XidGen::default(),
        });
        inner.hello();

        let worker_inner = inner.clone();
        thread::Builder::new()
            .name("fake-datapath".to_string())
            .spawn(move || serve(worker_inner, from_ctl))
            .expect("spawn datapath thread");

        (Self { inner }, conn)
    }

    pub fn dpid(&self) -> Dpid {
        self.inner.cfg.dpid
    }

    /// Announce `msg` to the controller as if the switch sent it.
    pub fn send(&self, xid: u32, msg: &Message) {
        self.inner.send(xid, msg);
    }

    /// Hand the controller `buf` as is, bypassing the codec.
    pub fn send_raw(&self, buf: &[u8]) {
        if let Some(tx) = self.inner.to_ctl.lock().as_ref() {
            let _ = tx.send(buf.to_vec());
        }
    }

    /// Receive `frame` on `port`.
    pub fn inject(&self, port: u32, frame: &[u8]) {
        let mut state = self.inner.state.lock();
        self.inner.run(&mut state, port, frame);
    }

    /// Attach a host answering ARP for `ip` on `port`.
    pub fn add_host(&self, port: u32, ip: Ipv4Addr, mac: MacAddr) {
        self.inner.state.lock().hosts.insert(ip, (port, mac));
    }

    /// Stop hosts answering ARP.
    pub fn mute_hosts(&self, mute: bool) {
        self.inner.state.lock().mute = mute;
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.inner.state.lock().received.clone()
    }

    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.received()
            .into_iter()
            .filter_map(|e| match e.msg {
                Message::FlowMod(fm) => Some(fm),
                _ => None,
            })
            .collect()
    }

    pub fn packet_outs(&self) -> Vec<PacketOut> {
        self.received()
            .into_iter()
            .filter_map(|e| match e.msg {
                Message::PacketOut(po) => Some(po),
                _ => None,
            })
            .collect()
    }

    /// Flows currently installed in `table`.
    pub fn flows(&self, table: u8) -> Vec<FlowMod> {
        self.inner.state.lock().pipeline.table(table).into_iter().cloned().collect()
    }

    pub fn emitted(&self) -> Vec<(u32, Vec<u8>)> {
        self.inner.state.lock().emitted.clone()
    }

    /// Wait until `cond` holds over what the controller has sent, or
    /// `timeout` passes. Returns whether it held.
    pub fn wait_until<F>(&self, timeout: Duration, mut cond: F) -> bool
    where
        F: FnMut(&[Envelope]) -> bool,
    {
        let guard = self.inner.state.lock();
        let (_guard, timed_out) = self.inner.cv.wait_timeout_while(guard, timeout, |s| {
            !cond(&s.received)
        });
        !timed_out
    }

    /// The table that table 0 steers `eth_type` into, if any.
    pub fn steered_table(&self, eth_type: u16) -> Option<u8> {
        self.flows(0).into_iter().find_map(|fm| {
            if !fm.matches.fields.contains(&OxmField::EthType(eth_type)) {
                return None;
            }
            fm.instructions.iter().find_map(|i| match i {
                Instruction::GotoTable(t) => Some(*t),
                _ => None,
            })
        })
    }

    /// Wait until the flows installed in `table` satisfy `cond`.
    pub fn wait_flows<F>(&self, table: u8, timeout: Duration, mut cond: F) -> bool
    where
        F: FnMut(&[&FlowMod]) -> bool,
    {
        let guard = self.inner.state.lock();
        let (_guard, timed_out) = self.inner.cv.wait_timeout_while(guard, timeout, |s| {
            !cond(&s.pipeline.table(table))
        });
        !timed_out
    }

    /// Wait until the pipeline has transmitted a frame satisfying
    /// `cond`, returning it.
    pub fn wait_emitted<F>(&self, timeout: Duration, mut cond: F) -> Option<(u32, Vec<u8>)>
    where
        F: FnMut(u32, &[u8]) -> bool,
    {
        let mut found = None;
        let guard = self.inner.state.lock();
        let _ = self.inner.cv.wait_timeout_while(guard, timeout, |s| {
            found = s.emitted.iter().find(|(p, f)| cond(*p, f)).cloned();
            found.is_none()
        });
        found
    }

    /// Drop the connection from the switch's side.
    pub fn disconnect(&self) {
        self.inner.to_ctl.lock().take();
    }
}

impl Drop for FakeDatapath {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn serve(inner: Arc<Inner>, from_ctl: Receiver<Vec<u8>>) {
    while let Ok(buf) = from_ctl.recv() {
        match decode(&buf) {
            Ok(env) => inner.handle(env),
            Err(_) => continue,
        }
    }
}
