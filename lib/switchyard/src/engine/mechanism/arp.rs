// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ARP: answering for our own addresses and resolving others'.
//!
//! On activation ARP claims a table and steers all ARP traffic into it.
//! Each network address assigned to a port adds two rules there, both
//! sending to the controller: requests asking for that address, and
//! replies addressed to the port's hardware address. Requests are
//! answered; everything observed feeds the neighbor table.
//!
//! Resolution ([`AddressResolver::resolve`]) answers from the neighbor
//! table when it can. Otherwise it broadcasts one request per address,
//! however many callers are asking, and waits for the reply handler to
//! release it, for at most the configured timeout.

use super::AddressResolver;
use super::Mechanism;
use super::MechanismBase;
use super::MechanismContext;
use super::MechanismError;
use super::NetworkContext;
use super::NetworkMechanism;
use super::ResolveError;
use super::claim_table;
use super::claimed_table;
use super::surrender_table;
use super::to_controller;
use crate::engine::conn::Envelope;
use crate::engine::conn::ResponseWriter;
use crate::engine::cookie::CookieFilter;
use crate::engine::driver::DriverError;
use crate::engine::driver::EthernetDriver;
use crate::engine::neigh::NeighTable;
use crate::engine::pending::PendingTracker;
use crate::engine::rpc::ProcRegistry;
use crate::ofp::ARP_OP_REPLY;
use crate::ofp::ARP_OP_REQUEST;
use crate::ofp::Action;
use crate::ofp::ETHERTYPE_ARP;
use crate::ofp::FlowMod;
use crate::ofp::Match;
use crate::ofp::Message;
use crate::ofp::OxmField;
use crate::ofp::PacketOut;
use crate::ofp::ports;
use crate::sync::Mutex;
use crate::sync::RwLock;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_api::Ipv4Addr;
use switchyard_api::MacAddr;
use switchyard_api::NeighEntryDump;

/// Table 0 priority of the rule steering ARP into our table.
const STEER_PRIORITY: u16 = 20;

/// Priority of the per-address rules in our table.
const RULE_PRIORITY: u16 = 2;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// The fields of an Ethernet/IPv4 ARP packet we look at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ArpView {
    op: ArpOperation,
    sha: MacAddr,
    spa: Ipv4Addr,
    tpa: Ipv4Addr,
}

/// State the packet handlers share with the mechanism.
struct ArpShared {
    link: Arc<EthernetDriver>,
    neigh: NeighTable,
    pending: PendingTracker,
}

impl ArpShared {
    fn read(&self, frame: &[u8]) -> Result<Option<ArpView>, DriverError> {
        let malformed = |err| DriverError::Malformed { what: "arp", err };
        let (eth, payload) = self.link.read_frame(frame)?;
        if eth.ethertype != EthernetProtocol::Arp {
            return Ok(None);
        }

        let pkt = ArpPacket::new_checked(payload).map_err(malformed)?;
        let repr = ArpRepr::parse(&pkt).map_err(malformed)?;
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            return Ok(None);
        };

        Ok(Some(ArpView {
            op: operation,
            sha: source_hardware_addr.into(),
            spa: source_protocol_addr.into(),
            tpa: target_protocol_addr.into(),
        }))
    }

    fn frame(&self, dst: MacAddr, arp: &ArpRepr) -> Vec<u8> {
        let ArpRepr::EthernetIpv4 { source_hardware_addr, .. } = *arp else {
            return vec![];
        };
        let eth = EthernetRepr {
            src_addr: source_hardware_addr,
            dst_addr: dst.into(),
            ethertype: EthernetProtocol::Arp,
        };
        self.link.write_frame(&eth, arp.buffer_len(), |buf| {
            arp.emit(&mut ArpPacket::new_unchecked(buf))
        })
    }

    /// Pull the ARP packet and ingress port out of a PACKET_IN.
    fn packet_in(&self, log: &Logger, env: &Envelope) -> Option<(u32, ArpView)> {
        let Message::PacketIn(pi) = &env.msg else {
            return None;
        };

        let Some(port) = pi.in_port() else {
            warn!(log, "packet in without in_port"; "xid" => env.xid);
            return None;
        };

        match self.read(&pi.data) {
            Ok(Some(view)) => Some((port, view)),
            Ok(None) => None,
            Err(e) => {
                warn!(log, "failed to read arp packet"; "error" => %e);
                None
            }
        }
    }

    /// Answer a request for one of our addresses, learning the asker
    /// along the way.
    fn handle_request(
        &self,
        rpc: &ProcRegistry,
        log: &Logger,
        w: &ResponseWriter,
        env: &Envelope,
    ) {
        let Some((port, req)) = self.packet_in(log, env) else {
            return;
        };
        if req.op != ArpOperation::Request {
            return;
        }

        self.neigh.populate(req.spa, req.sha, port);

        let local = match rpc.link_addr(port) {
            Ok(mac) => mac,
            Err(e) => {
                error!(log, "no hardware address for port";
                    "port" => port,
                    "error" => %e,
                );
                return;
            }
        };

        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: local.into(),
            source_protocol_addr: req.tpa.into(),
            target_hardware_addr: req.sha.into(),
            target_protocol_addr: req.spa.into(),
        };
        let po = PacketOut::new(
            port,
            vec![Action::output(ports::IN_PORT)],
            self.frame(req.sha, &reply),
        );

        if let Err(e) = w.send_all(&[Message::PacketOut(po)]) {
            error!(log, "failed to send arp reply"; "error" => %e);
            return;
        }
        debug!(log, "answered arp request";
            "addr" => %req.tpa,
            "asker" => %req.spa,
            "port" => port,
        );
    }

    /// Learn the answer to one of our requests and wake its waiters.
    fn handle_reply(&self, log: &Logger, env: &Envelope) {
        let Some((port, rep)) = self.packet_in(log, env) else {
            return;
        };
        if rep.op != ArpOperation::Reply {
            return;
        }

        self.neigh.populate(rep.spa, rep.sha, port);
        let woken = self.pending.release(rep.spa);
        debug!(log, "learned neighbor";
            "addr" => %rep.spa,
            "mac" => %rep.sha,
            "port" => port,
            "woken" => woken,
        );
    }
}

pub struct ArpMechanism {
    base: MechanismBase,
    shared: Arc<ArpShared>,
    filter: RwLock<Option<Arc<CookieFilter>>>,
    table: Mutex<Option<u8>>,
    timeout: Duration,
}

impl ArpMechanism {
    pub const NAME: &'static str = "arp";

    pub fn new(link: Arc<EthernetDriver>, timeout: Duration) -> Self {
        Self {
            base: MechanismBase::new(),
            shared: Arc::new(ArpShared {
                link,
                neigh: NeighTable::new(),
                pending: PendingTracker::new(),
            }),
            filter: RwLock::new(None),
            table: Mutex::new(None),
            timeout,
        }
    }

    pub fn neigh(&self) -> &NeighTable {
        &self.shared.neigh
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.shared.pending
    }

    pub fn table(&self) -> Option<u8> {
        *self.table.lock()
    }

    fn request_match(nctx: &NetworkContext) -> Match {
        Match::from(vec![
            OxmField::EthType(ETHERTYPE_ARP),
            OxmField::ArpOp(ARP_OP_REQUEST),
            OxmField::ArpTha(MacAddr::ZERO),
            OxmField::ArpTpa(nctx.addr.addr(), None),
        ])
    }

    fn reply_match(nctx: &NetworkContext) -> Match {
        Match::from(vec![
            OxmField::EthType(ETHERTYPE_ARP),
            OxmField::EthDst(nctx.link_addr),
            OxmField::ArpOp(ARP_OP_REPLY),
            OxmField::ArpTpa(nctx.addr.addr(), None),
        ])
    }

    fn filter(&self) -> Result<Arc<CookieFilter>, MechanismError> {
        self.filter
            .read()
            .clone()
            .ok_or_else(|| MechanismError::NotEnabled(Self::NAME.to_string()))
    }

    fn broadcast_request(
        &self,
        ctx: &MechanismContext,
        addr: Ipv4Addr,
        port: u32,
    ) -> Result<(), ResolveError> {
        let local_mac = ctx.rpc.link_addr(port)?;
        let local_ip = ctx.rpc.network_addr(port)?.addr();

        let req = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: local_mac.into(),
            source_protocol_addr: local_ip.into(),
            target_hardware_addr: MacAddr::ZERO.into(),
            target_protocol_addr: addr.into(),
        };
        let po = PacketOut::new(
            ports::CONTROLLER,
            vec![Action::output(port)],
            self.shared.frame(MacAddr::BROADCAST, &req),
        );
        ctx.conn().send_all(&[Message::PacketOut(po)])?;

        debug!(ctx.log, "sent arp request";
            "mechanism" => Self::NAME,
            "addr" => %addr,
            "port" => port,
        );
        Ok(())
    }
}

impl Mechanism for ArpMechanism {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &MechanismBase {
        &self.base
    }

    fn on_enable(&self, ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        let filter = Arc::new(CookieFilter::packet_in(ctx.cookies.clone()));
        self.base.track(filter.attach(&ctx.mux));
        *self.filter.write() = Some(filter);
        info!(ctx.log, "mechanism enabled"; "mechanism" => Self::NAME);
        Ok(())
    }

    fn on_activate(&self, ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        let table = claim_table(ctx, ETHERTYPE_ARP, STEER_PRIORITY).inspect_err(|e| {
            error!(ctx.log, "failed to claim table";
                "mechanism" => Self::NAME,
                "error" => %e,
            );
        })?;
        *self.table.lock() = Some(table);
        info!(ctx.log, "mechanism activated";
            "mechanism" => Self::NAME,
            "table" => table,
        );
        Ok(())
    }

    fn on_disable(
        &self,
        ctx: &Arc<MechanismContext>,
        _was: super::Lifecycle,
    ) -> Result<(), MechanismError> {
        self.filter.write().take();
        let table = self.table.lock().take();
        if let Some(table) = table {
            surrender_table(ctx, ETHERTYPE_ARP, STEER_PRIORITY, table)?;
        }
        info!(ctx.log, "mechanism disabled"; "mechanism" => Self::NAME);
        Ok(())
    }
}

impl NetworkMechanism for ArpMechanism {
    fn update_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError> {
        let table = claimed_table(Self::NAME, &self.table)?;
        let filter = self.filter()?;
        let ctx = self
            .context()
            .ok_or_else(|| MechanismError::NotEnabled(Self::NAME.to_string()))?;

        let mut req = FlowMod::add(table, RULE_PRIORITY, Self::request_match(nctx))
            .with_instructions(to_controller());
        let (shared, rpc, log) =
            (self.shared.clone(), ctx.rpc.clone(), ctx.log.clone());
        filter.filter_fn(&mut req, move |w, env| {
            shared.handle_request(&rpc, &log, w, env)
        });

        let mut rep = FlowMod::add(table, RULE_PRIORITY, Self::reply_match(nctx))
            .with_instructions(to_controller());
        let (shared, log) = (self.shared.clone(), ctx.log.clone());
        filter.filter_fn(&mut rep, move |_, env| shared.handle_reply(&log, env));

        ctx.conn().send_all(&[Message::FlowMod(req), Message::FlowMod(rep)])?;
        info!(ctx.log, "answering arp";
            "mechanism" => Self::NAME,
            "addr" => %nctx.addr,
            "port" => nctx.port,
        );
        Ok(())
    }

    fn delete_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError> {
        let table = claimed_table(Self::NAME, &self.table)?;
        let ctx = self
            .context()
            .ok_or_else(|| MechanismError::NotEnabled(Self::NAME.to_string()))?;

        ctx.conn().send_all(&[
            Message::FlowMod(FlowMod::flow_flush(table, Self::request_match(nctx))),
            Message::FlowMod(FlowMod::flow_flush(table, Self::reply_match(nctx))),
        ])?;
        self.shared.neigh.flush_port(nctx.port);
        Ok(())
    }

    fn resolver(self: Arc<Self>) -> Option<Arc<dyn AddressResolver>> {
        Some(self)
    }

    fn neighbors(&self) -> Vec<NeighEntryDump> {
        self.shared.neigh.dump()
    }
}

impl AddressResolver for ArpMechanism {
    fn resolve(&self, addr: Ipv4Addr, port: u32) -> Result<MacAddr, ResolveError> {
        if let Some(e) = self.shared.neigh.lookup(addr) {
            return Ok(e.link_addr);
        }

        let ctx = self.context().ok_or(ResolveError::NotActive)?;
        let pending = &self.shared.pending;
        let token = pending.register(addr);

        // A reply may have landed between the miss and registering.
        if let Some(e) = self.shared.neigh.lookup(addr) {
            pending.release(addr);
            return Ok(e.link_addr);
        }

        if token.is_first() {
            if let Err(e) = self.broadcast_request(&ctx, addr, port) {
                // No request went out, so wake everyone queued behind us.
                pending.release(addr);
                return Err(e);
            }
        }

        if !pending.wait(token, self.timeout) {
            warn!(ctx.log, "arp resolution timed out";
                "mechanism" => Self::NAME,
                "addr" => %addr,
            );
            return Err(ResolveError::Timeout(addr));
        }

        self.shared
            .neigh
            .lookup(addr)
            .map(|e| e.link_addr)
            .ok_or(ResolveError::Unresolved(addr))
    }
}
