// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 routing with cut-through flows.
//!
//! Each route puts a rule in our table sending packets for its network
//! to the controller. When one arrives we pick the best route for its
//! destination, resolve the next hop (or the destination itself, for a
//! connected network), and pin a host flow for that destination which
//! rewrites the Ethernet header, decrements the TTL and forwards. Later
//! packets to the same host never reach the controller.

use super::AddressResolver;
use super::Mechanism;
use super::MechanismBase;
use super::MechanismContext;
use super::MechanismError;
use super::RouteContext;
use super::RoutingMechanism;
use super::claim_table;
use super::claimed_table;
use super::surrender_table;
use super::to_controller;
use crate::engine::conn::Envelope;
use crate::engine::conn::ResponseWriter;
use crate::engine::cookie::CookieFilter;
use crate::engine::driver::EthernetDriver;
use crate::engine::driver::Ipv4Driver;
use crate::engine::routing_table::RouteEntry;
use crate::engine::routing_table::RoutingTable;
use crate::engine::rpc::ProcRegistry;
use crate::ofp::Action;
use crate::ofp::ETHERTYPE_IPV4;
use crate::ofp::FlowMod;
use crate::ofp::Instruction;
use crate::ofp::Match;
use crate::ofp::Message;
use crate::ofp::NO_BUFFER;
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
use smoltcp::wire::EthernetProtocol;
use std::sync::Arc;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::MacAddr;

/// Table 0 priority of the rule steering IPv4 into our table.
const STEER_PRIORITY: u16 = 10;

/// Priority of per-route rules.
const ROUTE_PRIORITY: u16 = 15;

/// Priority of pinned host flows; above any route.
const HOST_PRIORITY: u16 = 25;

/// State the packet handler shares with the mechanism.
struct RoutingShared {
    link: Arc<EthernetDriver>,
    network: Arc<Ipv4Driver>,
    resolver: Arc<dyn AddressResolver>,
    routes: RoutingTable,
}

impl RoutingShared {
    fn route_match(network: Ipv4Cidr) -> Match {
        Match::from(vec![
            OxmField::EthType(ETHERTYPE_IPV4),
            OxmField::ipv4_dst(network),
        ])
    }

    /// The flow forwarding everything for `dst` along `route`.
    fn host_flow(
        table: u8,
        dst: Ipv4Addr,
        route: &RouteEntry,
        src_mac: MacAddr,
        dst_mac: MacAddr,
    ) -> FlowMod {
        FlowMod::add(
            table,
            HOST_PRIORITY,
            Match::from(vec![
                OxmField::EthType(ETHERTYPE_IPV4),
                OxmField::Ipv4Dst(dst, None),
            ]),
        )
        .with_instructions(vec![Instruction::ApplyActions(vec![
            Action::SetField(OxmField::EthDst(dst_mac)),
            Action::SetField(OxmField::EthSrc(src_mac)),
            Action::DecNwTtl,
            Action::output(route.port),
        ])])
    }

    fn handle_packet(
        &self,
        table: u8,
        rpc: &ProcRegistry,
        log: &Logger,
        w: &ResponseWriter,
        env: &Envelope,
    ) {
        let Message::PacketIn(pi) = &env.msg else {
            return;
        };

        let dst = match self.link.read_frame(&pi.data) {
            Ok((eth, payload)) if eth.ethertype == EthernetProtocol::Ipv4 => {
                match self.network.read_packet(payload) {
                    Ok(pkt) => Ipv4Addr::from(pkt.dst_addr()),
                    Err(e) => {
                        warn!(log, "failed to read ipv4 packet"; "error" => %e);
                        return;
                    }
                }
            }
            Ok(_) => return,
            Err(e) => {
                warn!(log, "failed to read frame"; "error" => %e);
                return;
            }
        };

        let Some(route) = self.routes.lookup(dst) else {
            debug!(log, "no route"; "dst" => %dst);
            return;
        };

        let src_mac = match rpc.link_addr(route.port) {
            Ok(mac) => mac,
            Err(e) => {
                error!(log, "no hardware address for egress port";
                    "port" => route.port,
                    "error" => %e,
                );
                return;
            }
        };

        let hop = route.next_hop.unwrap_or(dst);
        let dst_mac = match self.resolver.resolve(hop, route.port) {
            Ok(mac) => mac,
            Err(e) => {
                warn!(log, "failed to resolve next hop";
                    "dst" => %dst,
                    "next_hop" => %hop,
                    "error" => %e,
                );
                return;
            }
        };

        let flow = Self::host_flow(table, dst, &route, src_mac, dst_mac);
        // Once the flow is in, hand the packet back to the pipeline so
        // it takes the new path too.
        let resubmit = PacketOut {
            buffer_id: pi.buffer_id,
            in_port: pi.in_port().unwrap_or(ports::CONTROLLER),
            actions: vec![Action::output(ports::TABLE)],
            data: if pi.buffer_id == NO_BUFFER {
                pi.data.clone()
            } else {
                vec![]
            },
        };

        let res = w.send_all(&[
            Message::FlowMod(flow),
            Message::BarrierRequest,
            Message::PacketOut(resubmit),
        ]);
        if let Err(e) = res {
            error!(log, "failed to install host flow"; "dst" => %dst, "error" => %e);
            return;
        }

        debug!(log, "installed host flow";
            "dst" => %dst,
            "via" => %hop,
            "mac" => %dst_mac,
            "port" => route.port,
        );
    }
}

pub struct Ipv4RoutingMechanism {
    base: MechanismBase,
    shared: Arc<RoutingShared>,
    filter: RwLock<Option<Arc<CookieFilter>>>,
    table: Mutex<Option<u8>>,
    // One controller rule per routed network, with its cookie. Routes
    // sharing a network share the rule.
    rules: Mutex<Vec<(Ipv4Cidr, u64)>>,
}

impl Ipv4RoutingMechanism {
    pub const NAME: &'static str = "ipv4";

    pub fn new(
        link: Arc<EthernetDriver>,
        network: Arc<Ipv4Driver>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            base: MechanismBase::new(),
            shared: Arc::new(RoutingShared {
                link,
                network,
                resolver,
                routes: RoutingTable::new(),
            }),
            filter: RwLock::new(None),
            table: Mutex::new(None),
            rules: Mutex::new(vec![]),
        }
    }

    pub fn table(&self) -> Option<u8> {
        *self.table.lock()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.shared.routes
    }

    fn bound(
        &self,
    ) -> Result<(u8, Arc<MechanismContext>, Arc<CookieFilter>), MechanismError>
    {
        let not_enabled = || MechanismError::NotEnabled(Self::NAME.to_string());
        let table = claimed_table(Self::NAME, &self.table)?;
        let ctx = self.context().ok_or_else(not_enabled)?;
        let filter = self.filter.read().clone().ok_or_else(not_enabled)?;
        Ok((table, ctx, filter))
    }

    /// Send packets for `network` to the controller, unless a rule
    /// already does.
    fn install_rule(
        &self,
        table: u8,
        ctx: &MechanismContext,
        filter: &CookieFilter,
        network: Ipv4Cidr,
    ) -> Result<(), MechanismError> {
        let mut rules = self.rules.lock();
        if rules.iter().any(|(n, _)| *n == network) {
            return Ok(());
        }

        let mut fm =
            FlowMod::add(table, ROUTE_PRIORITY, RoutingShared::route_match(network))
                .with_instructions(to_controller());
        let (shared, rpc, log) =
            (self.shared.clone(), ctx.rpc.clone(), ctx.log.clone());
        let cookie = filter.filter_fn(&mut fm, move |w, env| {
            shared.handle_packet(table, &rpc, &log, w, env)
        });
        // Reserve the network before sending, then let go of the lock.
        rules.push((network, cookie));
        drop(rules);

        if let Err(e) = ctx.conn().send_all(&[Message::FlowMod(fm)]) {
            self.rules.lock().retain(|r| *r != (network, cookie));
            filter.release_cookie(cookie);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Mechanism for Ipv4RoutingMechanism {
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
        let table = claim_table(ctx, ETHERTYPE_IPV4, STEER_PRIORITY).inspect_err(|e| {
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
        self.rules.lock().clear();
        let table = self.table.lock().take();
        if let Some(table) = table {
            surrender_table(ctx, ETHERTYPE_IPV4, STEER_PRIORITY, table)?;
        }
        info!(ctx.log, "mechanism disabled"; "mechanism" => Self::NAME);
        Ok(())
    }
}

impl RoutingMechanism for Ipv4RoutingMechanism {
    fn update_route(&self, rctx: &RouteContext) -> Result<(), MechanismError> {
        let (table, ctx, filter) = self.bound()?;
        self.install_rule(table, &ctx, &filter, rctx.network)?;
        self.shared.routes.insert(RouteEntry::new(
            rctx.route_type,
            rctx.network,
            rctx.next_hop,
            rctx.metric,
            rctx.port,
        ));

        // Host flows carry no cookie. Those under this network were
        // pinned by whichever route won before, so let them re-pin.
        let fm = FlowMod::flow_flush(table, RoutingShared::route_match(rctx.network))
            .with_cookie_mask(0, u64::MAX);
        ctx.conn().send_all(&[Message::FlowMod(fm)])?;

        info!(ctx.log, "route added";
            "mechanism" => Self::NAME,
            "type" => %rctx.route_type,
            "network" => %rctx.network,
            "next_hop" => ?rctx.next_hop,
            "port" => rctx.port,
        );
        Ok(())
    }

    fn delete_route(&self, rctx: &RouteContext) -> Result<(), MechanismError> {
        let (table, ctx, filter) = self.bound()?;

        let evicted = self.shared.routes.evict(rctx.network, rctx.port, rctx.next_hop);
        if evicted.is_empty() {
            info!(ctx.log, "no route to delete";
                "mechanism" => Self::NAME,
                "network" => %rctx.network,
                "port" => rctx.port,
            );
            return Ok(());
        }

        // The flush is non-strict: it takes the host flows pinned under
        // this network, and the rules of any network inside it.
        let fm = FlowMod::flow_flush(table, RoutingShared::route_match(rctx.network));
        ctx.conn().send_all(&[Message::FlowMod(fm)])?;
        {
            let mut rules = self.rules.lock();
            rules.retain(|(n, cookie)| {
                if rctx.network.contains(n) {
                    filter.release_cookie(*cookie);
                    return false;
                }
                true
            });
        }

        // Put back the rules of the routes that are left.
        let survivors: Vec<Ipv4Cidr> = self
            .shared
            .routes
            .entries()
            .into_iter()
            .map(|e| e.network)
            .filter(|n| rctx.network.contains(n))
            .collect();
        for network in survivors {
            self.install_rule(table, &ctx, &filter, network)?;
        }

        info!(ctx.log, "route deleted";
            "mechanism" => Self::NAME,
            "network" => %rctx.network,
            "port" => rctx.port,
        );
        Ok(())
    }

    fn routes(&self) -> Vec<RouteEntry> {
        self.shared.routes.entries()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::conn::Conn;
    use crate::engine::conn::ConnError;
    use crate::engine::mechanism::ResolveError;
    use crate::engine::switch::Switch;
    use crate::ofp::SwitchFeatures;
    use crate::sync::Condvar;
    use std::thread;
    use std::time::Duration;
    use switchyard_api::RouteType;

    #[derive(Default)]
    struct Gate {
        closed: bool,
        fail_next: bool,
        flushing: usize,
        route_rules: usize,
    }

    /// A connection whose flushes park while the gate is closed.
    struct GateConn {
        gate: Mutex<Gate>,
        cv: Condvar,
    }

    impl GateConn {
        fn new() -> Arc<Self> {
            Arc::new(Self { gate: Mutex::default(), cv: Condvar::new() })
        }

        fn set_closed(&self, closed: bool) {
            self.gate.lock().closed = closed;
            self.cv.notify_all();
        }

        /// Wait for `n` flushes to be parked at the gate.
        fn wait_flushing(&self, n: usize) -> bool {
            let (_gate, timed_out) = self.cv.wait_timeout_while(
                self.gate.lock(),
                Duration::from_secs(2),
                |g| g.flushing < n,
            );
            !timed_out
        }
    }

    impl Conn for GateConn {
        fn receive(&self) -> Result<Envelope, ConnError> {
            Err(ConnError::Closed)
        }

        fn send_xid(&self, _: u32, msg: &Message) -> Result<(), ConnError> {
            if let Message::FlowMod(fm) = msg {
                if fm.priority == ROUTE_PRIORITY {
                    self.gate.lock().route_rules += 1;
                }
            }
            Ok(())
        }

        fn flush(&self) -> Result<(), ConnError> {
            let mut gate = self.gate.lock();
            if gate.fail_next {
                gate.fail_next = false;
                return Err(ConnError::Closed);
            }
            gate.flushing += 1;
            self.cv.notify_all();
            let (mut gate, _) = self.cv.wait_timeout_while(
                gate,
                Duration::from_secs(5),
                |g| g.closed,
            );
            gate.flushing -= 1;
            Ok(())
        }

        fn next_xid(&self) -> u32 {
            1
        }

        fn close(&self) {}
    }

    struct NoResolver;

    impl AddressResolver for NoResolver {
        fn resolve(&self, _: Ipv4Addr, _: u32) -> Result<MacAddr, ResolveError> {
            Err(ResolveError::NotActive)
        }
    }

    fn activated(conn: &Arc<GateConn>) -> Ipv4RoutingMechanism {
        let features = SwitchFeatures {
            datapath_id: 0x42,
            n_tables: 4,
            ..Default::default()
        };
        let sw = Arc::new(Switch::new(conn.clone(), 4, features, vec![]));
        let log = Logger::root(slog::Discard, slog::o!());
        let ctx = Arc::new(MechanismContext::new(sw.clone(), &log));
        let mech = Ipv4RoutingMechanism::new(
            Arc::new(EthernetDriver::new(sw)),
            Arc::new(Ipv4Driver::new()),
            Arc::new(NoResolver),
        );
        mech.enable(&ctx).unwrap();
        mech.activate().unwrap();
        mech
    }

    fn route(network: &str) -> RouteContext {
        RouteContext {
            route_type: RouteType::Static,
            network: network.parse().unwrap(),
            next_hop: None,
            metric: 0,
            port: 1,
        }
    }

    #[test]
    fn rule_sends_run_side_by_side() {
        let conn = GateConn::new();
        let mech = activated(&conn);
        conn.set_closed(true);

        thread::scope(|s| {
            let a = s.spawn(|| mech.update_route(&route("10.1.0.0/16")));
            let b = s.spawn(|| mech.update_route(&route("10.2.0.0/16")));
            let both_sending = conn.wait_flushing(2);
            conn.set_closed(false);
            assert!(a.join().unwrap().is_ok());
            assert!(b.join().unwrap().is_ok());
            assert!(both_sending);
        });

        assert_eq!(mech.routes().len(), 2);
        assert_eq!(mech.rules.lock().len(), 2);
    }

    #[test]
    fn failed_send_frees_the_network() {
        let conn = GateConn::new();
        let mech = activated(&conn);

        conn.gate.lock().fail_next = true;
        assert!(mech.update_route(&route("10.1.0.0/16")).is_err());
        assert!(mech.rules.lock().is_empty());
        assert!(mech.routes().is_empty());

        mech.update_route(&route("10.1.0.0/16")).unwrap();
        assert_eq!(mech.rules.lock().len(), 1);
        assert_eq!(conn.gate.lock().route_rules, 2);
    }
}
