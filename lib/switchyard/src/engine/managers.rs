// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-category managers.
//!
//! Each wraps the [`MechanismManager`] of its category with the
//! operations that category exists for. Configuration changes are only
//! passed to activated mechanisms, and the first mechanism to fail
//! aborts the change: later mechanisms, and later entries of the same
//! request, are not attempted.

use super::driver::EthernetDriver;
use super::driver::Ipv4Driver;
use super::mechanism::ExtensionMechanism;
use super::mechanism::LinkMechanism;
use super::mechanism::MechanismManager;
use super::mechanism::NetworkContext;
use super::mechanism::NetworkMechanism;
use super::mechanism::RouteContext;
use super::mechanism::RoutingMechanism;
use super::routing_table::RouteEntry;
use crate::error::Result;
use crate::persist::MODEL_NETWORK;
use crate::persist::MODEL_ROUTE;
use crate::persist::Persister;
use crate::persist::load_as;
use crate::persist::store_as;
use crate::sync::Mutex;
use slog::Logger;
use slog::debug;
use slog::info;
use std::sync::Arc;
use switchyard_api::Dpid;
use switchyard_api::Ipv4Cidr;
use switchyard_api::NeighEntryDump;
use switchyard_api::NetworkManagerContext;
use switchyard_api::NetworkPort;
use switchyard_api::Route;
use switchyard_api::RouteType;
use switchyard_api::RoutingManagerContext;

pub struct LinkManager {
    mechs: MechanismManager<dyn LinkMechanism>,
    driver: Arc<EthernetDriver>,
}

impl LinkManager {
    pub fn new(mechs: MechanismManager<dyn LinkMechanism>, driver: Arc<EthernetDriver>) -> Self {
        Self { mechs, driver }
    }

    pub fn mechanisms(&self) -> &MechanismManager<dyn LinkMechanism> {
        &self.mechs
    }

    pub fn driver(&self) -> &Arc<EthernetDriver> {
        &self.driver
    }
}

pub struct ExtensionManager {
    mechs: MechanismManager<dyn ExtensionMechanism>,
}

impl ExtensionManager {
    pub fn new(mechs: MechanismManager<dyn ExtensionMechanism>) -> Self {
        Self { mechs }
    }

    pub fn mechanisms(&self) -> &MechanismManager<dyn ExtensionMechanism> {
        &self.mechs
    }

    pub fn update_network(&self, nctx: &NetworkContext) -> Result<()> {
        for m in self.mechs.activated() {
            m.update_network(nctx)?;
        }
        Ok(())
    }

    pub fn delete_network(&self, nctx: &NetworkContext) -> Result<()> {
        for m in self.mechs.activated() {
            m.delete_network(nctx)?;
        }
        Ok(())
    }
}

pub struct RoutingManager {
    mechs: MechanismManager<dyn RoutingMechanism>,
    network: Arc<Ipv4Driver>,
    persist: Arc<dyn Persister>,
    dpid: Dpid,
    ctx: Mutex<RoutingManagerContext>,
    log: Logger,
}

impl RoutingManager {
    pub fn new(
        mechs: MechanismManager<dyn RoutingMechanism>,
        network: Arc<Ipv4Driver>,
        persist: Arc<dyn Persister>,
        dpid: Dpid,
        log: &Logger,
    ) -> Self {
        Self {
            mechs,
            network,
            persist,
            dpid,
            ctx: Mutex::new(RoutingManagerContext::new(dpid)),
            log: log.new(slog::o!("unit" => "routing")),
        }
    }

    pub fn mechanisms(&self) -> &MechanismManager<dyn RoutingMechanism> {
        &self.mechs
    }

    fn route_context(&self, r: &Route) -> Result<RouteContext> {
        let network = self.network.parse_addr(&r.network)?.network();
        let next_hop = match &r.next_hop {
            Some(nh) => Some(self.network.parse_addr(nh)?.addr()),
            None => None,
        };
        Ok(RouteContext {
            route_type: r.route_type,
            network,
            next_hop,
            metric: r.metric,
            port: r.port,
        })
    }

    fn add(&self, rctx: &RouteContext) -> Result<()> {
        for m in self.mechs.activated() {
            m.update_route(rctx)?;
        }
        Ok(())
    }

    fn remove(&self, rctx: &RouteContext) -> Result<()> {
        for m in self.mechs.activated() {
            m.delete_route(rctx)?;
        }
        Ok(())
    }

    /// Install every route in `req`, and remember them.
    pub fn update_routes(&self, req: &RoutingManagerContext) -> Result<()> {
        let res: Result<()> = req.routes.iter().try_for_each(|r| {
            self.add(&self.route_context(r)?)?;
            self.ctx.lock().set_route(r.clone());
            Ok(())
        });
        self.store()?;
        res
    }

    /// Remove every route in `req`, and forget them.
    pub fn delete_routes(&self, req: &RoutingManagerContext) -> Result<()> {
        let res: Result<()> = req.routes.iter().try_for_each(|r| {
            self.remove(&self.route_context(r)?)?;
            self.ctx.lock().del_route(r);
            Ok(())
        });
        self.store()?;
        res
    }

    /// The route to a directly attached network. Not persisted: it
    /// comes and goes with the network address.
    pub(crate) fn add_connected(&self, network: Ipv4Cidr, port: u32) -> Result<()> {
        self.add(&connected(network, port))
    }

    pub(crate) fn remove_connected(&self, network: Ipv4Cidr, port: u32) -> Result<()> {
        self.remove(&connected(network, port))
    }

    pub fn context(&self) -> RoutingManagerContext {
        self.ctx.lock().clone()
    }

    /// The routing tables of every mechanism, concatenated.
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.mechs.iter().flat_map(|m| m.routes()).collect()
    }

    fn store(&self) -> Result<()> {
        let ctx = self.context();
        store_as(&*self.persist, self.dpid, MODEL_ROUTE, &ctx)?;
        Ok(())
    }

    /// Apply whatever was stored for this datapath.
    pub fn replay(&self) -> Result<()> {
        let Some(stored) =
            load_as::<RoutingManagerContext>(&*self.persist, self.dpid, MODEL_ROUTE)?
        else {
            debug!(self.log, "no stored routes");
            return Ok(());
        };

        info!(self.log, "replaying routes"; "count" => stored.routes.len());
        self.update_routes(&stored)
    }
}

fn connected(network: Ipv4Cidr, port: u32) -> RouteContext {
    RouteContext {
        route_type: RouteType::Connected,
        network,
        next_hop: None,
        metric: 0,
        port,
    }
}

pub struct NetworkManager {
    mechs: MechanismManager<dyn NetworkMechanism>,
    link: Arc<EthernetDriver>,
    network: Arc<Ipv4Driver>,
    routing: Arc<RoutingManager>,
    extension: Arc<ExtensionManager>,
    persist: Arc<dyn Persister>,
    dpid: Dpid,
    ctx: Mutex<NetworkManagerContext>,
    log: Logger,
}

/// Everything a [`NetworkManager`] coordinates with.
pub struct NetworkDeps {
    pub link: Arc<EthernetDriver>,
    pub network: Arc<Ipv4Driver>,
    pub routing: Arc<RoutingManager>,
    pub extension: Arc<ExtensionManager>,
    pub persist: Arc<dyn Persister>,
}

impl NetworkManager {
    pub fn new(
        mechs: MechanismManager<dyn NetworkMechanism>,
        deps: NetworkDeps,
        dpid: Dpid,
        log: &Logger,
    ) -> Self {
        let mut ctx = NetworkManagerContext::new(dpid);
        ctx.driver = Ipv4Driver::NAME.to_string();
        Self {
            mechs,
            link: deps.link,
            network: deps.network,
            routing: deps.routing,
            extension: deps.extension,
            persist: deps.persist,
            dpid,
            ctx: Mutex::new(ctx),
            log: log.new(slog::o!("unit" => "network")),
        }
    }

    pub fn mechanisms(&self) -> &MechanismManager<dyn NetworkMechanism> {
        &self.mechs
    }

    fn network_context(&self, p: &NetworkPort) -> Result<NetworkContext> {
        let addr = self.network.parse_addr(&p.address)?;
        let link_addr = self.link.addr(p.port)?;
        Ok(NetworkContext { addr, link_addr, port: p.port })
    }

    fn add(&self, p: &NetworkPort) -> Result<()> {
        let nctx = self.network_context(p)?;
        self.network.update_addr(p.port, nctx.addr);
        for m in self.mechs.activated() {
            m.update_network(&nctx)?;
        }
        self.extension.update_network(&nctx)?;
        self.routing.add_connected(nctx.addr.network(), p.port)?;

        info!(self.log, "network address assigned";
            "addr" => %nctx.addr,
            "port" => p.port,
        );
        Ok(())
    }

    fn remove(&self, p: &NetworkPort) -> Result<()> {
        let nctx = self.network_context(p)?;
        for m in self.mechs.activated() {
            m.delete_network(&nctx)?;
        }
        self.extension.delete_network(&nctx)?;
        self.routing.remove_connected(nctx.addr.network(), p.port)?;
        self.network.delete_addr(p.port);

        info!(self.log, "network address removed";
            "addr" => %nctx.addr,
            "port" => p.port,
        );
        Ok(())
    }

    pub fn update_networks(&self, req: &NetworkManagerContext) -> Result<()> {
        let res: Result<()> = req.ports.iter().try_for_each(|p| {
            let prev = self.ctx.lock().port(p.port).cloned();
            if let Some(prev) = prev.filter(|prev| prev.address != p.address) {
                self.remove(&prev)?;
                self.ctx.lock().del_port(prev.port);
            }
            self.add(p)?;
            self.ctx.lock().set_port(p.clone());
            Ok(())
        });
        self.store()?;
        res
    }

    pub fn delete_networks(&self, req: &NetworkManagerContext) -> Result<()> {
        let res: Result<()> = req.ports.iter().try_for_each(|p| {
            self.remove(p)?;
            self.ctx.lock().del_port(p.port);
            Ok(())
        });
        self.store()?;
        res
    }

    pub fn context(&self) -> NetworkManagerContext {
        self.ctx.lock().clone()
    }

    pub fn neighbors(&self) -> Vec<NeighEntryDump> {
        self.mechs.iter().flat_map(|m| m.neighbors()).collect()
    }

    fn store(&self) -> Result<()> {
        let ctx = self.context();
        store_as(&*self.persist, self.dpid, MODEL_NETWORK, &ctx)?;
        Ok(())
    }

    pub fn replay(&self) -> Result<()> {
        let Some(stored) =
            load_as::<NetworkManagerContext>(&*self.persist, self.dpid, MODEL_NETWORK)?
        else {
            debug!(self.log, "no stored networks");
            return Ok(());
        };

        info!(self.log, "replaying networks"; "count" => stored.ports.len());
        self.update_networks(&stored)
    }
}
