// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The set of connected switches.
//!
//! [`SwitchManager::create_switch`] takes a fresh connection through the
//! handshake, builds and brings up a mechanism of every registered kind
//! for it, records it under its datapath ID and then dispatches its
//! messages on a dedicated thread until the connection drops.

use super::conn::Conn;
use super::conn::ConnError;
use super::conn::ResponseWriter;
use super::driver::EthernetDriver;
use super::driver::Ipv4Driver;
use super::managers::ExtensionManager;
use super::managers::LinkManager;
use super::managers::NetworkDeps;
use super::managers::NetworkManager;
use super::managers::RoutingManager;
use super::mechanism::MechanismContext;
use super::mechanism::arp;
use super::mechanism::manager::log_outcomes;
use super::switch::Switch;
use super::switch::SwitchError;
use crate::error::Result;
use crate::ofp::Message;
use crate::persist::Persister;
use crate::registry::MechanismDeps;
use crate::registry::MechanismRegistry;
use crate::sync::RwLock;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use switchyard_api::Dpid;

/// One connected switch and everything bound to it.
pub struct SwitchContext {
    pub switch: Arc<Switch>,
    pub ctx: Arc<MechanismContext>,
    pub link: Arc<LinkManager>,
    pub network: Arc<NetworkManager>,
    pub routing: Arc<RoutingManager>,
    pub extension: Arc<ExtensionManager>,
}

impl SwitchContext {
    pub fn dpid(&self) -> Dpid {
        self.switch.datapath_id()
    }

    /// Bring every mechanism up: all are enabled before any is
    /// activated, link first, extensions last.
    fn start(&self, log: &Logger) {
        log_outcomes(log, "enable", &self.link.mechanisms().enable(&self.ctx));
        log_outcomes(log, "enable", &self.network.mechanisms().enable(&self.ctx));
        log_outcomes(log, "enable", &self.routing.mechanisms().enable(&self.ctx));
        log_outcomes(log, "enable", &self.extension.mechanisms().enable(&self.ctx));

        log_outcomes(log, "activate", &self.link.mechanisms().activate());
        log_outcomes(log, "activate", &self.network.mechanisms().activate());
        log_outcomes(log, "activate", &self.routing.mechanisms().activate());
        log_outcomes(log, "activate", &self.extension.mechanisms().activate());
    }

    /// Let go of the switch without talking to it.
    fn teardown(&self) {
        self.extension.mechanisms().detach();
        self.routing.mechanisms().detach();
        self.network.mechanisms().detach();
        self.link.mechanisms().detach();
        self.switch.conn().close();
    }
}

pub struct SwitchManager {
    registry: MechanismRegistry,
    persist: Arc<dyn Persister>,
    switches: RwLock<BTreeMap<Dpid, Arc<SwitchContext>>>,
    arp_timeout: Duration,
    log: Logger,
}

impl SwitchManager {
    pub fn new(
        registry: MechanismRegistry,
        persist: Arc<dyn Persister>,
        log: &Logger,
    ) -> Self {
        Self {
            registry,
            persist,
            switches: RwLock::new(BTreeMap::new()),
            arp_timeout: arp::DEFAULT_TIMEOUT,
            log: log.new(slog::o!("unit" => "switch-manager")),
        }
    }

    pub fn with_arp_timeout(mut self, timeout: Duration) -> Self {
        self.arp_timeout = timeout;
        self
    }

    pub fn persister(&self) -> &Arc<dyn Persister> {
        &self.persist
    }

    /// Boot the switch on the other end of `conn` and start serving it.
    pub fn create_switch(
        self: &Arc<Self>,
        conn: Arc<dyn Conn>,
    ) -> Result<Arc<SwitchContext>> {
        let hello = conn.receive()?;
        if hello.msg != Message::Hello {
            debug!(self.log, "first message is not a hello";
                "type" => %hello.msg.msg_type());
        }

        let ctor = self
            .registry
            .switch_ctor(hello.version)
            .ok_or(SwitchError::UnknownVersion(hello.version))?;
        let switch = ctor(conn, hello.version, &self.log)?;
        let sc = Arc::new(self.assemble(switch)?);
        let dpid = sc.dpid();

        sc.start(&sc.ctx.log);

        let prev = self.switches.write().insert(dpid, sc.clone());
        if let Some(prev) = prev {
            warn!(self.log, "switch reconnected, replacing"; "dpid" => %dpid);
            prev.teardown();
        }

        let mgr = Arc::clone(self);
        let served = sc.clone();
        thread::Builder::new()
            .name(format!("switch-{dpid}"))
            .spawn(move || mgr.serve(served))
            .map_err(ConnError::from)?;

        if let Err(e) = sc.network.replay() {
            error!(sc.ctx.log, "failed to replay networks"; "error" => %e);
        }
        if let Err(e) = sc.routing.replay() {
            error!(sc.ctx.log, "failed to replay routes"; "error" => %e);
        }

        info!(self.log, "switch ready"; "dpid" => %dpid);
        Ok(sc)
    }

    /// Build the context, drivers and mechanisms of a booted switch.
    fn assemble(&self, switch: Arc<Switch>) -> Result<SwitchContext> {
        let dpid = switch.datapath_id();
        let ctx = Arc::new(MechanismContext::new(switch.clone(), &self.log));
        let link = Arc::new(EthernetDriver::new(switch.clone()));
        let network = Arc::new(Ipv4Driver::new());
        switch.register_procs(&ctx.rpc)?;
        network.register_procs(&ctx.rpc)?;

        let mut deps = MechanismDeps::new(link.clone(), network.clone());
        deps.arp_timeout = self.arp_timeout;

        let link_mechs = self.registry.build_link(&deps)?;
        let net_mechs = self.registry.build_network(&deps)?;
        deps.resolver = net_mechs.iter().find_map(|m| m.clone().resolver());
        let routing_mechs = self.registry.build_routing(&deps)?;
        let ext_mechs = self.registry.build_extension(&deps)?;

        let routing = Arc::new(RoutingManager::new(
            routing_mechs,
            network.clone(),
            self.persist.clone(),
            dpid,
            &ctx.log,
        ));
        let extension = Arc::new(ExtensionManager::new(ext_mechs));
        let network_mgr = Arc::new(NetworkManager::new(
            net_mechs,
            NetworkDeps {
                link: link.clone(),
                network,
                routing: routing.clone(),
                extension: extension.clone(),
                persist: self.persist.clone(),
            },
            dpid,
            &ctx.log,
        ));

        Ok(SwitchContext {
            switch,
            ctx,
            link: Arc::new(LinkManager::new(link_mechs, link)),
            network: network_mgr,
            routing,
            extension,
        })
    }

    fn serve(&self, sc: Arc<SwitchContext>) {
        let w: ResponseWriter = sc.switch.conn().clone();
        loop {
            match w.receive() {
                Ok(env) => sc.ctx.mux.serve(&w, env),
                Err(ConnError::Closed) => {
                    info!(sc.ctx.log, "switch disconnected");
                    break;
                }
                // The frame was consumed whole; only this message is lost.
                Err(ConnError::Codec(e)) => {
                    warn!(sc.ctx.log, "dropping malformed message"; "error" => %e);
                }
                Err(e) => {
                    warn!(sc.ctx.log, "switch connection failed"; "error" => %e);
                    break;
                }
            }
        }
        self.remove(&sc);
    }

    /// Forget `sc`, unless a newer connection for the same datapath has
    /// taken its place.
    fn remove(&self, sc: &Arc<SwitchContext>) {
        let dpid = sc.dpid();
        {
            let mut switches = self.switches.write();
            if switches.get(&dpid).is_some_and(|cur| Arc::ptr_eq(cur, sc)) {
                switches.remove(&dpid);
            }
        }
        sc.teardown();
    }

    pub fn switch_context(
        &self,
        dpid: Dpid,
    ) -> core::result::Result<Arc<SwitchContext>, SwitchError> {
        self.switches.read().get(&dpid).cloned().ok_or(SwitchError::NotFound(dpid))
    }

    pub fn switches(&self) -> Vec<Dpid> {
        self.switches.read().keys().copied().collect()
    }
}
