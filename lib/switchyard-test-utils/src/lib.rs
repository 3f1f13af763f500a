// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod conn;
pub mod datapath;
pub mod packet;
pub mod pipeline;

pub use conn::ChanConn;
pub use datapath::DEFAULT_WAIT;
pub use datapath::DatapathConfig;
pub use datapath::FakeDatapath;
pub use datapath::port_mac;
pub use packet::DEFAULT_TTL;
pub use packet::Echo;
pub use packet::arp_reply;
pub use packet::arp_request;
pub use packet::parse_arp;

use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use switchyard::engine::SwitchContext;
use switchyard::engine::SwitchManager;
use switchyard::persist::MemoryPersister;
use switchyard::persist::Persister;
use switchyard::registry::MechanismRegistry;
use switchyard_api::Dpid;
use switchyard_api::NetworkManagerContext;
use switchyard_api::NetworkPort;
use switchyard_api::Route;
use switchyard_api::RouteType;
use switchyard_api::RoutingManagerContext;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A switch manager with the stock mechanisms and in-memory storage.
pub fn test_manager() -> Arc<SwitchManager> {
    test_manager_with(
        Arc::new(MemoryPersister::new()),
        Duration::from_millis(500),
    )
}

pub fn test_manager_with(
    persist: Arc<dyn Persister>,
    arp_timeout: Duration,
) -> Arc<SwitchManager> {
    let reg = MechanismRegistry::with_defaults();
    Arc::new(
        SwitchManager::new(reg, persist, &test_logger())
            .with_arp_timeout(arp_timeout),
    )
}

/// Connect a fake datapath to `mgr` and boot it.
pub fn connect(
    mgr: &Arc<SwitchManager>,
    cfg: DatapathConfig,
) -> (FakeDatapath, Arc<SwitchContext>) {
    let (dp, conn) = FakeDatapath::connect(cfg);
    let sc = mgr.create_switch(conn).expect("switch boots");
    (dp, sc)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Assign each `(port, address)` pair on `dpid`.
pub fn networks(dpid: Dpid, ports: &[(u32, &str)]) -> NetworkManagerContext {
    let mut ctx = NetworkManagerContext::new(dpid);
    for (port, address) in ports {
        ctx.set_port(NetworkPort { address: address.to_string(), port: *port });
    }
    ctx
}

pub fn route(
    route_type: RouteType,
    network: &str,
    next_hop: Option<&str>,
    port: u32,
) -> Route {
    Route {
        route_type,
        network: network.to_string(),
        next_hop: next_hop.map(str::to_string),
        port,
        metric: 0,
    }
}

pub fn routes(dpid: Dpid, routes: &[Route]) -> RoutingManagerContext {
    let mut ctx = RoutingManagerContext::new(dpid);
    for r in routes {
        ctx.set_route(r.clone());
    }
    ctx
}
