// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Daemon configuration, read from a TOML file.

use anyhow::Context;
use anyhow::bail;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use switchyard::persist::MODEL_NETWORK;
use switchyard::persist::MODEL_ROUTE;
use switchyard::persist::Persister;
use switchyard::persist::store_as;
use switchyard_api::Dpid;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::Ipv4IfAddr;
use switchyard_api::NetworkManagerContext;
use switchyard_api::NetworkPort;
use switchyard_api::Route;
use switchyard_api::RoutingManagerContext;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_ARP_TIMEOUT_MS: u64 = 3000;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where switch state is kept between restarts. Without one, state
    /// only lives as long as the process.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_arp_timeout_ms")]
    pub arp_timeout_ms: u64,

    #[serde(default, rename = "switch")]
    pub switches: Vec<SwitchConfig>,
}

/// Networks and routes to apply to a datapath whenever it connects.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchConfig {
    pub dpid: Dpid,

    #[serde(default)]
    pub networks: Vec<NetworkPort>,

    #[serde(default)]
    pub routes: Vec<Route>,
}

/// The standard OpenFlow controller port on all addresses.
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6653))
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_arp_timeout_ms() -> u64 {
    DEFAULT_ARP_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            state_dir: None,
            arp_timeout_ms: DEFAULT_ARP_TIMEOUT_MS,
            switches: vec![],
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("loading config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(raw).context("parsing TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn arp_timeout(&self) -> Duration {
        Duration::from_millis(self.arp_timeout_ms)
    }

    /// Reject anything the engine would only refuse once a switch
    /// connects.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.arp_timeout_ms == 0 {
            bail!("arp_timeout_ms must be non-zero");
        }

        let mut seen = BTreeSet::new();
        for sw in &self.switches {
            if !seen.insert(sw.dpid) {
                bail!("switch {} configured more than once", sw.dpid);
            }
            sw.validate().with_context(|| format!("switch {}", sw.dpid))?;
        }

        Ok(())
    }

    /// Write the configured networks and routes of every switch into
    /// `persist`, so they are applied when the switch connects.
    pub fn seed(&self, persist: &dyn Persister) -> anyhow::Result<()> {
        for sw in &self.switches {
            store_as(persist, sw.dpid, MODEL_NETWORK, &sw.network_context())
                .with_context(|| format!("seeding networks of {}", sw.dpid))?;
            store_as(persist, sw.dpid, MODEL_ROUTE, &sw.routing_context())
                .with_context(|| format!("seeding routes of {}", sw.dpid))?;
        }
        Ok(())
    }
}

impl SwitchConfig {
    fn validate(&self) -> anyhow::Result<()> {
        let mut ports = BTreeSet::new();
        for n in &self.networks {
            if !ports.insert(n.port) {
                bail!("port {} has more than one network", n.port);
            }
            n.address
                .parse::<Ipv4IfAddr>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("network on port {}", n.port))?;
        }

        for r in &self.routes {
            r.network
                .parse::<Ipv4Cidr>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("route {}", r.network))?;
            if let Some(nh) = &r.next_hop {
                nh.parse::<Ipv4Addr>()
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("next hop of {}", r.network))?;
            }
        }

        Ok(())
    }

    pub fn network_context(&self) -> NetworkManagerContext {
        let mut ctx = NetworkManagerContext::new(self.dpid);
        for n in &self.networks {
            ctx.set_port(n.clone());
        }
        ctx
    }

    pub fn routing_context(&self) -> RoutingManagerContext {
        let mut ctx = RoutingManagerContext::new(self.dpid);
        for r in &self.routes {
            ctx.set_route(r.clone());
        }
        ctx
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use switchyard::persist::MemoryPersister;
    use switchyard::persist::load_as;
    use switchyard_api::RouteType;

    const SAMPLE: &str = r#"
listen_addr = "127.0.0.1:6633"
log_level = "debug"
arp_timeout_ms = 1500

[[switch]]
dpid = "00:00:00:00:00:00:00:01"
networks = [
    { port = 1, address = "10.0.1.1/24" },
    { port = 2, address = "10.0.2.1/24" },
]
routes = [
    { type = "static", network = "10.2.0.0/16", next_hop = "10.0.1.254", port = 1 },
    { type = "ospf", network = "0.0.0.0/0", next_hop = "10.0.2.254", port = 2, metric = 20 },
]
"#;

    #[test]
    fn parse_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:6633".parse().unwrap());
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.arp_timeout(), Duration::from_millis(1500));
        assert!(cfg.state_dir.is_none());
        assert_eq!(cfg.switches.len(), 1);

        let sw = &cfg.switches[0];
        assert_eq!(sw.dpid, Dpid::new(1));
        assert_eq!(sw.networks.len(), 2);
        assert_eq!(sw.routes[1].route_type, RouteType::Ospf);
        assert_eq!(sw.routes[1].metric, 20);
        assert_eq!(sw.routes[0].metric, 0);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:6653");
        assert_eq!(cfg.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(cfg.arp_timeout(), Duration::from_secs(3));
        assert!(cfg.switches.is_empty());
    }

    #[test]
    fn reject_bad_input() {
        assert!(Config::parse("bogus = 1").is_err());
        assert!(Config::parse("arp_timeout_ms = 0").is_err());

        let dup = r#"
[[switch]]
dpid = "00:00:00:00:00:00:00:01"
[[switch]]
dpid = "00:00:00:00:00:00:00:01"
"#;
        assert!(Config::parse(dup).is_err());

        let bad_addr = r#"
[[switch]]
dpid = "00:00:00:00:00:00:00:01"
networks = [{ port = 1, address = "10.0.1.300/24" }]
"#;
        assert!(Config::parse(bad_addr).is_err());

        let bad_nh = r#"
[[switch]]
dpid = "00:00:00:00:00:00:00:01"
routes = [{ network = "10.2.0.0/16", next_hop = "nope", port = 1 }]
"#;
        assert!(Config::parse(bad_nh).is_err());

        let bad_dpid = r#"
[[switch]]
dpid = "00:01"
"#;
        assert!(Config::parse(bad_dpid).is_err());
    }

    #[test]
    fn seed_stores_both_models() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let persist = MemoryPersister::new();
        cfg.seed(&persist).unwrap();

        let dpid = Dpid::new(1);
        let nets: NetworkManagerContext =
            load_as(&persist, dpid, MODEL_NETWORK).unwrap().unwrap();
        assert_eq!(nets.datapath, dpid);
        assert_eq!(nets.port(2).unwrap().address, "10.0.2.1/24");

        let routes: RoutingManagerContext =
            load_as(&persist, dpid, MODEL_ROUTE).unwrap().unwrap();
        assert_eq!(routes.routes.len(), 2);
        assert_eq!(routes.routes[0].next_hop.as_deref(), Some("10.0.1.254"));

        assert!(
            load_as::<RoutingManagerContext>(&persist, Dpid::new(2), MODEL_ROUTE)
                .unwrap()
                .is_none()
        );
    }
}
