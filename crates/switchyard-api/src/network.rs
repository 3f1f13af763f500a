// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::Dpid;
use super::Ipv4Addr;
use super::MacAddr;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// A network-layer address assigned to one switch port.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkPort {
    /// Address string as understood by the network driver, e.g.
    /// `10.0.1.1/24`.
    pub address: String,
    pub port: u32,
}

/// The network-layer configuration of one datapath.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NetworkManagerContext {
    #[serde(rename = "id")]
    pub datapath: Dpid,
    #[serde(default)]
    pub driver: String,
    pub ports: Vec<NetworkPort>,
}

impl NetworkManagerContext {
    pub fn new(datapath: Dpid) -> Self {
        Self { datapath, driver: String::new(), ports: Vec::new() }
    }

    pub fn port(&self, port: u32) -> Option<&NetworkPort> {
        self.ports.iter().find(|p| p.port == port)
    }

    /// Replace the entry for `p.port`, or append it.
    pub fn set_port(&mut self, p: NetworkPort) {
        match self.ports.iter_mut().find(|e| e.port == p.port) {
            Some(e) => *e = p,
            None => self.ports.push(p),
        }
    }

    pub fn del_port(&mut self, port: u32) {
        self.ports.retain(|p| p.port != port);
    }
}

/// A switch port as described by the datapath.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SwitchPortDesc {
    pub name: String,
    pub number: u32,
    pub hw_addr: MacAddr,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
}

/// A neighbor table entry, as handed out for display.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NeighEntryDump {
    pub network_addr: Ipv4Addr,
    pub link_addr: MacAddr,
    pub port: u32,
    /// Seconds since the entry was last refreshed.
    pub age_secs: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_port_replaces_by_number() {
        let mut ctx = NetworkManagerContext::new(Dpid::new(7));
        ctx.set_port(NetworkPort { address: "10.0.1.1/24".into(), port: 1 });
        ctx.set_port(NetworkPort { address: "10.0.2.1/24".into(), port: 2 });
        ctx.set_port(NetworkPort { address: "10.0.9.1/24".into(), port: 1 });

        assert_eq!(ctx.ports.len(), 2);
        assert_eq!(ctx.port(1).unwrap().address, "10.0.9.1/24");

        ctx.del_port(1);
        assert!(ctx.port(1).is_none());
        assert_eq!(ctx.ports.len(), 1);
    }
}
