// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Route descriptions exchanged with route management and persistence.

use super::Dpid;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// Where a route came from. Each type carries a fixed administrative
/// distance; lower wins.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Static,
    Local,
    Connected,
    Eigrp,
    Ospf,
    Rip,
}

impl RouteType {
    pub const fn distance(&self) -> u8 {
        match self {
            Self::Static | Self::Local => 0,
            Self::Connected => 1,
            Self::Eigrp => 90,
            Self::Ospf => 110,
            Self::Rip => 120,
        }
    }
}

impl FromStr for RouteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "local" => Ok(Self::Local),
            "connected" => Ok(Self::Connected),
            "eigrp" => Ok(Self::Eigrp),
            "ospf" => Ok(Self::Ospf),
            "rip" => Ok(Self::Rip),
            _ => Err(format!("unknown route type: {s}")),
        }
    }
}

impl Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Static => "static",
            Self::Local => "local",
            Self::Connected => "connected",
            Self::Eigrp => "eigrp",
            Self::Ospf => "ospf",
            Self::Rip => "rip",
        };
        write!(f, "{s}")
    }
}

/// A route as an operator or the persistence layer writes it down.
///
/// Addresses stay in their textual form here; the network-layer driver
/// of the switch owning the route parses them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Route {
    #[serde(rename = "type", default)]
    pub route_type: RouteType,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    pub port: u32,
    #[serde(default)]
    pub metric: u32,
}

impl Route {
    /// Two routes name the same table entry if they agree on network,
    /// port and next hop.
    pub fn same_key(&self, other: &Route) -> bool {
        self.network == other.network
            && self.port == other.port
            && self.next_hop == other.next_hop
    }

    /// Whether deleting `other` takes this route with it. A missing next
    /// hop on either side matches any.
    pub fn deleted_by(&self, other: &Route) -> bool {
        let hop_matches = match (&self.next_hop, &other.next_hop) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.network == other.network && self.port == other.port && hop_matches
    }
}

/// The set of routes configured on one datapath.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RoutingManagerContext {
    #[serde(rename = "id")]
    pub datapath: Dpid,
    pub routes: Vec<Route>,
}

impl RoutingManagerContext {
    pub fn new(datapath: Dpid) -> Self {
        Self { datapath, routes: Vec::new() }
    }

    /// Record `route`, replacing one with the same network, port and
    /// next hop.
    pub fn set_route(&mut self, route: Route) {
        match self.routes.iter_mut().find(|r| r.same_key(&route)) {
            Some(r) => *r = route,
            None => self.routes.push(route),
        }
    }

    /// Forget every route deleting `route` removes from a live table.
    pub fn del_route(&mut self, route: &Route) {
        self.routes.retain(|r| !r.deleted_by(route));
    }
}
