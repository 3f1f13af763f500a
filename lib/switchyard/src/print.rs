// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print controller state in a human-friendly manner.
//!
//! Shared by the daemon and the integration tests.

use crate::engine::routing_table::RouteEntry;
use crate::ofp::PortConfig;
use crate::ofp::PortState;
use itertools::Itertools;
use std::io::Write;
use switchyard_api::NeighEntryDump;
use switchyard_api::NetworkManagerContext;
use switchyard_api::RoutingManagerContext;
use switchyard_api::SwitchPortDesc;
use tabwriter::TabWriter;

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

/// Print the routes of a switch, best first.
pub fn print_routes(routes: &[RouteEntry]) -> std::io::Result<()> {
    print_routes_into(&mut std::io::stdout(), routes)
}

/// Print the routes of a switch, best first.
pub fn print_routes_into(
    writer: &mut impl Write,
    routes: &[RouteEntry],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "NETWORK\tNEXT HOP\tPORT\tTYPE\tDISTANCE\tMETRIC")?;
    write_hr(&mut t)?;
    for r in routes {
        let nh = r.next_hop.map(|nh| nh.to_string());
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            r.network,
            nh.as_deref().unwrap_or("-"),
            r.port,
            r.route_type,
            r.distance(),
            r.metric,
        )?;
    }
    t.flush()
}

pub fn print_neighbors(neighbors: &[NeighEntryDump]) -> std::io::Result<()> {
    print_neighbors_into(&mut std::io::stdout(), neighbors)
}

pub fn print_neighbors_into(
    writer: &mut impl Write,
    neighbors: &[NeighEntryDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ADDRESS\tMAC\tPORT\tAGE")?;
    write_hr(&mut t)?;
    for n in neighbors {
        writeln!(
            t,
            "{}\t{}\t{}\t{}s",
            n.network_addr, n.link_addr, n.port, n.age_secs
        )?;
    }
    t.flush()
}

pub fn print_ports(ports: &[SwitchPortDesc]) -> std::io::Result<()> {
    print_ports_into(&mut std::io::stdout(), ports)
}

pub fn print_ports_into(
    writer: &mut impl Write,
    ports: &[SwitchPortDesc],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "PORT\tNAME\tMAC\tLINK\tCONFIG")?;
    write_hr(&mut t)?;
    for p in ports {
        let state = PortState::from_bits_truncate(p.state);
        let link =
            if state.contains(PortState::LINK_DOWN) { "down" } else { "up" };
        let config = PortConfig::from_bits_truncate(p.config)
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .join(",");
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            p.number,
            p.name,
            p.hw_addr,
            link,
            if config.is_empty() { "-" } else { config.as_str() },
        )?;
    }
    t.flush()
}

pub fn print_networks(ctx: &NetworkManagerContext) -> std::io::Result<()> {
    print_networks_into(&mut std::io::stdout(), ctx)
}

pub fn print_networks_into(
    writer: &mut impl Write,
    ctx: &NetworkManagerContext,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Datapath {}", ctx.datapath)?;
    writeln!(t, "PORT\tADDRESS")?;
    write_hr(&mut t)?;
    for p in ctx.ports.iter().sorted_by_key(|p| p.port) {
        writeln!(t, "{}\t{}", p.port, p.address)?;
    }
    t.flush()
}

/// Print configured routes, as written rather than as installed.
pub fn print_route_config_into(
    writer: &mut impl Write,
    ctx: &RoutingManagerContext,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Datapath {}", ctx.datapath)?;
    writeln!(t, "NETWORK\tNEXT HOP\tPORT\tTYPE\tMETRIC")?;
    write_hr(&mut t)?;
    for r in &ctx.routes {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            r.network,
            r.next_hop.as_deref().unwrap_or("-"),
            r.port,
            r.route_type,
            r.metric,
        )?;
    }
    t.flush()
}

#[cfg(test)]
mod test {
    use super::*;
    use switchyard_api::Dpid;
    use switchyard_api::MacAddr;
    use switchyard_api::NetworkPort;
    use switchyard_api::RouteType;

    fn render<F>(f: F) -> String
    where
        F: FnOnce(&mut Vec<u8>) -> std::io::Result<()>,
    {
        let mut out = vec![];
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn routes_show_missing_next_hop_as_dash() {
        let routes = vec![RouteEntry::new(
            RouteType::Connected,
            "10.0.1.0/24".parse().unwrap(),
            None,
            0,
            1,
        )];
        let out = render(|w| print_routes_into(w, &routes));
        let row = out.lines().nth(2).unwrap();
        let cols: Vec<&str> = row.split_whitespace().collect();
        assert_eq!(cols, ["10.0.1.0/24", "-", "1", "connected", "1", "0"]);
    }

    #[test]
    fn ports_render_config_flags() {
        let ports = vec![SwitchPortDesc {
            name: "eth1".into(),
            number: 1,
            hw_addr: MacAddr::from_const([2, 0, 0, 0, 0, 1]),
            config: (PortConfig::PORT_DOWN | PortConfig::NO_FWD).bits(),
            state: PortState::LINK_DOWN.bits(),
            curr: 0,
        }];
        let out = render(|w| print_ports_into(w, &ports));
        assert!(out.contains("port_down,no_fwd"), "{out}");
        assert!(out.contains("down"));
    }

    #[test]
    fn networks_sorted_by_port() {
        let mut ctx = NetworkManagerContext::new(Dpid::new(1));
        ctx.set_port(NetworkPort { address: "10.0.2.1/24".into(), port: 2 });
        ctx.set_port(NetworkPort { address: "10.0.1.1/24".into(), port: 1 });
        let out = render(|w| print_networks_into(w, &ctx));
        let first = out.find("10.0.1.1/24").unwrap();
        let second = out.find("10.0.2.1/24").unwrap();
        assert!(first < second);
    }
}
