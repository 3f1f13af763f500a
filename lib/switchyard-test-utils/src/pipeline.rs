// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A small OpenFlow pipeline: just enough flow-table semantics for the
//! fake datapath to behave like a switch.

use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use switchyard::ofp::Action;
use switchyard::ofp::FlowMod;
use switchyard::ofp::FlowModCommand;
use switchyard::ofp::Instruction;
use switchyard::ofp::OFPTT_ALL;
use switchyard::ofp::OxmField;
use switchyard_api::Ipv4Addr;
use switchyard_api::MacAddr;

/// The header fields a match can look at.
#[derive(Clone, Debug, Default)]
pub struct PacketFields {
    pub in_port: u32,
    pub eth_dst: MacAddr,
    pub eth_src: MacAddr,
    pub eth_type: u16,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    pub icmpv4_type: Option<u8>,
    pub icmpv4_code: Option<u8>,
    pub arp_op: Option<u16>,
    pub arp_spa: Option<Ipv4Addr>,
    pub arp_tpa: Option<Ipv4Addr>,
    pub arp_sha: Option<MacAddr>,
    pub arp_tha: Option<MacAddr>,
}

impl PacketFields {
    pub fn parse(in_port: u32, buf: &[u8]) -> Self {
        let mut pf = Self { in_port, ..Default::default() };
        let Ok(f) = EthernetFrame::new_checked(buf) else {
            return pf;
        };
        pf.eth_dst = f.dst_addr().into();
        pf.eth_src = f.src_addr().into();
        pf.eth_type = u16::from(f.ethertype());

        match f.ethertype() {
            EthernetProtocol::Arp => {
                let repr = ArpPacket::new_checked(f.payload())
                    .and_then(|p| ArpRepr::parse(&p));
                match repr {
                    Ok(ArpRepr::EthernetIpv4 {
                        operation,
                        source_hardware_addr,
                        source_protocol_addr,
                        target_hardware_addr,
                        target_protocol_addr,
                    }) => {
                        pf.arp_op = Some(u16::from(operation));
                        pf.arp_sha = Some(source_hardware_addr.into());
                        pf.arp_spa = Some(source_protocol_addr.into());
                        pf.arp_tha = Some(target_hardware_addr.into());
                        pf.arp_tpa = Some(target_protocol_addr.into());
                    }
                    _ => {}
                }
            }

            EthernetProtocol::Ipv4 => {
                let Ok(ip) = Ipv4Packet::new_checked(f.payload()) else {
                    return pf;
                };
                pf.ipv4_src = Some(ip.src_addr().into());
                pf.ipv4_dst = Some(ip.dst_addr().into());
                pf.ip_proto = Some(u8::from(ip.next_header()));
                if ip.next_header() == IpProtocol::Icmp {
                    if let Ok(icmp) = Icmpv4Packet::new_checked(ip.payload()) {
                        pf.icmpv4_type = Some(u8::from(icmp.msg_type()));
                        pf.icmpv4_code = Some(icmp.msg_code());
                    }
                }
            }

            _ => {}
        }
        pf
    }

    fn matches(&self, f: &OxmField) -> bool {
        fn masked(ip: Option<Ipv4Addr>, val: Ipv4Addr, mask: Option<Ipv4Addr>) -> bool {
            let Some(ip) = ip else {
                return false;
            };
            let mask = mask.map(u32::from).unwrap_or(u32::MAX);
            u32::from(ip) & mask == u32::from(val) & mask
        }

        match f {
            OxmField::InPort(p) => self.in_port == *p,
            OxmField::EthDst(m) => self.eth_dst == *m,
            OxmField::EthSrc(m) => self.eth_src == *m,
            OxmField::EthType(t) => self.eth_type == *t,
            OxmField::IpProto(p) => self.ip_proto == Some(*p),
            OxmField::Ipv4Src(ip, mask) => masked(self.ipv4_src, *ip, *mask),
            OxmField::Ipv4Dst(ip, mask) => masked(self.ipv4_dst, *ip, *mask),
            OxmField::Icmpv4Type(t) => self.icmpv4_type == Some(*t),
            OxmField::Icmpv4Code(c) => self.icmpv4_code == Some(*c),
            OxmField::ArpOp(op) => self.arp_op == Some(*op),
            OxmField::ArpSpa(ip, mask) => masked(self.arp_spa, *ip, *mask),
            OxmField::ArpTpa(ip, mask) => masked(self.arp_tpa, *ip, *mask),
            OxmField::ArpSha(m) => self.arp_sha == Some(*m),
            OxmField::ArpTha(m) => self.arp_tha == Some(*m),
            OxmField::Other { .. } => false,
        }
    }
}

/// Whether a delete naming `del` reaches a flow carrying `flow`: same
/// field, and the flow's value lies within the delete's.
fn covers(del: &OxmField, flow: &OxmField) -> bool {
    fn within(
        v: Ipv4Addr,
        m: &Option<Ipv4Addr>,
        fv: Ipv4Addr,
        fm: &Option<Ipv4Addr>,
    ) -> bool {
        let m = m.map(u32::from).unwrap_or(u32::MAX);
        let fm = fm.map(u32::from).unwrap_or(u32::MAX);
        fm & m == m && u32::from(fv) & m == u32::from(v) & m
    }

    match (del, flow) {
        (OxmField::Ipv4Dst(v, m), OxmField::Ipv4Dst(fv, fm))
        | (OxmField::Ipv4Src(v, m), OxmField::Ipv4Src(fv, fm))
        | (OxmField::ArpSpa(v, m), OxmField::ArpSpa(fv, fm))
        | (OxmField::ArpTpa(v, m), OxmField::ArpTpa(fv, fm)) => within(*v, m, *fv, fm),
        _ => del == flow,
    }
}

/// Where a packet ended up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Sent to the controller by a flow carrying `cookie` in `table`.
    Controller { table: u8, cookie: u64, frame: Vec<u8> },
    /// Transmitted on a port.
    Output { port: u32, frame: Vec<u8> },
}

#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    flows: Vec<FlowMod>,
}

impl Pipeline {
    pub fn flows(&self) -> &[FlowMod] {
        &self.flows
    }

    pub fn table(&self, table: u8) -> Vec<&FlowMod> {
        self.flows.iter().filter(|f| f.table_id == table).collect()
    }

    pub fn apply(&mut self, fm: &FlowMod) {
        match fm.command {
            FlowModCommand::Add | FlowModCommand::Modify | FlowModCommand::ModifyStrict => {
                self.flows.retain(|f| {
                    !(f.table_id == fm.table_id
                        && f.priority == fm.priority
                        && f.matches == fm.matches)
                });
                self.flows.push(fm.clone());
            }

            FlowModCommand::Delete => self.flows.retain(|f| {
                let in_table = fm.table_id == OFPTT_ALL || f.table_id == fm.table_id;
                let cookie_ok = f.cookie & fm.cookie_mask == fm.cookie & fm.cookie_mask;
                let covered = fm
                    .matches
                    .fields
                    .iter()
                    .all(|d| f.matches.fields.iter().any(|ff| covers(d, ff)));
                !(in_table && cookie_ok && covered)
            }),

            FlowModCommand::DeleteStrict => self.flows.retain(|f| {
                !((fm.table_id == OFPTT_ALL || f.table_id == fm.table_id)
                    && f.priority == fm.priority
                    && f.matches == fm.matches)
            }),
        }
    }

    /// The flow a packet hits in `table`: highest priority, earliest
    /// installed among equals.
    fn lookup(&self, table: u8, pf: &PacketFields) -> Option<&FlowMod> {
        self.flows
            .iter()
            .filter(|f| f.table_id == table)
            .filter(|f| f.matches.fields.iter().all(|m| pf.matches(m)))
            .fold(None, |best: Option<&FlowMod>, f| match best {
                Some(b) if b.priority >= f.priority => Some(b),
                _ => Some(f),
            })
    }

    /// Run `frame` from table 0.
    pub fn process(&self, in_port: u32, frame: &[u8]) -> Vec<Verdict> {
        let mut frame = frame.to_vec();
        let mut table = 0;
        let mut out = vec![];

        loop {
            let pf = PacketFields::parse(in_port, &frame);
            let Some(flow) = self.lookup(table, &pf) else {
                return out;
            };

            let mut next = None;
            for instr in &flow.instructions {
                match instr {
                    Instruction::GotoTable(t) => next = Some(*t),
                    Instruction::ApplyActions(actions) => {
                        for a in actions {
                            apply_action(a, table, flow.cookie, in_port, &mut frame, &mut out);
                        }
                    }
                    Instruction::Other { .. } => {}
                }
            }

            match next {
                Some(t) if t > table => table = t,
                _ => return out,
            }
        }
    }
}

fn apply_action(
    a: &Action,
    table: u8,
    cookie: u64,
    in_port: u32,
    frame: &mut Vec<u8>,
    out: &mut Vec<Verdict>,
) {
    use switchyard::ofp::ports;

    match a {
        Action::Output { port, .. } if *port == ports::CONTROLLER => {
            out.push(Verdict::Controller { table, cookie, frame: frame.clone() });
        }
        Action::Output { port, .. } if *port == ports::IN_PORT => {
            out.push(Verdict::Output { port: in_port, frame: frame.clone() });
        }
        Action::Output { port, .. } => {
            out.push(Verdict::Output { port: *port, frame: frame.clone() });
        }
        Action::SetField(OxmField::EthDst(m)) if frame.len() >= 14 => {
            frame[0..6].copy_from_slice(&m.bytes());
        }
        Action::SetField(OxmField::EthSrc(m)) if frame.len() >= 14 => {
            frame[6..12].copy_from_slice(&m.bytes());
        }
        Action::DecNwTtl => {
            if let Ok(mut f) = EthernetFrame::new_checked(&mut frame[..]) {
                if f.ethertype() == EthernetProtocol::Ipv4 {
                    if let Ok(mut ip) = Ipv4Packet::new_checked(f.payload_mut()) {
                        let ttl = ip.hop_limit().saturating_sub(1);
                        ip.set_hop_limit(ttl);
                        ip.fill_checksum();
                    }
                }
            }
        }
        _ => {}
    }
}

/// Whether `frame` is an ARP request.
pub fn is_arp_request(frame: &[u8]) -> bool {
    let pf = PacketFields::parse(0, frame);
    pf.arp_op == Some(u16::from(ArpOperation::Request))
}
