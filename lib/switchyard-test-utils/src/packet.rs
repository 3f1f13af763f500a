// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Build and pick apart the frames tests push through a datapath.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use switchyard_api::Ipv4Addr;
use switchyard_api::MacAddr;

pub const DEFAULT_TTL: u8 = 64;

fn frame(src: MacAddr, dst: MacAddr, proto: EthernetProtocol, len: usize) -> (EthernetRepr, Vec<u8>) {
    let eth = EthernetRepr { src_addr: src.into(), dst_addr: dst.into(), ethertype: proto };
    let buf = vec![0u8; eth.buffer_len() + len];
    (eth, buf)
}

fn arp(op: ArpOperation, sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr, dst: MacAddr) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: op,
        source_hardware_addr: sha.into(),
        source_protocol_addr: spa.into(),
        target_hardware_addr: tha.into(),
        target_protocol_addr: tpa.into(),
    };
    let (eth, mut buf) = frame(sha, dst, EthernetProtocol::Arp, repr.buffer_len());
    let mut f = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.emit(&mut f);
    repr.emit(&mut ArpPacket::new_unchecked(f.payload_mut()));
    buf
}

/// A broadcast who-has `tpa`.
pub fn arp_request(sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Vec<u8> {
    arp(ArpOperation::Request, sha, spa, MacAddr::ZERO, tpa, MacAddr::BROADCAST)
}

/// `spa` is-at `sha`, sent to `tha`.
pub fn arp_reply(sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> Vec<u8> {
    arp(ArpOperation::Reply, sha, spa, tha, tpa, tha)
}

/// The ARP fields of an Ethernet/IPv4 ARP frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArpInfo {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub request: bool,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

pub fn parse_arp(buf: &[u8]) -> Option<ArpInfo> {
    let f = EthernetFrame::new_checked(buf).ok()?;
    if f.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let pkt = ArpPacket::new_checked(f.payload()).ok()?;
    match ArpRepr::parse(&pkt).ok()? {
        ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpInfo {
            eth_src: f.src_addr().into(),
            eth_dst: f.dst_addr().into(),
            request: operation == ArpOperation::Request,
            sha: source_hardware_addr.into(),
            spa: source_protocol_addr.into(),
            tha: target_hardware_addr.into(),
            tpa: target_protocol_addr.into(),
        }),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Parameters of an ICMPv4 echo frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Echo {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub reply: bool,
    pub ident: u16,
    pub seq_no: u16,
    pub data: Vec<u8>,
}

impl Echo {
    pub fn request(
        eth_src: MacAddr,
        eth_dst: MacAddr,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Self {
        Self {
            eth_src,
            eth_dst,
            src,
            dst,
            ttl: DEFAULT_TTL,
            reply: false,
            ident: 0x5959,
            seq_no: 1,
            data: b"switchyard".to_vec(),
        }
    }

    pub fn emit(&self) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let icmp = if self.reply {
            Icmpv4Repr::EchoReply { ident: self.ident, seq_no: self.seq_no, data: &self.data }
        } else {
            Icmpv4Repr::EchoRequest { ident: self.ident, seq_no: self.seq_no, data: &self.data }
        };
        let ip = Ipv4Repr {
            src_addr: self.src.into(),
            dst_addr: self.dst.into(),
            next_header: IpProtocol::Icmp,
            payload_len: icmp.buffer_len(),
            hop_limit: self.ttl,
        };

        let (eth, mut buf) = frame(
            self.eth_src,
            self.eth_dst,
            EthernetProtocol::Ipv4,
            ip.buffer_len() + icmp.buffer_len(),
        );
        let mut f = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.emit(&mut f);
        let mut pkt = Ipv4Packet::new_unchecked(f.payload_mut());
        ip.emit(&mut pkt, &caps);
        icmp.emit(&mut Icmpv4Packet::new_unchecked(pkt.payload_mut()), &caps);
        buf
    }

    /// Parse an echo frame. The IPv4 checksum is not verified, so a
    /// frame whose TTL a datapath decremented in place still parses.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut caps = ChecksumCapabilities::default();
        caps.ipv4 = smoltcp::phy::Checksum::None;

        let f = EthernetFrame::new_checked(buf).ok()?;
        if f.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let pkt = Ipv4Packet::new_checked(f.payload()).ok()?;
        let ip = Ipv4Repr::parse(&pkt, &caps).ok()?;
        if ip.next_header != IpProtocol::Icmp {
            return None;
        }
        let icmp_pkt = Icmpv4Packet::new_checked(pkt.payload()).ok()?;
        let (reply, ident, seq_no, data) =
            match Icmpv4Repr::parse(&icmp_pkt, &ChecksumCapabilities::default()).ok()? {
                Icmpv4Repr::EchoRequest { ident, seq_no, data } => (false, ident, seq_no, data),
                Icmpv4Repr::EchoReply { ident, seq_no, data } => (true, ident, seq_no, data),
                _ => return None,
            };

        Some(Self {
            eth_src: f.src_addr().into(),
            eth_dst: f.dst_addr().into(),
            src: ip.src_addr.into(),
            dst: ip.dst_addr.into(),
            ttl: ip.hop_limit,
            reply,
            ident,
            seq_no,
            data: data.to_vec(),
        })
    }
}
