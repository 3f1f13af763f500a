// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Answer pings sent to the switch's own addresses.

use super::ExtensionMechanism;
use super::Mechanism;
use super::MechanismBase;
use super::MechanismContext;
use super::MechanismError;
use super::NetworkContext;
use super::to_controller;
use crate::engine::conn::Envelope;
use crate::engine::conn::ResponseWriter;
use crate::engine::cookie::CookieFilter;
use crate::engine::driver::DriverError;
use crate::engine::driver::EthernetDriver;
use crate::engine::driver::Ipv4Driver;
use crate::ofp::Action;
use crate::ofp::ETHERTYPE_IPV4;
use crate::ofp::FlowMod;
use crate::ofp::ICMPV4_ECHO_REQUEST;
use crate::ofp::IP_PROTO_ICMP;
use crate::ofp::Match;
use crate::ofp::Message;
use crate::ofp::OxmField;
use crate::ofp::PacketOut;
use crate::ofp::ports;
use crate::sync::RwLock;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use std::sync::Arc;

/// Sits in table 0 above every steering rule.
const RULE_PRIORITY: u16 = 30;

const REPLY_TTL: u8 = 64;

struct IcmpShared {
    link: Arc<EthernetDriver>,
    network: Arc<Ipv4Driver>,
}

impl IcmpShared {
    /// The echo reply to `frame`, if it is an echo request.
    fn echo_reply(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, DriverError> {
        let malformed = |err| DriverError::Malformed { what: "icmpv4", err };
        let caps = ChecksumCapabilities::default();

        let (eth, payload) = self.link.read_frame(frame)?;
        if eth.ethertype != EthernetProtocol::Ipv4 {
            return Ok(None);
        }
        let ip = self.network.read_packet(payload)?;
        let ip_req = Ipv4Repr::parse(&ip, &caps).map_err(malformed)?;
        if ip_req.next_header != IpProtocol::Icmp {
            return Ok(None);
        }

        let icmp = Icmpv4Packet::new_checked(ip.payload()).map_err(malformed)?;
        let Icmpv4Repr::EchoRequest { ident, seq_no, data } =
            Icmpv4Repr::parse(&icmp, &caps).map_err(malformed)?
        else {
            return Ok(None);
        };

        let icmp_rep = Icmpv4Repr::EchoReply { ident, seq_no, data };
        let ip_rep = Ipv4Repr {
            src_addr: ip_req.dst_addr,
            dst_addr: ip_req.src_addr,
            next_header: IpProtocol::Icmp,
            payload_len: icmp_rep.buffer_len(),
            hop_limit: REPLY_TTL,
        };
        let eth_rep = EthernetRepr {
            src_addr: eth.dst_addr,
            dst_addr: eth.src_addr,
            ethertype: EthernetProtocol::Ipv4,
        };

        let len = ip_rep.buffer_len() + icmp_rep.buffer_len();
        Ok(Some(self.link.write_frame(&eth_rep, len, |buf| {
            let mut pkt = Ipv4Packet::new_unchecked(buf);
            ip_rep.emit(&mut pkt, &caps);
            icmp_rep.emit(&mut Icmpv4Packet::new_unchecked(pkt.payload_mut()), &caps);
        })))
    }

    fn handle_echo(&self, log: &Logger, w: &ResponseWriter, env: &Envelope) {
        let Message::PacketIn(pi) = &env.msg else {
            return;
        };
        let Some(port) = pi.in_port() else {
            warn!(log, "packet in without in_port"; "xid" => env.xid);
            return;
        };

        let reply = match self.echo_reply(&pi.data) {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                warn!(log, "failed to read echo request"; "error" => %e);
                return;
            }
        };

        let po = PacketOut::new(port, vec![Action::output(ports::IN_PORT)], reply);
        if let Err(e) = w.send_all(&[Message::PacketOut(po)]) {
            error!(log, "failed to send echo reply"; "error" => %e);
            return;
        }
        debug!(log, "answered echo request"; "port" => port);
    }
}

pub struct IcmpMechanism {
    base: MechanismBase,
    shared: Arc<IcmpShared>,
    filter: RwLock<Option<Arc<CookieFilter>>>,
}

impl IcmpMechanism {
    pub const NAME: &'static str = "icmp";

    pub fn new(link: Arc<EthernetDriver>, network: Arc<Ipv4Driver>) -> Self {
        Self {
            base: MechanismBase::new(),
            shared: Arc::new(IcmpShared { link, network }),
            filter: RwLock::new(None),
        }
    }

    fn echo_match(nctx: &NetworkContext) -> Match {
        Match::from(vec![
            OxmField::EthType(ETHERTYPE_IPV4),
            OxmField::EthDst(nctx.link_addr),
            OxmField::Ipv4Dst(nctx.addr.addr(), None),
            OxmField::IpProto(IP_PROTO_ICMP),
            OxmField::Icmpv4Type(ICMPV4_ECHO_REQUEST),
        ])
    }

    fn bound(&self) -> Result<(Arc<MechanismContext>, Arc<CookieFilter>), MechanismError> {
        let not_enabled = || MechanismError::NotEnabled(Self::NAME.to_string());
        let ctx = self.context().ok_or_else(not_enabled)?;
        let filter = self.filter.read().clone().ok_or_else(not_enabled)?;
        Ok((ctx, filter))
    }
}

impl Mechanism for IcmpMechanism {
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
        Ok(())
    }

    fn on_disable(
        &self,
        ctx: &Arc<MechanismContext>,
        _was: super::Lifecycle,
    ) -> Result<(), MechanismError> {
        self.filter.write().take();
        // Covers the echo rule of every address.
        let echo = Match::from(vec![
            OxmField::EthType(ETHERTYPE_IPV4),
            OxmField::IpProto(IP_PROTO_ICMP),
            OxmField::Icmpv4Type(ICMPV4_ECHO_REQUEST),
        ]);
        ctx.conn().send_all(&[Message::FlowMod(FlowMod::flow_flush(0, echo))])?;
        Ok(())
    }
}

impl ExtensionMechanism for IcmpMechanism {
    fn update_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError> {
        let (ctx, filter) = self.bound()?;

        let mut fm = FlowMod::add(0, RULE_PRIORITY, Self::echo_match(nctx))
            .with_instructions(to_controller());
        let (shared, log) = (self.shared.clone(), ctx.log.clone());
        filter.filter_fn(&mut fm, move |w, env| shared.handle_echo(&log, w, env));

        ctx.conn().send_all(&[Message::FlowMod(fm)])?;
        info!(ctx.log, "answering echo requests";
            "mechanism" => Self::NAME,
            "addr" => %nctx.addr,
            "port" => nctx.port,
        );
        Ok(())
    }

    fn delete_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError> {
        let (ctx, _) = self.bound()?;
        let fm = FlowMod::flow_flush(0, Self::echo_match(nctx));
        ctx.conn().send_all(&[Message::FlowMod(fm)])?;
        Ok(())
    }
}
