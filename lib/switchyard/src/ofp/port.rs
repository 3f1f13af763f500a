// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! `ofp_port` as carried in a PORT_DESC multipart reply.

use super::CodecResult;
use super::Reader;
use bitflags::bitflags;
use switchyard_api::MacAddr;
use switchyard_api::SwitchPortDesc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U32;

pub const OFP_MAX_PORT_NAME_LEN: usize = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortConfig: u32 {
        const PORT_DOWN = 1 << 0;
        const NO_RECV = 1 << 2;
        const NO_FWD = 1 << 5;
        const NO_PACKET_IN = 1 << 6;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortState: u32 {
        const LINK_DOWN = 1 << 0;
        const BLOCKED = 1 << 1;
        const LIVE = 1 << 2;
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct PortDescRaw {
    port_no: U32,
    pad: [u8; 4],
    hw_addr: [u8; 6],
    pad2: [u8; 2],
    name: [u8; OFP_MAX_PORT_NAME_LEN],
    config: U32,
    state: U32,
    curr: U32,
    advertised: U32,
    supported: U32,
    peer: U32,
    curr_speed: U32,
    max_speed: U32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortDesc {
    pub port_no: u32,
    pub hw_addr: MacAddr,
    pub name: String,
    pub config: PortConfig,
    pub state: PortState,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

impl PortDesc {
    pub fn new(port_no: u32, name: &str, hw_addr: MacAddr) -> Self {
        Self {
            port_no,
            hw_addr,
            name: name.to_string(),
            config: PortConfig::empty(),
            state: PortState::LIVE,
            curr: 0,
            advertised: 0,
            supported: 0,
            peer: 0,
            curr_speed: 0,
            max_speed: 0,
        }
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let mut name = [0u8; OFP_MAX_PORT_NAME_LEN];
        // Leave room for the NUL terminator.
        let n = self.name.len().min(OFP_MAX_PORT_NAME_LEN - 1);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);

        let raw = PortDescRaw {
            port_no: U32::new(self.port_no),
            pad: [0; 4],
            hw_addr: self.hw_addr.bytes(),
            pad2: [0; 2],
            name,
            config: U32::new(self.config.bits()),
            state: U32::new(self.state.bits()),
            curr: U32::new(self.curr),
            advertised: U32::new(self.advertised),
            supported: U32::new(self.supported),
            peer: U32::new(self.peer),
            curr_speed: U32::new(self.curr_speed),
            max_speed: U32::new(self.max_speed),
        };
        buf.extend_from_slice(raw.as_bytes());
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let raw = rdr.read::<PortDescRaw>("port desc")?;
        let end = raw.name.iter().position(|b| *b == 0).unwrap_or(raw.name.len());

        Ok(Self {
            port_no: raw.port_no.get(),
            hw_addr: MacAddr::from(raw.hw_addr),
            name: String::from_utf8_lossy(&raw.name[..end]).into_owned(),
            config: PortConfig::from_bits_retain(raw.config.get()),
            state: PortState::from_bits_retain(raw.state.get()),
            curr: raw.curr.get(),
            advertised: raw.advertised.get(),
            supported: raw.supported.get(),
            peer: raw.peer.get(),
            curr_speed: raw.curr_speed.get(),
            max_speed: raw.max_speed.get(),
        })
    }

    pub fn is_up(&self) -> bool {
        !self.config.contains(PortConfig::PORT_DOWN)
            && !self.state.contains(PortState::LINK_DOWN)
    }
}

impl From<&PortDesc> for SwitchPortDesc {
    fn from(p: &PortDesc) -> Self {
        Self {
            name: p.name.clone(),
            number: p.port_no,
            hw_addr: p.hw_addr,
            config: p.config.bits(),
            state: p.state.bits(),
            curr: p.curr,
        }
    }
}
