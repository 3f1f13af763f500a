// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow table modification, flow removal, and packet in/out.

use super::Action;
use super::CodecError;
use super::CodecResult;
use super::Instruction;
use super::Match;
use super::NO_BUFFER;
use super::OFPG_ANY;
use super::Reader;
use super::action::emit_actions;
use super::action::parse_actions;
use super::action::parse_instructions;
use super::ports;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::byteorder::network_endian::U32;
use zerocopy::byteorder::network_endian::U64;

/// Ask the switch to send FLOW_REMOVED when this flow goes away.
pub const OFPFF_SEND_FLOW_REM: u16 = 0x1;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlowModCommand {
    #[default]
    Add,
    Modify,
    ModifyStrict,
    Delete,
    DeleteStrict,
}

impl From<FlowModCommand> for u8 {
    fn from(cmd: FlowModCommand) -> u8 {
        match cmd {
            FlowModCommand::Add => 0,
            FlowModCommand::Modify => 1,
            FlowModCommand::ModifyStrict => 2,
            FlowModCommand::Delete => 3,
            FlowModCommand::DeleteStrict => 4,
        }
    }
}

impl TryFrom<u8> for FlowModCommand {
    type Error = CodecError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(Self::Add),
            1 => Ok(Self::Modify),
            2 => Ok(Self::ModifyStrict),
            3 => Ok(Self::Delete),
            4 => Ok(Self::DeleteStrict),
            _ => Err(CodecError::BadValue {
                what: "flow mod command",
                val: u64::from(val),
            }),
        }
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct FlowModRaw {
    cookie: U64,
    cookie_mask: U64,
    table_id: u8,
    command: u8,
    idle_timeout: U16,
    hard_timeout: U16,
    priority: U16,
    buffer_id: U32,
    out_port: U32,
    out_group: U32,
    flags: U16,
    pad: [u8; 2],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowMod {
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub command: FlowModCommand,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u32,
    pub out_group: u32,
    pub flags: u16,
    pub matches: Match,
    pub instructions: Vec<Instruction>,
}

impl Default for FlowMod {
    fn default() -> Self {
        Self {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command: FlowModCommand::Add,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: NO_BUFFER,
            out_port: ports::ANY,
            out_group: OFPG_ANY,
            flags: 0,
            matches: Match::any(),
            instructions: vec![],
        }
    }
}

impl FlowMod {
    /// An ADD into `table_id`.
    pub fn add(table_id: u8, priority: u16, matches: Match) -> Self {
        Self { table_id, priority, matches, ..Default::default() }
    }

    pub fn with_instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    /// Restrict a modify or delete to flows whose cookie matches
    /// `cookie` under `mask`.
    pub fn with_cookie_mask(mut self, cookie: u64, mask: u64) -> Self {
        self.cookie = cookie;
        self.cookie_mask = mask;
        self
    }

    /// Remove every flow in `table_id`.
    pub fn table_flush(table_id: u8) -> Self {
        Self::flow_flush(table_id, Match::any())
    }

    /// Remove the flows in `table_id` covered by `matches`.
    pub fn flow_flush(table_id: u8, matches: Match) -> Self {
        Self {
            table_id,
            command: FlowModCommand::Delete,
            matches,
            ..Default::default()
        }
    }

    /// Remove exactly the flow in `table_id` at `priority` with `matches`.
    pub fn flow_remove(table_id: u8, priority: u16, matches: Match) -> Self {
        Self {
            table_id,
            command: FlowModCommand::DeleteStrict,
            priority,
            matches,
            ..Default::default()
        }
    }

    /// The priority 0 catch-all with no instructions: a table miss drops.
    pub fn flow_drop(table_id: u8) -> Self {
        Self::add(table_id, 0, Match::any())
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let raw = FlowModRaw {
            cookie: U64::new(self.cookie),
            cookie_mask: U64::new(self.cookie_mask),
            table_id: self.table_id,
            command: u8::from(self.command),
            idle_timeout: U16::new(self.idle_timeout),
            hard_timeout: U16::new(self.hard_timeout),
            priority: U16::new(self.priority),
            buffer_id: U32::new(self.buffer_id),
            out_port: U32::new(self.out_port),
            out_group: U32::new(self.out_group),
            flags: U16::new(self.flags),
            pad: [0; 2],
        };
        buf.extend_from_slice(raw.as_bytes());
        self.matches.emit(buf);
        for i in &self.instructions {
            i.emit(buf);
        }
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let raw = rdr.read::<FlowModRaw>("flow mod")?;
        let matches = Match::parse(rdr)?;
        let instructions = parse_instructions(rdr.rest())?;

        Ok(Self {
            cookie: raw.cookie.get(),
            cookie_mask: raw.cookie_mask.get(),
            table_id: raw.table_id,
            command: FlowModCommand::try_from(raw.command)?,
            idle_timeout: raw.idle_timeout.get(),
            hard_timeout: raw.hard_timeout.get(),
            priority: raw.priority.get(),
            buffer_id: raw.buffer_id.get(),
            out_port: raw.out_port.get(),
            out_group: raw.out_group.get(),
            flags: raw.flags.get(),
            matches,
            instructions,
        })
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct FlowRemovedRaw {
    cookie: U64,
    priority: U16,
    reason: u8,
    table_id: u8,
    duration_sec: U32,
    duration_nsec: U32,
    idle_timeout: U16,
    hard_timeout: U16,
    packet_count: U64,
    byte_count: U64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowRemoved {
    pub cookie: u64,
    pub priority: u16,
    pub reason: u8,
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    pub matches: Match,
}

impl FlowRemoved {
    pub fn emit(&self, buf: &mut Vec<u8>) {
        let raw = FlowRemovedRaw {
            cookie: U64::new(self.cookie),
            priority: U16::new(self.priority),
            reason: self.reason,
            table_id: self.table_id,
            duration_sec: U32::new(self.duration_sec),
            duration_nsec: U32::new(self.duration_nsec),
            idle_timeout: U16::new(self.idle_timeout),
            hard_timeout: U16::new(self.hard_timeout),
            packet_count: U64::new(self.packet_count),
            byte_count: U64::new(self.byte_count),
        };
        buf.extend_from_slice(raw.as_bytes());
        self.matches.emit(buf);
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let raw = rdr.read::<FlowRemovedRaw>("flow removed")?;
        let matches = Match::parse(rdr)?;

        Ok(Self {
            cookie: raw.cookie.get(),
            priority: raw.priority.get(),
            reason: raw.reason,
            table_id: raw.table_id,
            duration_sec: raw.duration_sec.get(),
            duration_nsec: raw.duration_nsec.get(),
            idle_timeout: raw.idle_timeout.get(),
            hard_timeout: raw.hard_timeout.get(),
            packet_count: raw.packet_count.get(),
            byte_count: raw.byte_count.get(),
            matches,
        })
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct PacketInRaw {
    buffer_id: U32,
    total_len: U16,
    reason: u8,
    table_id: u8,
    cookie: U64,
}

pub const OFPR_NO_MATCH: u8 = 0;
pub const OFPR_ACTION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub reason: u8,
    pub table_id: u8,
    pub cookie: u64,
    pub matches: Match,
    pub data: Vec<u8>,
}

impl PacketIn {
    /// An unbuffered packet sent to the controller by an output action.
    pub fn new(table_id: u8, cookie: u64, in_port: u32, data: Vec<u8>) -> Self {
        Self {
            buffer_id: NO_BUFFER,
            total_len: u16::try_from(data.len()).unwrap_or(u16::MAX),
            reason: OFPR_ACTION,
            table_id,
            cookie,
            matches: Match::from(vec![super::OxmField::InPort(in_port)]),
            data,
        }
    }

    pub fn in_port(&self) -> Option<u32> {
        self.matches.in_port()
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let raw = PacketInRaw {
            buffer_id: U32::new(self.buffer_id),
            total_len: U16::new(self.total_len),
            reason: self.reason,
            table_id: self.table_id,
            cookie: U64::new(self.cookie),
        };
        buf.extend_from_slice(raw.as_bytes());
        self.matches.emit(buf);
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&self.data);
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let raw = rdr.read::<PacketInRaw>("packet in")?;
        let matches = Match::parse(rdr)?;
        rdr.take(2, "packet in padding")?;

        Ok(Self {
            buffer_id: raw.buffer_id.get(),
            total_len: raw.total_len.get(),
            reason: raw.reason,
            table_id: raw.table_id,
            cookie: raw.cookie.get(),
            matches,
            data: rdr.rest().to_vec(),
        })
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct PacketOutRaw {
    buffer_id: U32,
    in_port: U32,
    actions_len: U16,
    pad: [u8; 6],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u32,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

impl PacketOut {
    /// An unbuffered packet-out carrying `data`.
    pub fn new(in_port: u32, actions: Vec<Action>, data: Vec<u8>) -> Self {
        Self { buffer_id: NO_BUFFER, in_port, actions, data }
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let mut actions = vec![];
        emit_actions(&self.actions, &mut actions);
        let raw = PacketOutRaw {
            buffer_id: U32::new(self.buffer_id),
            in_port: U32::new(self.in_port),
            // Bounded by the message length check at encode time.
            actions_len: U16::new(actions.len() as u16),
            pad: [0; 6],
        };
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(&actions);
        buf.extend_from_slice(&self.data);
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let raw = rdr.read::<PacketOutRaw>("packet out")?;
        let actions = rdr.take(usize::from(raw.actions_len.get()), "actions")?;

        Ok(Self {
            buffer_id: raw.buffer_id.get(),
            in_port: raw.in_port.get(),
            actions: parse_actions(actions)?,
            data: rdr.rest().to_vec(),
        })
    }
}
