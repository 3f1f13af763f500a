// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Actions and instructions.

use super::CodecError;
use super::CodecResult;
use super::OxmField;
use super::Reader;
use super::pad8;

pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPAT_DEC_NW_TTL: u16 = 24;
pub const OFPAT_SET_FIELD: u16 = 25;

pub const OFPIT_GOTO_TABLE: u16 = 1;
pub const OFPIT_APPLY_ACTIONS: u16 = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Output { port: u32, max_len: u16 },
    SetField(OxmField),
    DecNwTtl,
    Other { action_type: u16, body: Vec<u8> },
}

impl Action {
    /// Output to a port, with no truncation of controller-bound packets.
    pub fn output(port: u32) -> Self {
        Self::Output { port, max_len: 0 }
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match self {
            Self::Output { port, max_len } => {
                buf.extend_from_slice(&OFPAT_OUTPUT.to_be_bytes());
                buf.extend_from_slice(&16u16.to_be_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf.extend_from_slice(&max_len.to_be_bytes());
                buf.extend_from_slice(&[0; 6]);
            }

            Self::DecNwTtl => {
                buf.extend_from_slice(&OFPAT_DEC_NW_TTL.to_be_bytes());
                buf.extend_from_slice(&8u16.to_be_bytes());
                buf.extend_from_slice(&[0; 4]);
            }

            Self::SetField(f) => {
                let len = 4 + f.wire_len();
                let total = len + pad8(len);
                buf.extend_from_slice(&OFPAT_SET_FIELD.to_be_bytes());
                // A single OXM is far below u16::MAX.
                buf.extend_from_slice(&(total as u16).to_be_bytes());
                f.emit(buf);
                buf.resize(start + total, 0);
            }

            Self::Other { action_type, body } => {
                let total = 4 + body.len();
                buf.extend_from_slice(&action_type.to_be_bytes());
                buf.extend_from_slice(&(total as u16).to_be_bytes());
                buf.extend_from_slice(body);
            }
        }
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let hdr = rdr.take(4, "action header")?;
        let action_type = u16::from_be_bytes([hdr[0], hdr[1]]);
        let len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));
        if len < 8 {
            return Err(CodecError::BadLength { what: "action", len });
        }
        let body = rdr.take(len - 4, "action body")?;

        let action = match action_type {
            OFPAT_OUTPUT => {
                if body.len() < 6 {
                    return Err(CodecError::BadLength { what: "output", len });
                }
                Self::Output {
                    port: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    max_len: u16::from_be_bytes([body[4], body[5]]),
                }
            }

            OFPAT_DEC_NW_TTL => Self::DecNwTtl,

            OFPAT_SET_FIELD => {
                let mut frdr = Reader::new(body);
                Self::SetField(OxmField::parse(&mut frdr)?)
            }

            _ => Self::Other { action_type, body: body.to_vec() },
        };

        Ok(action)
    }
}

pub(crate) fn emit_actions(actions: &[Action], buf: &mut Vec<u8>) {
    for a in actions {
        a.emit(buf);
    }
}

pub(crate) fn parse_actions(body: &[u8]) -> CodecResult<Vec<Action>> {
    let mut rdr = Reader::new(body);
    let mut actions = vec![];
    while !rdr.is_empty() {
        actions.push(Action::parse(&mut rdr)?);
    }
    Ok(actions)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    GotoTable(u8),
    ApplyActions(Vec<Action>),
    Other { instr_type: u16, body: Vec<u8> },
}

impl Instruction {
    pub fn emit(&self, buf: &mut Vec<u8>) {
        match self {
            Self::GotoTable(table) => {
                buf.extend_from_slice(&OFPIT_GOTO_TABLE.to_be_bytes());
                buf.extend_from_slice(&8u16.to_be_bytes());
                buf.push(*table);
                buf.extend_from_slice(&[0; 3]);
            }

            Self::ApplyActions(actions) => {
                let start = buf.len();
                buf.extend_from_slice(&OFPIT_APPLY_ACTIONS.to_be_bytes());
                buf.extend_from_slice(&[0; 2]);
                buf.extend_from_slice(&[0; 4]);
                emit_actions(actions, buf);
                let len = (buf.len() - start) as u16;
                buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
            }

            Self::Other { instr_type, body } => {
                let total = (4 + body.len()) as u16;
                buf.extend_from_slice(&instr_type.to_be_bytes());
                buf.extend_from_slice(&total.to_be_bytes());
                buf.extend_from_slice(body);
            }
        }
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let hdr = rdr.take(4, "instruction header")?;
        let instr_type = u16::from_be_bytes([hdr[0], hdr[1]]);
        let len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));
        if len < 8 {
            return Err(CodecError::BadLength { what: "instruction", len });
        }
        let body = rdr.take(len - 4, "instruction body")?;

        let instr = match instr_type {
            OFPIT_GOTO_TABLE => Self::GotoTable(body[0]),
            // Four bytes of padding precede the action list.
            OFPIT_APPLY_ACTIONS => {
                Self::ApplyActions(parse_actions(&body[4..])?)
            }
            _ => Self::Other { instr_type, body: body.to_vec() },
        };

        Ok(instr)
    }
}

pub(crate) fn parse_instructions(body: &[u8]) -> CodecResult<Vec<Instruction>> {
    let mut rdr = Reader::new(body);
    let mut instrs = vec![];
    while !rdr.is_empty() {
        instrs.push(Instruction::parse(&mut rdr)?);
    }
    Ok(instrs)
}

#[cfg(test)]
mod test {
    use super::*;
    use switchyard_api::MacAddr;

    #[test]
    fn output_is_sixteen_bytes() {
        let mut buf = vec![];
        Action::output(super::super::ports::CONTROLLER).emit(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[4..8], &[0xff, 0xff, 0xff, 0xfd]);
    }

    #[test]
    fn set_field_is_padded() {
        let mac = MacAddr::from_const([2, 0, 0, 0, 0, 1]);
        let mut buf = vec![];
        Action::SetField(OxmField::EthDst(mac)).emit(&mut buf);
        // 4 + (4 + 6) = 14, padded to 16.
        assert_eq!(buf.len(), 16);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 16);

        let mut rdr = Reader::new(&buf);
        assert_eq!(
            Action::parse(&mut rdr).unwrap(),
            Action::SetField(OxmField::EthDst(mac))
        );
    }

    #[test]
    fn apply_actions_length_covers_actions() {
        let instr = Instruction::ApplyActions(vec![
            Action::DecNwTtl,
            Action::output(4),
        ]);
        let mut buf = vec![];
        instr.emit(&mut buf);
        assert_eq!(buf.len(), 8 + 8 + 16);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 32);
        assert_eq!(parse_instructions(&buf).unwrap(), vec![instr]);
    }

    #[test]
    fn goto_table() {
        let mut buf = vec![];
        Instruction::GotoTable(3).emit(&mut buf);
        assert_eq!(buf, [0x00, 0x01, 0x00, 0x08, 3, 0, 0, 0]);
    }
}
