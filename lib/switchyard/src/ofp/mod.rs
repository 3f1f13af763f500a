// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! OpenFlow 1.3 wire codec.
//!
//! Only the message types the controller actually exchanges are given
//! structure; anything else decodes to [`Message::Unknown`] so that a
//! switch sending, say, a port-status notification doesn't bring down
//! its connection. Fixed-layout headers are zerocopy structs in network
//! order; variable-length pieces (OXM fields, actions, instructions) are
//! walked by hand with [`Reader`].

pub mod action;
pub mod flow;
pub mod oxm;
pub mod port;

pub use action::*;
pub use flow::*;
pub use oxm::*;
pub use port::*;

use core::fmt;
use core::fmt::Display;
use switchyard_api::OFP_VERSION;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::byteorder::network_endian::U32;
use zerocopy::byteorder::network_endian::U64;

pub const OFP_HEADER_LEN: usize = 8;

/// Largest message the length field can describe.
pub const OFP_MAX_MSG_LEN: usize = u16::MAX as usize;

/// Buffer ID meaning "the packet is carried in the message itself".
pub const NO_BUFFER: u32 = 0xffff_ffff;

/// `max_len` for controller output meaning "send the whole packet".
pub const CML_NO_BUFFER: u16 = 0xffff;

/// Reserved port numbers.
pub mod ports {
    pub const MAX: u32 = 0xffff_ff00;
    pub const IN_PORT: u32 = 0xffff_fff8;
    pub const TABLE: u32 = 0xffff_fff9;
    pub const NORMAL: u32 = 0xffff_fffa;
    pub const FLOOD: u32 = 0xffff_fffb;
    pub const ALL: u32 = 0xffff_fffc;
    pub const CONTROLLER: u32 = 0xffff_fffd;
    pub const LOCAL: u32 = 0xffff_fffe;
    pub const ANY: u32 = 0xffff_ffff;
}

/// Wildcard group for flow deletes.
pub const OFPG_ANY: u32 = 0xffff_ffff;

/// Table ID meaning "every table" in a flow delete.
pub const OFPTT_ALL: u8 = 0xff;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CodecError {
    Truncated { what: &'static str, need: usize, have: usize },
    BadVersion(u8),
    BadLength { what: &'static str, len: usize },
    BadValue { what: &'static str, val: u64 },
}

impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { what, need, have } => {
                write!(f, "truncated {what}: need {need} bytes, have {have}")
            }
            Self::BadVersion(v) => write!(f, "unsupported version: 0x{v:02x}"),
            Self::BadLength { what, len } => {
                write!(f, "bad {what} length: {len}")
            }
            Self::BadValue { what, val } => write!(f, "bad {what}: {val}"),
        }
    }
}

impl std::error::Error for CodecError {}

pub type CodecResult<T> = Result<T, CodecError>;

/// A cursor over a message body.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read a fixed-layout header off the front.
    pub fn read<T>(&mut self, what: &'static str) -> CodecResult<T>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let have = self.buf.len();
        match T::read_from_prefix(self.buf) {
            Ok((val, rest)) => {
                self.buf = rest;
                Ok(val)
            }
            Err(_) => Err(CodecError::Truncated {
                what,
                need: core::mem::size_of::<T>(),
                have,
            }),
        }
    }

    pub fn take(&mut self, n: usize, what: &'static str) -> CodecResult<&'a [u8]> {
        if n > self.buf.len() {
            return Err(CodecError::Truncated {
                what,
                need: n,
                have: self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// Number of zero bytes needed to pad `len` out to a multiple of 8.
pub(crate) fn pad8(len: usize) -> usize {
    (8 - len % 8) % 8
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct OfpHeaderRaw {
    pub version: u8,
    pub msg_type: u8,
    pub length: U16,
    pub xid: U32,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MsgType {
    Hello,
    Error,
    EchoRequest,
    EchoReply,
    FeaturesRequest,
    FeaturesReply,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    MultipartRequest,
    MultipartReply,
    BarrierRequest,
    BarrierReply,
    Unknown(u8),
}

impl From<u8> for MsgType {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Hello,
            1 => Self::Error,
            2 => Self::EchoRequest,
            3 => Self::EchoReply,
            5 => Self::FeaturesRequest,
            6 => Self::FeaturesReply,
            10 => Self::PacketIn,
            11 => Self::FlowRemoved,
            12 => Self::PortStatus,
            13 => Self::PacketOut,
            14 => Self::FlowMod,
            18 => Self::MultipartRequest,
            19 => Self::MultipartReply,
            20 => Self::BarrierRequest,
            21 => Self::BarrierReply,
            _ => Self::Unknown(val),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(mt: MsgType) -> u8 {
        match mt {
            MsgType::Hello => 0,
            MsgType::Error => 1,
            MsgType::EchoRequest => 2,
            MsgType::EchoReply => 3,
            MsgType::FeaturesRequest => 5,
            MsgType::FeaturesReply => 6,
            MsgType::PacketIn => 10,
            MsgType::FlowRemoved => 11,
            MsgType::PortStatus => 12,
            MsgType::PacketOut => 13,
            MsgType::FlowMod => 14,
            MsgType::MultipartRequest => 18,
            MsgType::MultipartReply => 19,
            MsgType::BarrierRequest => 20,
            MsgType::BarrierReply => 21,
            MsgType::Unknown(val) => val,
        }
    }
}

impl Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Hello => "HELLO",
            Self::Error => "ERROR",
            Self::EchoRequest => "ECHO_REQUEST",
            Self::EchoReply => "ECHO_REPLY",
            Self::FeaturesRequest => "FEATURES_REQUEST",
            Self::FeaturesReply => "FEATURES_REPLY",
            Self::PacketIn => "PACKET_IN",
            Self::FlowRemoved => "FLOW_REMOVED",
            Self::PortStatus => "PORT_STATUS",
            Self::PacketOut => "PACKET_OUT",
            Self::FlowMod => "FLOW_MOD",
            Self::MultipartRequest => "MULTIPART_REQUEST",
            Self::MultipartReply => "MULTIPART_REPLY",
            Self::BarrierRequest => "BARRIER_REQUEST",
            Self::BarrierReply => "BARRIER_REPLY",
            Self::Unknown(v) => return write!(f, "UNKNOWN({v})"),
        };
        write!(f, "{s}")
    }
}

/// A decoded message header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MsgType,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    /// Decode just the fixed header, as needed to frame a stream.
    pub fn parse(buf: &[u8]) -> CodecResult<Self> {
        let raw = Reader::new(buf).read::<OfpHeaderRaw>("header")?;
        let length = raw.length.get();
        if usize::from(length) < OFP_HEADER_LEN {
            return Err(CodecError::BadLength {
                what: "message",
                len: usize::from(length),
            });
        }

        Ok(Self {
            version: raw.version,
            msg_type: MsgType::from(raw.msg_type),
            length,
            xid: raw.xid.get(),
        })
    }
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct FeaturesRaw {
    datapath_id: U64,
    n_buffers: U32,
    n_tables: u8,
    auxiliary_id: u8,
    pad: [u8; 2],
    capabilities: U32,
    reserved: U32,
}

/// Body of a FEATURES_REPLY.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct ErrorRaw {
    err_type: U16,
    code: U16,
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct MultipartRaw {
    mp_type: U16,
    flags: U16,
    pad: [u8; 4],
}

pub const OFPMP_PORT_DESC: u16 = 13;

/// Set in a multipart reply when more parts follow.
pub const OFPMPF_REPLY_MORE: u16 = 0x1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MultipartRequest {
    PortDesc,
    Other { mp_type: u16, body: Vec<u8> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MultipartReply {
    PortDesc { flags: u16, ports: Vec<PortDesc> },
    Other { mp_type: u16, flags: u16, body: Vec<u8> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Hello,
    Error { err_type: u16, code: u16, data: Vec<u8> },
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    MultipartRequest(MultipartRequest),
    MultipartReply(MultipartReply),
    BarrierRequest,
    BarrierReply,
    Unknown { msg_type: u8, body: Vec<u8> },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Hello => MsgType::Hello,
            Self::Error { .. } => MsgType::Error,
            Self::EchoRequest(_) => MsgType::EchoRequest,
            Self::EchoReply(_) => MsgType::EchoReply,
            Self::FeaturesRequest => MsgType::FeaturesRequest,
            Self::FeaturesReply(_) => MsgType::FeaturesReply,
            Self::PacketIn(_) => MsgType::PacketIn,
            Self::FlowRemoved(_) => MsgType::FlowRemoved,
            Self::PacketOut(_) => MsgType::PacketOut,
            Self::FlowMod(_) => MsgType::FlowMod,
            Self::MultipartRequest(_) => MsgType::MultipartRequest,
            Self::MultipartReply(_) => MsgType::MultipartReply,
            Self::BarrierRequest => MsgType::BarrierRequest,
            Self::BarrierReply => MsgType::BarrierReply,
            Self::Unknown { msg_type, .. } => MsgType::from(*msg_type),
        }
    }

    /// Encode the message, header included.
    pub fn encode(&self, xid: u32) -> CodecResult<Vec<u8>> {
        let mut buf = vec![0u8; OFP_HEADER_LEN];
        self.emit_body(&mut buf);

        if buf.len() > OFP_MAX_MSG_LEN {
            return Err(CodecError::BadLength {
                what: "message",
                len: buf.len(),
            });
        }

        let hdr = OfpHeaderRaw {
            version: OFP_VERSION,
            msg_type: u8::from(self.msg_type()),
            // Checked against OFP_MAX_MSG_LEN above.
            length: U16::new(buf.len() as u16),
            xid: U32::new(xid),
        };
        buf[..OFP_HEADER_LEN].copy_from_slice(hdr.as_bytes());
        Ok(buf)
    }

    fn emit_body(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Hello
            | Self::FeaturesRequest
            | Self::BarrierRequest
            | Self::BarrierReply => {}

            Self::Error { err_type, code, data } => {
                let raw =
                    ErrorRaw { err_type: U16::new(*err_type), code: U16::new(*code) };
                buf.extend_from_slice(raw.as_bytes());
                buf.extend_from_slice(data);
            }

            Self::EchoRequest(data) | Self::EchoReply(data) => {
                buf.extend_from_slice(data);
            }

            Self::FeaturesReply(f) => {
                let raw = FeaturesRaw {
                    datapath_id: U64::new(f.datapath_id),
                    n_buffers: U32::new(f.n_buffers),
                    n_tables: f.n_tables,
                    auxiliary_id: f.auxiliary_id,
                    pad: [0; 2],
                    capabilities: U32::new(f.capabilities),
                    reserved: U32::new(0),
                };
                buf.extend_from_slice(raw.as_bytes());
            }

            Self::PacketIn(pi) => pi.emit(buf),
            Self::FlowRemoved(fr) => fr.emit(buf),
            Self::PacketOut(po) => po.emit(buf),
            Self::FlowMod(fm) => fm.emit(buf),

            Self::MultipartRequest(req) => {
                let (mp_type, body): (u16, &[u8]) = match req {
                    MultipartRequest::PortDesc => (OFPMP_PORT_DESC, &[]),
                    MultipartRequest::Other { mp_type, body } => {
                        (*mp_type, body)
                    }
                };
                let raw = MultipartRaw {
                    mp_type: U16::new(mp_type),
                    flags: U16::new(0),
                    pad: [0; 4],
                };
                buf.extend_from_slice(raw.as_bytes());
                buf.extend_from_slice(body);
            }

            Self::MultipartReply(rep) => match rep {
                MultipartReply::PortDesc { flags, ports } => {
                    let raw = MultipartRaw {
                        mp_type: U16::new(OFPMP_PORT_DESC),
                        flags: U16::new(*flags),
                        pad: [0; 4],
                    };
                    buf.extend_from_slice(raw.as_bytes());
                    for p in ports {
                        p.emit(buf);
                    }
                }

                MultipartReply::Other { mp_type, flags, body } => {
                    let raw = MultipartRaw {
                        mp_type: U16::new(*mp_type),
                        flags: U16::new(*flags),
                        pad: [0; 4],
                    };
                    buf.extend_from_slice(raw.as_bytes());
                    buf.extend_from_slice(body);
                }
            },

            Self::Unknown { body, .. } => buf.extend_from_slice(body),
        }
    }

    /// Decode exactly one message from `buf`.
    ///
    /// Trailing bytes past the header's length are ignored; a buffer
    /// shorter than the header's length is an error.
    pub fn decode(buf: &[u8]) -> CodecResult<(Header, Message)> {
        let hdr = Header::parse(buf)?;
        // A HELLO of any version is read so the version can be
        // negotiated; everything else must be 1.3.
        if hdr.version != OFP_VERSION && hdr.msg_type != MsgType::Hello {
            return Err(CodecError::BadVersion(hdr.version));
        }

        let len = usize::from(hdr.length);
        if buf.len() < len {
            return Err(CodecError::Truncated {
                what: "message",
                need: len,
                have: buf.len(),
            });
        }

        let mut rdr = Reader::new(&buf[OFP_HEADER_LEN..len]);
        let msg = Self::parse_body(hdr.msg_type, &mut rdr)?;
        Ok((hdr, msg))
    }

    fn parse_body(mt: MsgType, rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let msg = match mt {
            // Hello elements are optional and we don't need them.
            MsgType::Hello => Self::Hello,
            MsgType::FeaturesRequest => Self::FeaturesRequest,
            MsgType::BarrierRequest => Self::BarrierRequest,
            MsgType::BarrierReply => Self::BarrierReply,

            MsgType::Error => {
                let raw = rdr.read::<ErrorRaw>("error")?;
                Self::Error {
                    err_type: raw.err_type.get(),
                    code: raw.code.get(),
                    data: rdr.rest().to_vec(),
                }
            }

            MsgType::EchoRequest => Self::EchoRequest(rdr.rest().to_vec()),
            MsgType::EchoReply => Self::EchoReply(rdr.rest().to_vec()),

            MsgType::FeaturesReply => {
                let raw = rdr.read::<FeaturesRaw>("features reply")?;
                Self::FeaturesReply(SwitchFeatures {
                    datapath_id: raw.datapath_id.get(),
                    n_buffers: raw.n_buffers.get(),
                    n_tables: raw.n_tables,
                    auxiliary_id: raw.auxiliary_id,
                    capabilities: raw.capabilities.get(),
                })
            }

            MsgType::PacketIn => Self::PacketIn(PacketIn::parse(rdr)?),
            MsgType::FlowRemoved => Self::FlowRemoved(FlowRemoved::parse(rdr)?),
            MsgType::PacketOut => Self::PacketOut(PacketOut::parse(rdr)?),
            MsgType::FlowMod => Self::FlowMod(FlowMod::parse(rdr)?),

            MsgType::MultipartRequest => {
                let raw = rdr.read::<MultipartRaw>("multipart request")?;
                match raw.mp_type.get() {
                    OFPMP_PORT_DESC => {
                        Self::MultipartRequest(MultipartRequest::PortDesc)
                    }
                    mp_type => Self::MultipartRequest(MultipartRequest::Other {
                        mp_type,
                        body: rdr.rest().to_vec(),
                    }),
                }
            }

            MsgType::MultipartReply => {
                let raw = rdr.read::<MultipartRaw>("multipart reply")?;
                let flags = raw.flags.get();
                match raw.mp_type.get() {
                    OFPMP_PORT_DESC => {
                        let mut ports = vec![];
                        while !rdr.is_empty() {
                            ports.push(PortDesc::parse(rdr)?);
                        }
                        Self::MultipartReply(MultipartReply::PortDesc {
                            flags,
                            ports,
                        })
                    }
                    mp_type => Self::MultipartReply(MultipartReply::Other {
                        mp_type,
                        flags,
                        body: rdr.rest().to_vec(),
                    }),
                }
            }

            MsgType::PortStatus | MsgType::Unknown(_) => Self::Unknown {
                msg_type: u8::from(mt),
                body: rdr.rest().to_vec(),
            },
        };

        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_wire_format() {
        let bytes = Message::Hello.encode(7).unwrap();
        assert_eq!(bytes, [0x04, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn echo_keeps_payload_and_xid() {
        let bytes = Message::EchoRequest(vec![1, 2, 3]).encode(99).unwrap();
        let (hdr, msg) = Message::decode(&bytes).unwrap();
        assert_eq!(hdr.xid, 99);
        assert_eq!(hdr.length, 11);
        assert_eq!(msg, Message::EchoRequest(vec![1, 2, 3]));
    }

    #[test]
    fn features_reply_layout() {
        let f = SwitchFeatures {
            datapath_id: 0x0102_0304_0506_0708,
            n_buffers: 256,
            n_tables: 64,
            auxiliary_id: 0,
            capabilities: 0x4f,
        };
        let bytes = Message::FeaturesReply(f).encode(1).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[20], 64);

        let (_, msg) = Message::decode(&bytes).unwrap();
        assert_eq!(msg, Message::FeaturesReply(f));
    }

    #[test]
    fn reject_other_versions() {
        let mut bytes = Message::BarrierRequest.encode(1).unwrap();
        bytes[0] = 0x01;
        assert_eq!(Message::decode(&bytes), Err(CodecError::BadVersion(1)));

        let mut bytes = Message::Hello.encode(1).unwrap();
        bytes[0] = 0x01;
        let (hdr, msg) = Message::decode(&bytes).unwrap();
        assert_eq!(hdr.version, 1);
        assert_eq!(msg, Message::Hello);
    }

    #[test]
    fn reject_truncated() {
        let bytes = Message::EchoRequest(vec![0; 16]).encode(1).unwrap();
        assert!(matches!(
            Message::decode(&bytes[..12]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            Message::decode(&bytes[..4]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_types_survive() {
        let mut bytes = Message::Hello.encode(1).unwrap();
        bytes[1] = 12;
        let (hdr, msg) = Message::decode(&bytes).unwrap();
        assert_eq!(hdr.msg_type, MsgType::PortStatus);
        assert!(matches!(msg, Message::Unknown { msg_type: 12, .. }));
    }
}
