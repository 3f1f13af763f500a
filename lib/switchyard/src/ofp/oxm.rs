// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! OXM match fields and the `ofp_match` container.

use super::CodecError;
use super::CodecResult;
use super::Reader;
use super::pad8;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::MacAddr;

pub const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;

/// `ofp_match.type` for OXM matches; the only kind 1.3 allows.
pub const OFPMT_OXM: u16 = 1;

pub const OXM_OF_IN_PORT: u8 = 0;
pub const OXM_OF_ETH_DST: u8 = 3;
pub const OXM_OF_ETH_SRC: u8 = 4;
pub const OXM_OF_ETH_TYPE: u8 = 5;
pub const OXM_OF_IP_PROTO: u8 = 10;
pub const OXM_OF_IPV4_SRC: u8 = 11;
pub const OXM_OF_IPV4_DST: u8 = 12;
pub const OXM_OF_ICMPV4_TYPE: u8 = 19;
pub const OXM_OF_ICMPV4_CODE: u8 = 20;
pub const OXM_OF_ARP_OP: u8 = 21;
pub const OXM_OF_ARP_SPA: u8 = 22;
pub const OXM_OF_ARP_TPA: u8 = 23;
pub const OXM_OF_ARP_SHA: u8 = 24;
pub const OXM_OF_ARP_THA: u8 = 25;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const IP_PROTO_ICMP: u8 = 1;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;

/// A single OXM TLV.
///
/// Address fields that may carry a mask keep it as an `Option`; `None`
/// means an exact match.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OxmField {
    InPort(u32),
    EthDst(MacAddr),
    EthSrc(MacAddr),
    EthType(u16),
    IpProto(u8),
    Ipv4Src(Ipv4Addr, Option<Ipv4Addr>),
    Ipv4Dst(Ipv4Addr, Option<Ipv4Addr>),
    Icmpv4Type(u8),
    Icmpv4Code(u8),
    ArpOp(u16),
    ArpSpa(Ipv4Addr, Option<Ipv4Addr>),
    ArpTpa(Ipv4Addr, Option<Ipv4Addr>),
    ArpSha(MacAddr),
    ArpTha(MacAddr),
    Other { class: u16, field: u8, has_mask: bool, value: Vec<u8> },
}

/// Split a CIDR into the value/mask pair an OXM wants. A host route is
/// sent unmasked.
pub fn cidr_value_mask(cidr: Ipv4Cidr) -> (Ipv4Addr, Option<Ipv4Addr>) {
    if cidr.prefix_len() == 32 {
        (cidr.ip(), None)
    } else {
        (cidr.ip(), Some(cidr.to_mask()))
    }
}

impl OxmField {
    pub fn ipv4_dst(cidr: Ipv4Cidr) -> Self {
        let (ip, mask) = cidr_value_mask(cidr);
        Self::Ipv4Dst(ip, mask)
    }

    pub fn arp_tpa(cidr: Ipv4Cidr) -> Self {
        let (ip, mask) = cidr_value_mask(cidr);
        Self::ArpTpa(ip, mask)
    }

    fn class_field(&self) -> (u16, u8) {
        let field = match self {
            Self::InPort(_) => OXM_OF_IN_PORT,
            Self::EthDst(_) => OXM_OF_ETH_DST,
            Self::EthSrc(_) => OXM_OF_ETH_SRC,
            Self::EthType(_) => OXM_OF_ETH_TYPE,
            Self::IpProto(_) => OXM_OF_IP_PROTO,
            Self::Ipv4Src(..) => OXM_OF_IPV4_SRC,
            Self::Ipv4Dst(..) => OXM_OF_IPV4_DST,
            Self::Icmpv4Type(_) => OXM_OF_ICMPV4_TYPE,
            Self::Icmpv4Code(_) => OXM_OF_ICMPV4_CODE,
            Self::ArpOp(_) => OXM_OF_ARP_OP,
            Self::ArpSpa(..) => OXM_OF_ARP_SPA,
            Self::ArpTpa(..) => OXM_OF_ARP_TPA,
            Self::ArpSha(_) => OXM_OF_ARP_SHA,
            Self::ArpTha(_) => OXM_OF_ARP_THA,
            Self::Other { class, field, .. } => return (*class, *field),
        };
        (OFPXMC_OPENFLOW_BASIC, field)
    }

    /// Value bytes followed by mask bytes, if any.
    fn payload(&self) -> (bool, Vec<u8>) {
        fn masked(ip: &Ipv4Addr, mask: &Option<Ipv4Addr>) -> (bool, Vec<u8>) {
            let mut v = ip.bytes().to_vec();
            match mask {
                Some(m) => {
                    v.extend_from_slice(&m.bytes());
                    (true, v)
                }
                None => (false, v),
            }
        }

        match self {
            Self::InPort(p) => (false, p.to_be_bytes().to_vec()),
            Self::EthDst(m)
            | Self::EthSrc(m)
            | Self::ArpSha(m)
            | Self::ArpTha(m) => (false, m.bytes().to_vec()),
            Self::EthType(t) | Self::ArpOp(t) => {
                (false, t.to_be_bytes().to_vec())
            }
            Self::IpProto(v) | Self::Icmpv4Type(v) | Self::Icmpv4Code(v) => {
                (false, vec![*v])
            }
            Self::Ipv4Src(ip, mask)
            | Self::Ipv4Dst(ip, mask)
            | Self::ArpSpa(ip, mask)
            | Self::ArpTpa(ip, mask) => masked(ip, mask),
            Self::Other { has_mask, value, .. } => (*has_mask, value.clone()),
        }
    }

    /// Encoded size, 4-byte TLV header included.
    pub fn wire_len(&self) -> usize {
        4 + self.payload().1.len()
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let (class, field) = self.class_field();
        let (has_mask, payload) = self.payload();
        buf.extend_from_slice(&class.to_be_bytes());
        buf.push((field << 1) | u8::from(has_mask));
        // OXM payloads are at most 2 * 16 bytes.
        buf.push(payload.len() as u8);
        buf.extend_from_slice(&payload);
    }

    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let hdr = rdr.take(4, "oxm header")?;
        let class = u16::from_be_bytes([hdr[0], hdr[1]]);
        let field = hdr[2] >> 1;
        let has_mask = hdr[2] & 1 == 1;
        let len = usize::from(hdr[3]);
        let payload = rdr.take(len, "oxm payload")?;

        if class != OFPXMC_OPENFLOW_BASIC {
            return Ok(Self::Other {
                class,
                field,
                has_mask,
                value: payload.to_vec(),
            });
        }

        let bad = || CodecError::BadLength { what: "oxm field", len };

        let val_len = if has_mask { len / 2 } else { len };
        let (val, mask) = payload.split_at(val_len);

        let mac = |b: &[u8]| MacAddr::from_slice(b).ok_or_else(bad);
        let ip = |b: &[u8]| Ipv4Addr::from_slice(b).ok_or_else(bad);
        let ip_mask = |m: &[u8]| -> CodecResult<Option<Ipv4Addr>> {
            if has_mask { Ok(Some(ip(m)?)) } else { Ok(None) }
        };
        let u16_of = |b: &[u8]| -> CodecResult<u16> {
            let b: [u8; 2] = b.try_into().map_err(|_| bad())?;
            Ok(u16::from_be_bytes(b))
        };
        let u8_of = |b: &[u8]| -> CodecResult<u8> {
            match b {
                [v] => Ok(*v),
                _ => Err(bad()),
            }
        };

        let f = match field {
            OXM_OF_IN_PORT => {
                let b: [u8; 4] = val.try_into().map_err(|_| bad())?;
                Self::InPort(u32::from_be_bytes(b))
            }
            OXM_OF_ETH_DST => Self::EthDst(mac(val)?),
            OXM_OF_ETH_SRC => Self::EthSrc(mac(val)?),
            OXM_OF_ETH_TYPE => Self::EthType(u16_of(val)?),
            OXM_OF_IP_PROTO => Self::IpProto(u8_of(val)?),
            OXM_OF_IPV4_SRC => Self::Ipv4Src(ip(val)?, ip_mask(mask)?),
            OXM_OF_IPV4_DST => Self::Ipv4Dst(ip(val)?, ip_mask(mask)?),
            OXM_OF_ICMPV4_TYPE => Self::Icmpv4Type(u8_of(val)?),
            OXM_OF_ICMPV4_CODE => Self::Icmpv4Code(u8_of(val)?),
            OXM_OF_ARP_OP => Self::ArpOp(u16_of(val)?),
            OXM_OF_ARP_SPA => Self::ArpSpa(ip(val)?, ip_mask(mask)?),
            OXM_OF_ARP_TPA => Self::ArpTpa(ip(val)?, ip_mask(mask)?),
            OXM_OF_ARP_SHA => Self::ArpSha(mac(val)?),
            OXM_OF_ARP_THA => Self::ArpTha(mac(val)?),
            _ => Self::Other {
                class,
                field,
                has_mask,
                value: payload.to_vec(),
            },
        };

        Ok(f)
    }
}

/// An `ofp_match` of type OXM.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Match {
    pub fields: Vec<OxmField>,
}

impl From<Vec<OxmField>> for Match {
    fn from(fields: Vec<OxmField>) -> Self {
        Self { fields }
    }
}

impl Match {
    /// The match-everything match.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn in_port(&self) -> Option<u32> {
        self.fields.iter().find_map(|f| match f {
            OxmField::InPort(p) => Some(*p),
            _ => None,
        })
    }

    /// Encoded size including trailing padding.
    pub fn wire_len(&self) -> usize {
        let len = self.unpadded_len();
        len + pad8(len)
    }

    fn unpadded_len(&self) -> usize {
        4 + self.fields.iter().map(OxmField::wire_len).sum::<usize>()
    }

    pub fn emit(&self, buf: &mut Vec<u8>) {
        let len = self.unpadded_len();
        buf.extend_from_slice(&OFPMT_OXM.to_be_bytes());
        // Bounded by the message length check at encode time.
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        for f in &self.fields {
            f.emit(buf);
        }
        buf.resize(buf.len() + pad8(len), 0);
    }

    /// Parse a match, consuming its padding.
    pub fn parse(rdr: &mut Reader<'_>) -> CodecResult<Self> {
        let hdr = rdr.take(4, "match header")?;
        let mt = u16::from_be_bytes([hdr[0], hdr[1]]);
        let len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));

        if mt != OFPMT_OXM {
            return Err(CodecError::BadValue {
                what: "match type",
                val: u64::from(mt),
            });
        }

        if len < 4 {
            return Err(CodecError::BadLength { what: "match", len });
        }

        let body = rdr.take(len - 4, "match fields")?;
        rdr.take(pad8(len), "match padding")?;

        let mut frdr = Reader::new(body);
        let mut fields = vec![];
        while !frdr.is_empty() {
            fields.push(OxmField::parse(&mut frdr)?);
        }

        Ok(Self { fields })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_match_is_eight_bytes() {
        let mut buf = vec![];
        Match::any().emit(&mut buf);
        assert_eq!(buf, [0x00, 0x01, 0x00, 0x04, 0, 0, 0, 0]);
    }

    #[test]
    fn eth_type_oxm_bytes() {
        let mut buf = vec![];
        OxmField::EthType(ETHERTYPE_ARP).emit(&mut buf);
        assert_eq!(buf, [0x80, 0x00, 0x0a, 0x02, 0x08, 0x06]);
    }

    #[test]
    fn masked_ipv4_dst() {
        let cidr: Ipv4Cidr = "10.0.1.0/24".parse().unwrap();
        let m = Match::from(vec![
            OxmField::EthType(ETHERTYPE_IPV4),
            OxmField::ipv4_dst(cidr),
        ]);

        let mut buf = vec![];
        m.emit(&mut buf);
        // 4 + 6 + 12 = 22, padded to 24.
        assert_eq!(buf.len(), 24);
        assert_eq!(m.wire_len(), 24);
        // has_mask bit set on the ipv4_dst field.
        assert_eq!(buf[12], (OXM_OF_IPV4_DST << 1) | 1);

        let mut rdr = Reader::new(&buf);
        assert_eq!(Match::parse(&mut rdr).unwrap(), m);
        assert!(rdr.is_empty());
    }

    #[test]
    fn host_cidr_is_unmasked() {
        let cidr: Ipv4Cidr = "10.0.1.5/32".parse().unwrap();
        assert_eq!(
            OxmField::ipv4_dst(cidr),
            OxmField::Ipv4Dst("10.0.1.5".parse().unwrap(), None)
        );
    }

    #[test]
    fn in_port_lookup() {
        let m = Match::from(vec![
            OxmField::EthType(ETHERTYPE_IPV4),
            OxmField::InPort(3),
        ]);
        assert_eq!(m.in_port(), Some(3));
        assert_eq!(Match::any().in_port(), None);
    }

    #[test]
    fn foreign_class_kept_opaque() {
        let raw = [0xff, 0xff, 0x02, 0x02, 0xaa, 0xbb];
        let mut rdr = Reader::new(&raw);
        let f = OxmField::parse(&mut rdr).unwrap();
        assert_eq!(
            f,
            OxmField::Other {
                class: 0xffff,
                field: 1,
                has_mask: false,
                value: vec![0xaa, 0xbb],
            }
        );
    }
}
