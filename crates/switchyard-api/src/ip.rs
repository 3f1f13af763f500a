// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };
    pub const LOCAL_BCAST: Self = Self { inner: [255; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let inner: [u8; 4] = bytes.try_into().ok()?;
        Some(Self { inner })
    }

    /// Return the address after applying the network mask.
    pub fn mask(self, mask: u8) -> Result<Self, String> {
        let prefix_len = Ipv4PrefixLen::new(mask)?;
        Ok(self.safe_mask(prefix_len))
    }

    pub fn safe_mask(self, prefix_len: Ipv4PrefixLen) -> Self {
        let n = u32::from(self) & u32::from(prefix_len.to_netmask());
        Self::from(n)
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: core::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip4: Ipv4Addr) -> Self {
        Self::from(ip4.inner)
    }
}

impl From<smoltcp::wire::Ipv4Address> for Ipv4Addr {
    fn from(smolip4: smoltcp::wire::Ipv4Address) -> Self {
        Self { inner: smolip4.0 }
    }
}

impl From<Ipv4Addr> for smoltcp::wire::Ipv4Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip.inner)
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.bytes())
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self { inner: val.to_be_bytes() }
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let octets: Vec<u8> = val
            .split('.')
            .map(|s| s.parse().map_err(|e| format!("{e}")))
            .collect::<result::Result<Vec<u8>, _>>()?;

        let inner: [u8; 4] = octets
            .as_slice()
            .try_into()
            .map_err(|_| format!("malformed ip: {val}"))?;

        Ok(Self { inner })
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.inner;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr({self})")
    }
}

impl AsRef<[u8]> for Ipv4Addr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

/// A valid IPv4 prefix length.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    Ord,
    PartialOrd,
)]
pub struct Ipv4PrefixLen(u8);

impl TryFrom<u8> for Ipv4PrefixLen {
    type Error = String;

    fn try_from(p: u8) -> Result<Self, Self::Error> {
        Self::new(p)
    }
}

impl Ipv4PrefixLen {
    pub const NETMASK_NONE: Self = Self(0);
    pub const NETMASK_ALL: Self = Self(32);

    pub fn new(prefix_len: u8) -> Result<Self, String> {
        if prefix_len > 32 {
            return Err(format!("bad IPv4 prefix length: {prefix_len}"));
        }

        Ok(Self(prefix_len))
    }

    /// Convert a dotted netmask such as `255.255.255.0` into a prefix
    /// length. Non-contiguous masks are rejected.
    pub fn from_netmask(mask: Ipv4Addr) -> Result<Self, String> {
        let bits = u32::from(mask);
        let len = bits.leading_ones();
        if bits.checked_shl(len).unwrap_or(0) != 0 {
            return Err(format!("non-contiguous netmask: {mask}"));
        }
        // leading_ones() of a u32 is at most 32.
        Ok(Self(len as u8))
    }

    /// Convert the prefix length into a subnet mask.
    pub fn to_netmask(self) -> Ipv4Addr {
        match self.0 {
            0 => Ipv4Addr::ANY_ADDR,
            n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n))),
        }
    }

    pub fn val(&self) -> u8 {
        self.0
    }
}

/// An IPv4 CIDR.
///
/// The address is always stored masked, so two CIDRs naming the same
/// network compare equal regardless of how they were written.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Ipv4Cidr {
    ip: Ipv4Addr,
    prefix_len: Ipv4PrefixLen,
}

impl core::cmp::Ord for Ipv4Cidr {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        if self.ip != other.ip {
            self.ip.cmp(&other.ip)
        } else {
            self.prefix_len.cmp(&other.prefix_len)
        }
    }
}

impl core::cmp::PartialOrd for Ipv4Cidr {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    /// Convert a string like "192.168.2.0/24" into an `Ipv4Cidr`.
    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let (ip_s, prefix_s) = match val.split_once('/') {
            Some(v) => v,
            None => return Err("no '/' found".to_string()),
        };

        let ip = match ip_s.parse() {
            Ok(v) => v,
            Err(e) => return Err(format!("bad IP: {e}")),
        };

        let raw = match prefix_s.parse::<u8>() {
            Ok(v) => v,
            Err(e) => {
                return Err(format!("bad prefix length: {e}"));
            }
        };

        let prefix_len = Ipv4PrefixLen::new(raw)?;
        Ok(Ipv4Cidr::new(ip, prefix_len))
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len.val())
    }
}

impl Ipv4Cidr {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Does this CIDR represent the default route subnet?
    pub fn is_default(&self) -> bool {
        self.ip == Ipv4Addr::ANY_ADDR && self.prefix_len.val() == 0
    }

    /// Is this `ip` a member of the CIDR?
    pub fn is_member(&self, ip: Ipv4Addr) -> bool {
        ip.safe_mask(self.prefix_len) == self.ip
    }

    /// Is `other` wholly inside this CIDR? A CIDR contains itself.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix_len >= self.prefix_len && self.is_member(other.ip)
    }

    pub fn new(ip: Ipv4Addr, prefix_len: Ipv4PrefixLen) -> Self {
        let ip = ip.safe_mask(prefix_len);
        Ipv4Cidr { ip, prefix_len }
    }

    pub fn new_checked(ip: Ipv4Addr, prefix_len: u8) -> Result<Self, String> {
        let pl = Ipv4PrefixLen::new(prefix_len)?;
        Ok(Self::new(ip, pl))
    }

    /// A /32 naming exactly one host.
    pub fn host(ip: Ipv4Addr) -> Self {
        Self { ip, prefix_len: Ipv4PrefixLen::NETMASK_ALL }
    }

    pub fn parts(&self) -> (Ipv4Addr, Ipv4PrefixLen) {
        (self.ip, self.prefix_len)
    }

    pub fn prefix_len(self) -> u8 {
        self.prefix_len.val()
    }

    /// Convert the CIDR prefix length into a subnet mask.
    pub fn to_mask(self) -> Ipv4Addr {
        self.prefix_len.to_netmask()
    }
}

/// An IPv4 address bound to an interface, keeping the host bits.
///
/// `10.0.1.1/24` is the address `10.0.1.1` on the network `10.0.1.0/24`;
/// an [`Ipv4Cidr`] would throw the `.1` away.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Ipv4IfAddr {
    addr: Ipv4Addr,
    prefix_len: Ipv4PrefixLen,
}

impl Ipv4IfAddr {
    pub fn new(addr: Ipv4Addr, prefix_len: Ipv4PrefixLen) -> Self {
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> Ipv4PrefixLen {
        self.prefix_len
    }

    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr::new(self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4IfAddr {
    type Err = String;

    /// Accepts either `a.b.c.d/len` or a bare `a.b.c.d`, the latter
    /// naming a single host.
    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        match val.split_once('/') {
            Some((ip_s, prefix_s)) => {
                let addr = ip_s.parse()?;
                let raw = prefix_s
                    .parse::<u8>()
                    .map_err(|e| format!("bad prefix length: {e}"))?;
                Ok(Self { addr, prefix_len: Ipv4PrefixLen::new(raw)? })
            }

            None => Ok(Self {
                addr: val.parse()?,
                prefix_len: Ipv4PrefixLen::NETMASK_ALL,
            }),
        }
    }
}

impl Display for Ipv4IfAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len.val())
    }
}
