// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// A datapath identifier, as reported in the features reply.
///
/// Datapaths are named by their ID rendered as colon-separated hex
/// octets in network order, e.g. `00:00:a8:40:25:00:00:01`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Dpid(u64);

impl Dpid {
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    pub fn val(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Dpid {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, b) in self.0.to_be_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Dpid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets = s
            .split(':')
            .map(|o| {
                u8::from_str_radix(o, 16).map_err(|_| format!("bad octet: {o}"))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let bytes: [u8; 8] = octets.as_slice().try_into().map_err(|_| {
            format!("datapath id needs 8 octets, got {}", octets.len())
        })?;

        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl TryFrom<String> for Dpid {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Dpid> for String {
    fn from(dpid: Dpid) -> String {
        format!("{dpid}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn dpid_display() {
        let dpid = Dpid::new(0x0000_a840_2500_0001);
        assert_eq!(dpid.to_string(), "00:00:a8:40:25:00:00:01");
    }

    #[test]
    fn dpid_parse() {
        let dpid: Dpid = "00:00:00:00:00:00:00:2a".parse().unwrap();
        assert_eq!(dpid.val(), 42);
        assert!("00:00:2a".parse::<Dpid>().is_err());
    }
}
