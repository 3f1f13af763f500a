// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Link- and network-layer drivers.
//!
//! A driver knows one layer's addressing: how to find a port's address,
//! how to parse and build addresses, and how to pull that layer's header
//! off a packet.

use super::rpc::Proc;
use super::rpc::ProcRegistry;
use super::rpc::Reply;
use super::rpc::RpcError;
use super::rpc::port_param;
use super::switch::Switch;
use super::switch::SwitchError;
use crate::sync::RwLock;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Ipv4Packet;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4IfAddr;
use switchyard_api::Ipv4PrefixLen;
use switchyard_api::MacAddr;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("malformed {what}: {err}")]
    Malformed { what: &'static str, err: smoltcp::wire::Error },
}

/// Ethernet addressing for one switch.
pub struct EthernetDriver {
    switch: Arc<Switch>,
}

impl EthernetDriver {
    pub const NAME: &'static str = "ethernet";

    pub fn new(switch: Arc<Switch>) -> Self {
        Self { switch }
    }

    /// Hardware address of `port`.
    pub fn addr(&self, port: u32) -> Result<MacAddr, SwitchError> {
        self.switch
            .port_by_number(port)
            .map(|p| p.hw_addr)
            .ok_or(SwitchError::PortNotFound(port))
    }

    pub fn create_addr(&self, bytes: &[u8]) -> Result<MacAddr, DriverError> {
        MacAddr::from_slice(bytes)
            .ok_or_else(|| DriverError::BadAddress(format!("{bytes:02x?}")))
    }

    /// Split a frame into its header and payload.
    pub fn read_frame<'a>(
        &self,
        buf: &'a [u8],
    ) -> Result<(EthernetRepr, &'a [u8]), DriverError> {
        let frame = EthernetFrame::new_checked(buf)
            .map_err(|err| DriverError::Malformed { what: "ethernet", err })?;
        let repr = EthernetRepr::parse(&frame)
            .map_err(|err| DriverError::Malformed { what: "ethernet", err })?;
        Ok((repr, &buf[repr.buffer_len()..]))
    }

    /// Build a frame around a payload produced by `fill`.
    pub fn write_frame<F>(
        &self,
        repr: &EthernetRepr,
        payload_len: usize,
        fill: F,
    ) -> Vec<u8>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut buf = vec![0u8; repr.buffer_len() + payload_len];
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        repr.emit(&mut frame);
        fill(frame.payload_mut());
        buf
    }

    pub fn register_procs(
        self: &Arc<Self>,
        rpc: &ProcRegistry,
    ) -> Result<(), RpcError> {
        let drv = self.clone();
        rpc.register_fn(Proc::PortLinkAddr, move |param| {
            let port = port_param(Proc::PortLinkAddr, param)?;
            drv.addr(port)
                .map(Reply::LinkAddr)
                .map_err(|_| RpcError::PortNotFound(port))
        })
    }
}

/// IPv4 addressing for one switch.
#[derive(Default)]
pub struct Ipv4Driver {
    addrs: RwLock<BTreeMap<u32, Ipv4IfAddr>>,
}

impl Ipv4Driver {
    pub const NAME: &'static str = "ipv4";

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `10.0.1.1/24`, or a bare `10.0.1.1` meaning a /32.
    pub fn parse_addr(&self, s: &str) -> Result<Ipv4IfAddr, DriverError> {
        s.parse().map_err(DriverError::BadAddress)
    }

    pub fn create_addr(
        &self,
        bytes: &[u8],
        mask: &[u8],
    ) -> Result<Ipv4IfAddr, DriverError> {
        let addr = Ipv4Addr::from_slice(bytes)
            .ok_or_else(|| DriverError::BadAddress(format!("{bytes:?}")))?;
        let mask = Ipv4Addr::from_slice(mask)
            .ok_or_else(|| DriverError::BadAddress(format!("{mask:?}")))?;
        let prefix_len =
            Ipv4PrefixLen::from_netmask(mask).map_err(DriverError::BadAddress)?;
        Ok(Ipv4IfAddr::new(addr, prefix_len))
    }

    pub fn update_addr(&self, port: u32, addr: Ipv4IfAddr) {
        self.addrs.write().insert(port, addr);
    }

    pub fn delete_addr(&self, port: u32) -> Option<Ipv4IfAddr> {
        self.addrs.write().remove(&port)
    }

    pub fn addr(&self, port: u32) -> Option<Ipv4IfAddr> {
        self.addrs.read().get(&port).copied()
    }

    pub fn addrs(&self) -> Vec<(u32, Ipv4IfAddr)> {
        self.addrs.read().iter().map(|(p, a)| (*p, *a)).collect()
    }

    pub fn read_packet<'a>(
        &self,
        buf: &'a [u8],
    ) -> Result<Ipv4Packet<&'a [u8]>, DriverError> {
        Ipv4Packet::new_checked(buf)
            .map_err(|err| DriverError::Malformed { what: "ipv4", err })
    }

    pub fn register_procs(
        self: &Arc<Self>,
        rpc: &ProcRegistry,
    ) -> Result<(), RpcError> {
        let drv = self.clone();
        rpc.register_fn(Proc::PortNetworkAddr, move |param| {
            let port = port_param(Proc::PortNetworkAddr, param)?;
            drv.addr(port)
                .map(Reply::NetworkAddr)
                .ok_or(RpcError::NoAddress(port))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_cidr_or_bare() {
        let drv = Ipv4Driver::new();
        let a = drv.parse_addr("10.0.1.1/24").unwrap();
        assert_eq!(a.addr(), "10.0.1.1".parse().unwrap());
        assert_eq!(a.network().to_string(), "10.0.1.0/24");

        let b = drv.parse_addr("10.0.1.1").unwrap();
        assert_eq!(b.prefix_len().val(), 32);

        assert!(drv.parse_addr("10.0.1/24").is_err());
    }

    #[test]
    fn create_from_mask() {
        let drv = Ipv4Driver::new();
        let a = drv.create_addr(&[192, 168, 0, 7], &[255, 255, 255, 0]).unwrap();
        assert_eq!(a.to_string(), "192.168.0.7/24");
        assert!(drv.create_addr(&[192, 168, 0, 7], &[255, 0, 255, 0]).is_err());
    }

    #[test]
    fn network_addr_proc() {
        let drv = Arc::new(Ipv4Driver::new());
        let rpc = ProcRegistry::new();
        drv.register_procs(&rpc).unwrap();

        assert_eq!(rpc.network_addr(1), Err(RpcError::NoAddress(1)));
        let a = drv.parse_addr("10.0.0.1/8").unwrap();
        drv.update_addr(1, a);
        assert_eq!(rpc.network_addr(1).unwrap(), a);
        drv.delete_addr(1);
        assert!(rpc.network_addr(1).is_err());
    }
}
