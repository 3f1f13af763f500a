// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-switch call registry.
//!
//! Mechanisms and drivers cooperate through a small set of named
//! procedures rather than by holding references to each other. Whoever
//! owns a piece of state registers a caller for it; anyone holding the
//! switch's context can call it.

use crate::sync::RwLock;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchyard_api::Dpid;
use switchyard_api::Ipv4IfAddr;
use switchyard_api::MacAddr;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Proc {
    /// The datapath ID of the switch.
    DatapathId,
    /// Names of the switch's ports.
    PortNames,
    /// Hardware address of a port.
    PortLinkAddr,
    /// Network address assigned to a port.
    PortNetworkAddr,
}

impl Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::DatapathId => "datapath-id",
            Self::PortNames => "port-names",
            Self::PortLinkAddr => "port-link-addr",
            Self::PortNetworkAddr => "port-network-addr",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Param {
    None,
    Port(u32),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    DatapathId(Dpid),
    PortNames(Vec<String>),
    LinkAddr(MacAddr),
    NetworkAddr(Ipv4IfAddr),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("multiple registrations for {0}")]
    MultipleRegistrations(Proc),

    #[error("caller not registered for {0}")]
    CallerNotRegistered(Proc),

    #[error("bad parameter for {proc}: {param:?}")]
    BadParam { proc: Proc, param: Param },

    #[error("unexpected reply from {0}")]
    UnexpectedReply(Proc),

    #[error("port does not exist: {0}")]
    PortNotFound(u32),

    #[error("no address on port {0}")]
    NoAddress(u32),
}

pub trait ProcCaller: Send + Sync {
    fn call(&self, param: Param) -> Result<Reply, RpcError>;
}

impl<F> ProcCaller for F
where
    F: Fn(Param) -> Result<Reply, RpcError> + Send + Sync,
{
    fn call(&self, param: Param) -> Result<Reply, RpcError> {
        self(param)
    }
}

/// Pull the port number out of `param`, or say why not.
pub fn port_param(proc: Proc, param: Param) -> Result<u32, RpcError> {
    match param {
        Param::Port(p) => Ok(p),
        _ => Err(RpcError::BadParam { proc, param }),
    }
}

#[derive(Default)]
pub struct ProcRegistry {
    procs: RwLock<BTreeMap<Proc, Arc<dyn ProcCaller>>>,
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        proc: Proc,
        caller: Arc<dyn ProcCaller>,
    ) -> Result<(), RpcError> {
        let mut procs = self.procs.write();
        if procs.contains_key(&proc) {
            return Err(RpcError::MultipleRegistrations(proc));
        }
        procs.insert(proc, caller);
        Ok(())
    }

    pub fn register_fn<F>(&self, proc: Proc, f: F) -> Result<(), RpcError>
    where
        F: Fn(Param) -> Result<Reply, RpcError> + Send + Sync + 'static,
    {
        self.register(proc, Arc::new(f))
    }

    pub fn unregister(&self, proc: Proc) {
        self.procs.write().remove(&proc);
    }

    pub fn call(&self, proc: Proc, param: Param) -> Result<Reply, RpcError> {
        // Clone the caller out so a caller may itself make calls.
        let caller = self
            .procs
            .read()
            .get(&proc)
            .cloned()
            .ok_or(RpcError::CallerNotRegistered(proc))?;
        caller.call(param)
    }

    pub fn datapath_id(&self) -> Result<Dpid, RpcError> {
        match self.call(Proc::DatapathId, Param::None)? {
            Reply::DatapathId(id) => Ok(id),
            _ => Err(RpcError::UnexpectedReply(Proc::DatapathId)),
        }
    }

    pub fn port_names(&self) -> Result<Vec<String>, RpcError> {
        match self.call(Proc::PortNames, Param::None)? {
            Reply::PortNames(names) => Ok(names),
            _ => Err(RpcError::UnexpectedReply(Proc::PortNames)),
        }
    }

    pub fn link_addr(&self, port: u32) -> Result<MacAddr, RpcError> {
        match self.call(Proc::PortLinkAddr, Param::Port(port))? {
            Reply::LinkAddr(mac) => Ok(mac),
            _ => Err(RpcError::UnexpectedReply(Proc::PortLinkAddr)),
        }
    }

    pub fn network_addr(&self, port: u32) -> Result<Ipv4IfAddr, RpcError> {
        match self.call(Proc::PortNetworkAddr, Param::Port(port))? {
            Reply::NetworkAddr(addr) => Ok(addr),
            _ => Err(RpcError::UnexpectedReply(Proc::PortNetworkAddr)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_registration() {
        let rpc = ProcRegistry::new();
        rpc.register_fn(Proc::DatapathId, |_| {
            Ok(Reply::DatapathId(Dpid::new(1)))
        })
        .unwrap();

        let err = rpc
            .register_fn(Proc::DatapathId, |_| Ok(Reply::DatapathId(Dpid::new(2))))
            .unwrap_err();
        assert_eq!(err, RpcError::MultipleRegistrations(Proc::DatapathId));
        assert_eq!(rpc.datapath_id().unwrap(), Dpid::new(1));
    }

    #[test]
    fn unregistered_caller() {
        let rpc = ProcRegistry::new();
        assert_eq!(
            rpc.link_addr(1),
            Err(RpcError::CallerNotRegistered(Proc::PortLinkAddr))
        );

        rpc.register_fn(Proc::PortLinkAddr, |p| {
            let port = port_param(Proc::PortLinkAddr, p)?;
            Ok(Reply::LinkAddr(MacAddr::from_const([2, 0, 0, 0, 0, port as u8])))
        })
        .unwrap();
        assert_eq!(
            rpc.link_addr(3).unwrap(),
            MacAddr::from_const([2, 0, 0, 0, 0, 3])
        );

        rpc.unregister(Proc::PortLinkAddr);
        assert!(rpc.link_addr(3).is_err());
    }

    #[test]
    fn wrong_reply_shape() {
        let rpc = ProcRegistry::new();
        rpc.register_fn(Proc::PortNames, |_| {
            Ok(Reply::DatapathId(Dpid::new(1)))
        })
        .unwrap();
        assert_eq!(
            rpc.port_names(),
            Err(RpcError::UnexpectedReply(Proc::PortNames))
        );
    }
}
