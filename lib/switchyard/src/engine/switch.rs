// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A connected datapath.

use super::conn::Conn;
use super::conn::ConnError;
use super::rpc::Proc;
use super::rpc::ProcRegistry;
use super::rpc::Reply;
use super::rpc::RpcError;
use crate::ofp::FlowMod;
use crate::ofp::Message;
use crate::ofp::MultipartReply;
use crate::ofp::MultipartRequest;
use crate::ofp::OFPMPF_REPLY_MORE;
use crate::ofp::PortDesc;
use crate::ofp::SwitchFeatures;
use crate::ofp::ports;
use crate::sync::Mutex;
use slog::Logger;
use slog::debug;
use slog::info;
use std::sync::Arc;
use switchyard_api::Dpid;
use switchyard_api::SwitchPortDesc;

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("all tables are allocated")]
    TableAllocate,

    #[error("port does not exist: {0}")]
    PortNotFound(u32),

    #[error("switch reported error during boot: type {err_type} code {code}")]
    Boot { err_type: u16, code: u16 },

    #[error("no switch constructor for protocol version 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("switch not found: {0}")]
    NotFound(Dpid),

    #[error("connection: {0}")]
    Conn(#[from] ConnError),

    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
}

/// Builds a [`Switch`] for one protocol version, handshake included. The
/// version is the one the switch announced in its HELLO.
pub type SwitchCtor =
    fn(Arc<dyn Conn>, u8, &Logger) -> Result<Arc<Switch>, SwitchError>;

/// One connected datapath: its connection, its ports, and the pool of
/// flow tables mechanisms may claim.
pub struct Switch {
    conn: Arc<dyn Conn>,
    features: SwitchFeatures,
    ports: Vec<PortDesc>,
    version: u8,
    // Seeded on first use. Table 0 stays in the pool for good: it is
    // where protocol dispatch happens.
    tables: Mutex<Option<Vec<u8>>>,
}

impl Switch {
    /// Assemble a handle from an already-completed handshake.
    pub fn new(
        conn: Arc<dyn Conn>,
        version: u8,
        features: SwitchFeatures,
        ports: Vec<PortDesc>,
    ) -> Self {
        Self { conn, features, ports, version, tables: Mutex::new(None) }
    }

    /// Perform the OpenFlow 1.3 handshake on `conn`.
    ///
    /// The caller has already consumed the switch's HELLO. We send our
    /// own HELLO, ask for features and port descriptions, and wipe table
    /// 0 down to a drop-everything rule so that nothing left over from a
    /// previous controller keeps forwarding. Then we read until both
    /// replies are in, answering echoes along the way. An ERROR from the
    /// switch aborts the boot.
    pub fn boot(
        conn: Arc<dyn Conn>,
        version: u8,
        log: &Logger,
    ) -> Result<Arc<Switch>, SwitchError> {
        conn.send_all(&[
            Message::Hello,
            Message::FeaturesRequest,
            Message::MultipartRequest(MultipartRequest::PortDesc),
            Message::FlowMod(FlowMod::table_flush(0)),
            Message::FlowMod(FlowMod::flow_drop(0)),
        ])?;

        let mut features = None;
        let mut ports = vec![];
        let mut ports_done = false;

        let features = loop {
            if let (Some(f), true) = (features, ports_done) {
                break f;
            }

            let env = conn.receive()?;
            match env.msg {
                Message::FeaturesReply(f) => features = Some(f),

                Message::MultipartReply(MultipartReply::PortDesc {
                    flags,
                    ports: mut part,
                }) => {
                    ports.append(&mut part);
                    ports_done = flags & OFPMPF_REPLY_MORE == 0;
                }

                Message::EchoRequest(data) => {
                    conn.send_xid(env.xid, &Message::EchoReply(data))?;
                    conn.flush()?;
                }

                Message::Error { err_type, code, .. } => {
                    return Err(SwitchError::Boot { err_type, code });
                }

                other => {
                    debug!(log, "ignoring message during boot";
                        "type" => %other.msg_type());
                }
            }
        };

        let sw = Switch::new(conn, version, features, ports);
        info!(log, "switch booted";
            "dpid" => %sw.datapath_id(),
            "name" => sw.name().unwrap_or("<unnamed>"),
            "ports" => sw.port_list().len(),
            "tables" => sw.n_tables(),
        );
        Ok(Arc::new(sw))
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn features(&self) -> &SwitchFeatures {
        &self.features
    }

    pub fn datapath_id(&self) -> Dpid {
        Dpid::new(self.features.datapath_id)
    }

    pub fn n_tables(&self) -> u8 {
        self.features.n_tables
    }

    /// The switch's name: that of its LOCAL port.
    pub fn name(&self) -> Option<&str> {
        self.ports
            .iter()
            .find(|p| p.port_no == ports::LOCAL)
            .map(|p| p.name.as_str())
    }

    /// Physical ports, LOCAL excluded.
    pub fn port_list(&self) -> Vec<&PortDesc> {
        self.ports.iter().filter(|p| p.port_no != ports::LOCAL).collect()
    }

    pub fn port_by_name(&self, name: &str) -> Option<&PortDesc> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn port_by_number(&self, port: u32) -> Option<&PortDesc> {
        self.ports.iter().find(|p| p.port_no == port)
    }

    pub fn port_descs(&self) -> Vec<SwitchPortDesc> {
        self.port_list().into_iter().map(SwitchPortDesc::from).collect()
    }

    /// Claim a flow table.
    pub fn allocate_table(&self) -> Result<u8, SwitchError> {
        let mut tables = self.tables.lock();
        let pool =
            tables.get_or_insert_with(|| (0..self.features.n_tables).collect());

        // Index 0 holds the reserved dispatch table.
        if pool.len() < 2 {
            return Err(SwitchError::TableAllocate);
        }
        Ok(pool.remove(1))
    }

    /// Return a table to the pool. Releasing a table the pool already
    /// holds, or releasing into a full pool, is ignored.
    pub fn release_table(&self, table: u8) {
        let mut tables = self.tables.lock();
        let pool =
            tables.get_or_insert_with(|| (0..self.features.n_tables).collect());

        if pool.len() >= usize::from(self.features.n_tables)
            || pool.contains(&table)
            || table >= self.features.n_tables
        {
            return;
        }
        pool.push(table);
    }

    /// Number of tables still available to mechanisms.
    pub fn free_tables(&self) -> usize {
        let tables = self.tables.lock();
        match tables.as_ref() {
            Some(pool) => pool.len().saturating_sub(1),
            None => usize::from(self.features.n_tables).saturating_sub(1),
        }
    }

    /// Answer the calls only the switch itself can.
    pub fn register_procs(
        self: &Arc<Self>,
        rpc: &ProcRegistry,
    ) -> Result<(), RpcError> {
        let dpid = self.datapath_id();
        rpc.register_fn(Proc::DatapathId, move |_| Ok(Reply::DatapathId(dpid)))?;

        let sw = Arc::downgrade(self);
        rpc.register_fn(Proc::PortNames, move |_| {
            let names = sw
                .upgrade()
                .map(|sw| sw.port_list().iter().map(|p| p.name.clone()).collect())
                .unwrap_or_default();
            Ok(Reply::PortNames(names))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::conn::NullConn;
    use switchyard_api::MacAddr;

    fn switch(n_tables: u8) -> Switch {
        let features = SwitchFeatures {
            datapath_id: 0x1,
            n_tables,
            ..Default::default()
        };
        let ports = vec![
            PortDesc::new(ports::LOCAL, "br0", MacAddr::ZERO),
            PortDesc::new(1, "br0p1", MacAddr::from_const([2, 0, 0, 0, 0, 1])),
            PortDesc::new(2, "br0p2", MacAddr::from_const([2, 0, 0, 0, 0, 2])),
        ];
        Switch::new(Arc::new(NullConn), 4, features, ports)
    }

    #[test]
    fn two_tables_leave_one_to_allocate() {
        let sw = switch(2);
        assert_eq!(sw.allocate_table().unwrap(), 1);
        assert!(matches!(sw.allocate_table(), Err(SwitchError::TableAllocate)));

        sw.release_table(1);
        assert_eq!(sw.allocate_table().unwrap(), 1);
    }

    #[test]
    fn release_never_overfills() {
        let sw = switch(3);
        sw.release_table(1);
        sw.release_table(7);
        assert_eq!(sw.free_tables(), 2);

        let t = sw.allocate_table().unwrap();
        sw.release_table(t);
        sw.release_table(t);
        assert_eq!(sw.free_tables(), 2);
    }

    #[test]
    fn tables_are_handed_out_once() {
        let sw = switch(4);
        let mut got =
            (0..3).map(|_| sw.allocate_table().unwrap()).collect::<Vec<_>>();
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(sw.allocate_table().is_err());
    }

    #[test]
    fn local_port_names_switch() {
        let sw = switch(2);
        assert_eq!(sw.name(), Some("br0"));
        assert_eq!(sw.datapath_id().to_string(), "00:00:00:00:00:00:00:01");
        let names = sw.port_list().iter().map(|p| p.port_no).collect::<Vec<_>>();
        assert_eq!(names, vec![1, 2]);
        assert_eq!(sw.port_by_name("br0p2").map(|p| p.port_no), Some(2));
        assert!(sw.port_by_number(9).is_none());
    }
}
