// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Mechanisms: pluggable units of protocol behavior.
//!
//! A mechanism is bound to one switch. It moves through three states:
//!
//! ```text
//! Disabled --enable--> Enabled --activate--> Activated
//!    ^                    |                      |
//!    +------disable-------+----------------------+
//! ```
//!
//! Enabling binds the switch's [`MechanismContext`] and registers
//! message handlers; activating claims switch resources (tables, base
//! flows). Each transition is idempotent: asking for the state a
//! mechanism is already in does nothing. Managers that want an error
//! for a redundant request check first; see [`manager`].
//!
//! Mechanisms come in four categories, each its own trait, so that a
//! manager only ever holds mechanisms offering the hooks it calls.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4_routing;
pub mod manager;
pub mod ofp_base;

use super::conn::Conn;
use super::conn::ConnError;
use super::cookie::CookieJar;
use super::driver::DriverError;
use super::mux::HandlerId;
use super::mux::ServeMux;
use super::routing_table::RouteEntry;
use super::rpc::ProcRegistry;
use super::rpc::RpcError;
use super::switch::Switch;
use super::switch::SwitchError;
use crate::ofp::Action;
use crate::ofp::CML_NO_BUFFER;
use crate::ofp::FlowMod;
use crate::ofp::Instruction;
use crate::ofp::Match;
use crate::ofp::Message;
use crate::ofp::OxmField;
use crate::ofp::ports;
use crate::sync::Mutex;
use crate::sync::RwLock;
use core::fmt;
use core::fmt::Display;
use slog::Logger;
use std::sync::Arc;
use switchyard_api::Ipv4Addr;
use switchyard_api::Ipv4Cidr;
use switchyard_api::Ipv4IfAddr;
use switchyard_api::MacAddr;
use switchyard_api::NeighEntryDump;
use switchyard_api::RouteType;

pub use manager::LifecycleOutcome;
pub use manager::MechanismManager;

#[derive(Debug, thiserror::Error)]
pub enum MechanismError {
    #[error("mechanism not registered: {0}")]
    NotRegistered(String),

    #[error("mechanism already enabled: {0}")]
    AlreadyEnabled(String),

    #[error("mechanism already activated: {0}")]
    AlreadyActivated(String),

    #[error("mechanism already disabled: {0}")]
    AlreadyDisabled(String),

    #[error("mechanism not enabled: {0}")]
    NotEnabled(String),

    #[error("mechanism not activated: {0}")]
    NotActivated(String),

    #[error("switch: {0}")]
    Switch(#[from] SwitchError),

    #[error("connection: {0}")]
    Conn(#[from] ConnError),

    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("driver: {0}")]
    Driver(#[from] DriverError),

    #[error("resolve: {0}")]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("address resolution timed out: {0}")]
    Timeout(Ipv4Addr),

    #[error("address not resolved: {0}")]
    Unresolved(Ipv4Addr),

    #[error("resolver not active")]
    NotActive,

    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("failed to send request: {0}")]
    Send(#[from] ConnError),
}

/// Maps a network address to the link address it lives at.
///
/// The IPv4 routing mechanism is handed one of these when it is built;
/// in practice it is the ARP mechanism of the same switch.
pub trait AddressResolver: Send + Sync {
    /// Resolve `addr`, which is reachable out of `port`. May block.
    fn resolve(&self, addr: Ipv4Addr, port: u32) -> Result<MacAddr, ResolveError>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Lifecycle {
    #[default]
    Disabled,
    Enabled,
    Activated,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Activated => "activated",
        };
        write!(f, "{s}")
    }
}

/// Everything the mechanisms of one switch share.
pub struct MechanismContext {
    pub switch: Arc<Switch>,
    pub rpc: Arc<ProcRegistry>,
    pub mux: Arc<ServeMux>,
    pub cookies: Arc<CookieJar>,
    pub log: Logger,
}

impl MechanismContext {
    pub fn new(switch: Arc<Switch>, log: &Logger) -> Self {
        let log = log.new(slog::o!("dpid" => switch.datapath_id().to_string()));
        Self {
            switch,
            rpc: Arc::new(ProcRegistry::new()),
            mux: Arc::new(ServeMux::new(&log)),
            cookies: Arc::new(CookieJar::new()),
            log,
        }
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        self.switch.conn()
    }
}

/// The state every mechanism carries: where it is in its lifecycle,
/// the context it is bound to, and the handlers it registered.
#[derive(Default)]
pub struct MechanismBase {
    state: Mutex<Lifecycle>,
    ctx: RwLock<Option<Arc<MechanismContext>>>,
    handlers: Mutex<Vec<HandlerId>>,
}

impl MechanismBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.lock()
    }

    pub fn context(&self) -> Option<Arc<MechanismContext>> {
        self.ctx.read().clone()
    }

    /// Remember handler registrations so that disable can undo them.
    pub fn track<I: IntoIterator<Item = HandlerId>>(&self, ids: I) {
        self.handlers.lock().extend(ids);
    }

    fn begin_enable(&self, ctx: &Arc<MechanismContext>) -> bool {
        let mut state = self.state.lock();
        if *state != Lifecycle::Disabled {
            return false;
        }
        *state = Lifecycle::Enabled;
        *self.ctx.write() = Some(ctx.clone());
        true
    }

    fn begin_activate(&self) -> Result<Option<Arc<MechanismContext>>, ()> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Disabled => Err(()),
            Lifecycle::Activated => Ok(None),
            Lifecycle::Enabled => {
                *state = Lifecycle::Activated;
                Ok(self.ctx.read().clone())
            }
        }
    }

    fn revert_activate(&self) {
        let mut state = self.state.lock();
        if *state == Lifecycle::Activated {
            *state = Lifecycle::Enabled;
        }
    }

    /// Move to Disabled, handing back what needs undoing.
    fn begin_disable(&self) -> Option<(Arc<MechanismContext>, Vec<HandlerId>)> {
        let mut state = self.state.lock();
        if *state == Lifecycle::Disabled {
            return None;
        }
        *state = Lifecycle::Disabled;
        let ctx = self.ctx.write().take()?;
        let ids = core::mem::take(&mut *self.handlers.lock());
        Some((ctx, ids))
    }
}

pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;

    fn base(&self) -> &MechanismBase;

    /// Called once on the transition to Enabled.
    fn on_enable(&self, _ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Called once on the transition to Activated.
    fn on_activate(&self, _ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Called once on the transition to Disabled, after the handlers
    /// tracked in the base have been removed. A mechanism that
    /// installed flows retracts them here.
    fn on_disable(
        &self,
        _ctx: &Arc<MechanismContext>,
        _was: Lifecycle,
    ) -> Result<(), MechanismError> {
        Ok(())
    }

    fn lifecycle(&self) -> Lifecycle {
        self.base().lifecycle()
    }

    fn enabled(&self) -> bool {
        self.lifecycle() != Lifecycle::Disabled
    }

    fn activated(&self) -> bool {
        self.lifecycle() == Lifecycle::Activated
    }

    fn context(&self) -> Option<Arc<MechanismContext>> {
        self.base().context()
    }

    fn enable(&self, ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        self.try_enable(ctx).map(drop)
    }

    fn activate(&self) -> Result<(), MechanismError> {
        self.try_activate().map(drop)
    }

    fn disable(&self) -> Result<(), MechanismError> {
        self.try_disable().map(drop)
    }

    /// Enable, reporting whether this call made the transition.
    fn try_enable(&self, ctx: &Arc<MechanismContext>) -> Result<bool, MechanismError> {
        if !self.base().begin_enable(ctx) {
            return Ok(false);
        }

        if let Err(e) = self.on_enable(ctx) {
            self.detach();
            return Err(e);
        }
        Ok(true)
    }

    /// Activate, reporting whether this call made the transition.
    fn try_activate(&self) -> Result<bool, MechanismError> {
        let ctx = match self.base().begin_activate() {
            Err(()) => {
                return Err(MechanismError::NotEnabled(self.name().to_string()));
            }
            Ok(None) => return Ok(false),
            Ok(Some(ctx)) => ctx,
        };

        if let Err(e) = self.on_activate(&ctx) {
            self.base().revert_activate();
            return Err(e);
        }
        Ok(true)
    }

    /// Disable, reporting whether this call made the transition.
    fn try_disable(&self) -> Result<bool, MechanismError> {
        let was = self.lifecycle();
        let Some((ctx, ids)) = self.base().begin_disable() else {
            return Ok(false);
        };

        for id in ids {
            ctx.mux.remove(id);
        }
        self.on_disable(&ctx, was)?;
        Ok(true)
    }

    /// Drop back to Disabled without touching the switch: handlers are
    /// removed and the context is let go, but no flows are retracted.
    /// Used when the switch is already gone.
    fn detach(&self) {
        if let Some((ctx, ids)) = self.base().begin_disable() {
            for id in ids {
                ctx.mux.remove(id);
            }
        }
    }
}

/// A network address as bound to a port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkContext {
    pub addr: Ipv4IfAddr,
    pub link_addr: MacAddr,
    pub port: u32,
}

/// One route, parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteContext {
    pub route_type: RouteType,
    pub network: Ipv4Cidr,
    pub next_hop: Option<Ipv4Addr>,
    pub metric: u32,
    pub port: u32,
}

pub trait LinkMechanism: Mechanism {}

pub trait NetworkMechanism: Mechanism {
    fn update_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError>;

    fn delete_network(&self, nctx: &NetworkContext) -> Result<(), MechanismError>;

    /// This mechanism as an address resolver, if it is one.
    fn resolver(self: Arc<Self>) -> Option<Arc<dyn AddressResolver>> {
        None
    }

    fn neighbors(&self) -> Vec<NeighEntryDump> {
        vec![]
    }
}

pub trait RoutingMechanism: Mechanism {
    fn update_route(&self, rctx: &RouteContext) -> Result<(), MechanismError>;

    fn delete_route(&self, rctx: &RouteContext) -> Result<(), MechanismError>;

    fn routes(&self) -> Vec<RouteEntry> {
        vec![]
    }
}

/// Anything that is neither link, network, nor routing. Extensions may
/// follow network changes but need not.
pub trait ExtensionMechanism: Mechanism {
    fn update_network(&self, _nctx: &NetworkContext) -> Result<(), MechanismError> {
        Ok(())
    }

    fn delete_network(&self, _nctx: &NetworkContext) -> Result<(), MechanismError> {
        Ok(())
    }
}

/// The table a mechanism claimed at activation, or an error naming it.
pub(crate) fn claimed_table(
    name: &str,
    table: &Mutex<Option<u8>>,
) -> Result<u8, MechanismError> {
    table.lock().ok_or_else(|| MechanismError::NotActivated(name.to_string()))
}

/// Instructions sending a matched packet, whole, to the controller.
pub(crate) fn to_controller() -> Vec<Instruction> {
    vec![Instruction::ApplyActions(vec![Action::Output {
        port: ports::CONTROLLER,
        max_len: CML_NO_BUFFER,
    }])]
}

/// The table 0 rule steering one ethertype into a mechanism's table.
pub(crate) fn goto_rule(eth_type: u16, priority: u16, table: u8) -> FlowMod {
    FlowMod::add(0, priority, Match::from(vec![OxmField::EthType(eth_type)]))
        .with_instructions(vec![Instruction::GotoTable(table)])
}

/// Claim a table and steer `eth_type` into it: the steering rule in
/// table 0, then an empty table ending in a drop-all.
pub(crate) fn claim_table(
    ctx: &MechanismContext,
    eth_type: u16,
    priority: u16,
) -> Result<u8, MechanismError> {
    let table = ctx.switch.allocate_table()?;
    let res = ctx.conn().send_all(&[
        Message::FlowMod(goto_rule(eth_type, priority, table)),
        Message::FlowMod(FlowMod::table_flush(table)),
        Message::FlowMod(FlowMod::flow_drop(table)),
    ]);

    if let Err(e) = res {
        ctx.switch.release_table(table);
        return Err(e.into());
    }
    Ok(table)
}

/// Undo [`claim_table`].
pub(crate) fn surrender_table(
    ctx: &MechanismContext,
    eth_type: u16,
    priority: u16,
    table: u8,
) -> Result<(), MechanismError> {
    ctx.switch.release_table(table);
    // Strict: other table 0 rules may match on the same ethertype.
    let steer = Match::from(vec![OxmField::EthType(eth_type)]);
    ctx.conn().send_all(&[
        Message::FlowMod(FlowMod::flow_remove(0, priority, steer)),
        Message::FlowMod(FlowMod::table_flush(table)),
    ])?;
    Ok(())
}
