// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::LinkMechanism;
use super::Mechanism;
use super::MechanismBase;
use super::MechanismContext;
use super::MechanismError;
use crate::engine::driver::EthernetDriver;
use crate::engine::rpc::Proc;
use std::sync::Arc;

/// Publishes port hardware addresses to the rest of the switch.
pub struct EthernetMechanism {
    base: MechanismBase,
    link: Arc<EthernetDriver>,
}

impl EthernetMechanism {
    pub const NAME: &'static str = "ethernet";

    pub fn new(link: Arc<EthernetDriver>) -> Self {
        Self { base: MechanismBase::new(), link }
    }

    pub fn driver(&self) -> &Arc<EthernetDriver> {
        &self.link
    }
}

impl Mechanism for EthernetMechanism {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &MechanismBase {
        &self.base
    }

    fn on_enable(&self, ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        self.link.register_procs(&ctx.rpc)?;
        Ok(())
    }

    fn on_disable(
        &self,
        ctx: &Arc<MechanismContext>,
        _was: super::Lifecycle,
    ) -> Result<(), MechanismError> {
        ctx.rpc.unregister(Proc::PortLinkAddr);
        Ok(())
    }
}

impl LinkMechanism for EthernetMechanism {}
