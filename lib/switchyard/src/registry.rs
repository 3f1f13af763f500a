// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Which mechanisms a switch gets, and how each is built.
//!
//! Registration happens once at startup; a duplicate name within a
//! category is an error the daemon treats as fatal. Every connecting
//! switch then gets a fresh instance of each registered mechanism.

use crate::engine::driver::EthernetDriver;
use crate::engine::driver::Ipv4Driver;
use crate::engine::mechanism::AddressResolver;
use crate::engine::mechanism::ExtensionMechanism;
use crate::engine::mechanism::LinkMechanism;
use crate::engine::mechanism::MechanismManager;
use crate::engine::mechanism::NetworkMechanism;
use crate::engine::mechanism::RoutingMechanism;
use crate::engine::mechanism::arp;
use crate::engine::mechanism::arp::ArpMechanism;
use crate::engine::mechanism::ethernet::EthernetMechanism;
use crate::engine::mechanism::icmp::IcmpMechanism;
use crate::engine::mechanism::ipv4_routing::Ipv4RoutingMechanism;
use crate::engine::mechanism::ofp_base::OfpBaseMechanism;
use crate::engine::switch::Switch;
use crate::engine::switch::SwitchCtor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_api::OFP_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{category} mechanism already registered: {name}")]
    Duplicate { category: &'static str, name: &'static str },

    #[error("switch constructor already registered for version 0x{0:02x}")]
    DuplicateVersion(u8),

    #[error("mechanism {name} needs {needs}")]
    Unsatisfied { name: &'static str, needs: &'static str },
}

/// What a mechanism constructor may draw on.
#[derive(Clone)]
pub struct MechanismDeps {
    pub link: Arc<EthernetDriver>,
    pub network: Arc<Ipv4Driver>,
    /// Present once the network mechanisms are built, if one of them
    /// resolves addresses.
    pub resolver: Option<Arc<dyn AddressResolver>>,
    pub arp_timeout: Duration,
}

pub type LinkCtor = fn(&MechanismDeps) -> Result<Arc<dyn LinkMechanism>, RegistryError>;
pub type NetworkCtor =
    fn(&MechanismDeps) -> Result<Arc<dyn NetworkMechanism>, RegistryError>;
pub type RoutingCtor =
    fn(&MechanismDeps) -> Result<Arc<dyn RoutingMechanism>, RegistryError>;
pub type ExtensionCtor =
    fn(&MechanismDeps) -> Result<Arc<dyn ExtensionMechanism>, RegistryError>;

fn new_ethernet(deps: &MechanismDeps) -> Result<Arc<dyn LinkMechanism>, RegistryError> {
    Ok(Arc::new(EthernetMechanism::new(deps.link.clone())))
}

fn new_arp(deps: &MechanismDeps) -> Result<Arc<dyn NetworkMechanism>, RegistryError> {
    Ok(Arc::new(ArpMechanism::new(deps.link.clone(), deps.arp_timeout)))
}

fn new_ipv4(deps: &MechanismDeps) -> Result<Arc<dyn RoutingMechanism>, RegistryError> {
    let resolver = deps.resolver.clone().ok_or(RegistryError::Unsatisfied {
        name: Ipv4RoutingMechanism::NAME,
        needs: "an address resolver",
    })?;
    Ok(Arc::new(Ipv4RoutingMechanism::new(
        deps.link.clone(),
        deps.network.clone(),
        resolver,
    )))
}

fn new_icmp(deps: &MechanismDeps) -> Result<Arc<dyn ExtensionMechanism>, RegistryError> {
    Ok(Arc::new(IcmpMechanism::new(deps.link.clone(), deps.network.clone())))
}

fn new_ofp_base(
    _deps: &MechanismDeps,
) -> Result<Arc<dyn ExtensionMechanism>, RegistryError> {
    Ok(Arc::new(OfpBaseMechanism::new()))
}

fn register<C>(
    map: &mut BTreeMap<&'static str, C>,
    category: &'static str,
    name: &'static str,
    ctor: C,
) -> Result<(), RegistryError> {
    if map.contains_key(name) {
        return Err(RegistryError::Duplicate { category, name });
    }
    map.insert(name, ctor);
    Ok(())
}

fn build<M: ?Sized, C>(
    map: &BTreeMap<&'static str, C>,
    deps: &MechanismDeps,
    ctor: impl Fn(&C, &MechanismDeps) -> Result<Arc<M>, RegistryError>,
) -> Result<MechanismManager<M>, RegistryError>
where
    M: crate::engine::mechanism::Mechanism,
{
    let mut mgr = MechanismManager::new();
    for c in map.values() {
        mgr.insert(ctor(c, deps)?);
    }
    Ok(mgr)
}

#[derive(Default)]
pub struct MechanismRegistry {
    link: BTreeMap<&'static str, LinkCtor>,
    network: BTreeMap<&'static str, NetworkCtor>,
    routing: BTreeMap<&'static str, RoutingCtor>,
    extension: BTreeMap<&'static str, ExtensionCtor>,
    switches: BTreeMap<u8, SwitchCtor>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock controller: OpenFlow 1.3 switches with Ethernet, ARP,
    /// IPv4 routing, ICMP echo and protocol housekeeping.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.switches.insert(OFP_VERSION, Switch::boot);
        reg.link.insert(EthernetMechanism::NAME, new_ethernet);
        reg.network.insert(ArpMechanism::NAME, new_arp);
        reg.routing.insert(Ipv4RoutingMechanism::NAME, new_ipv4);
        reg.extension.insert(IcmpMechanism::NAME, new_icmp);
        reg.extension.insert(OfpBaseMechanism::NAME, new_ofp_base);
        reg
    }

    pub fn register_switch(
        &mut self,
        version: u8,
        ctor: SwitchCtor,
    ) -> Result<(), RegistryError> {
        if self.switches.contains_key(&version) {
            return Err(RegistryError::DuplicateVersion(version));
        }
        self.switches.insert(version, ctor);
        Ok(())
    }

    pub fn register_link(
        &mut self,
        name: &'static str,
        ctor: LinkCtor,
    ) -> Result<(), RegistryError> {
        register(&mut self.link, "link", name, ctor)
    }

    pub fn register_network(
        &mut self,
        name: &'static str,
        ctor: NetworkCtor,
    ) -> Result<(), RegistryError> {
        register(&mut self.network, "network", name, ctor)
    }

    pub fn register_routing(
        &mut self,
        name: &'static str,
        ctor: RoutingCtor,
    ) -> Result<(), RegistryError> {
        register(&mut self.routing, "routing", name, ctor)
    }

    pub fn register_extension(
        &mut self,
        name: &'static str,
        ctor: ExtensionCtor,
    ) -> Result<(), RegistryError> {
        register(&mut self.extension, "extension", name, ctor)
    }

    pub fn switch_ctor(&self, version: u8) -> Option<SwitchCtor> {
        self.switches.get(&version).copied()
    }

    pub fn build_link(
        &self,
        deps: &MechanismDeps,
    ) -> Result<MechanismManager<dyn LinkMechanism>, RegistryError> {
        build(&self.link, deps, |c, d| c(d))
    }

    pub fn build_network(
        &self,
        deps: &MechanismDeps,
    ) -> Result<MechanismManager<dyn NetworkMechanism>, RegistryError> {
        build(&self.network, deps, |c, d| c(d))
    }

    pub fn build_routing(
        &self,
        deps: &MechanismDeps,
    ) -> Result<MechanismManager<dyn RoutingMechanism>, RegistryError> {
        build(&self.routing, deps, |c, d| c(d))
    }

    pub fn build_extension(
        &self,
        deps: &MechanismDeps,
    ) -> Result<MechanismManager<dyn ExtensionMechanism>, RegistryError> {
        build(&self.extension, deps, |c, d| c(d))
    }
}

impl MechanismDeps {
    pub fn new(link: Arc<EthernetDriver>, network: Arc<Ipv4Driver>) -> Self {
        Self { link, network, resolver: None, arp_timeout: arp::DEFAULT_TIMEOUT }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_names_rejected_per_category() {
        let mut reg = MechanismRegistry::with_defaults();
        let err = reg.register_network(ArpMechanism::NAME, new_arp).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Duplicate { category: "network", name: "arp" }
        ));

        // Same name, different category.
        reg.register_link(ArpMechanism::NAME, new_ethernet).unwrap();

        assert!(matches!(
            reg.register_switch(OFP_VERSION, Switch::boot),
            Err(RegistryError::DuplicateVersion(OFP_VERSION))
        ));
        assert!(reg.switch_ctor(OFP_VERSION).is_some());
        assert!(reg.switch_ctor(0x01).is_none());
    }
}
