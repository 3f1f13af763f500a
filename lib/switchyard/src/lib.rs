// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Switchyard: an OpenFlow 1.3 controller built from pluggable
//! mechanisms.
//!
//! Switches connect over TCP and are handed to the
//! [`engine::SwitchManager`], which boots them and gives each its own
//! set of mechanisms (Ethernet, ARP, IPv4 routing, ICMP echo, protocol
//! housekeeping). Mechanisms share a per-switch context: the switch
//! handle, a message multiplexer, and a registry of calls through which
//! they ask each other for things like a port's hardware address.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod engine;
pub mod error;
pub mod ofp;
pub mod persist;
pub mod print;
pub mod registry;
pub mod sync;

pub use error::Error;
pub use error::Result;
