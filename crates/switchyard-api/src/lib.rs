// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the switchyard engine, the daemon, and anything
//! that wants to look at controller state from the outside.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod dpid;
pub mod error;
pub mod ip;
pub mod mac;
pub mod network;
pub mod route;

pub use dpid::*;
pub use error::*;
pub use ip::*;
pub use mac::*;
pub use network::*;
pub use route::*;

/// The only OpenFlow wire version the controller speaks (1.3).
pub const OFP_VERSION: u8 = 0x04;

/// Well-known TCP port for OpenFlow controllers.
pub const OFP_TCP_PORT: u16 = 6653;
