// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The controller engine.

pub mod conn;
pub mod cookie;
pub mod driver;
pub mod managers;
pub mod mechanism;
pub mod mux;
pub mod neigh;
pub mod pending;
pub mod routing_table;
pub mod rpc;
pub mod switch;
pub mod switch_manager;

pub use switch_manager::SwitchContext;
pub use switch_manager::SwitchManager;
