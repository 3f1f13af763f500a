// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Errors reported to administrative callers of the controller.
///
/// This is the serializable face of the engine's error types: anything
/// crossing out of the engine (an admin API, a snapshot consumer)
/// carries one of these.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ApiError {
    /// No mechanism by this name is registered with the manager.
    NotRegistered(String),
    AlreadyEnabled(String),
    AlreadyActivated(String),
    AlreadyDisabled(String),
    /// The mechanism must be enabled before it can be activated.
    NotEnabled(String),
    SwitchNotFound(String),
    PortNotFound(u32),
    TableAllocate,
    ResolutionTimeout(String),
    BadAddress(String),
    System(String),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotRegistered(n) => write!(f, "mechanism not registered: {n}"),
            Self::AlreadyEnabled(n) => write!(f, "mechanism already enabled: {n}"),
            Self::AlreadyActivated(n) => {
                write!(f, "mechanism already activated: {n}")
            }
            Self::AlreadyDisabled(n) => {
                write!(f, "mechanism already disabled: {n}")
            }
            Self::NotEnabled(n) => write!(f, "mechanism not enabled: {n}"),
            Self::SwitchNotFound(id) => write!(f, "switch not found: {id}"),
            Self::PortNotFound(p) => write!(f, "port does not exist: {p}"),
            Self::TableAllocate => write!(f, "all tables are allocated"),
            Self::ResolutionTimeout(a) => {
                write!(f, "address resolution timed out: {a}")
            }
            Self::BadAddress(msg) => write!(f, "bad address: {msg}"),
            Self::System(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ApiError {}
