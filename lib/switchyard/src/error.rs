// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use crate::engine::conn::ConnError;
use crate::engine::driver::DriverError;
use crate::engine::mechanism::MechanismError;
use crate::engine::mechanism::ResolveError;
use crate::engine::rpc::RpcError;
use crate::engine::switch::SwitchError;
use crate::ofp::CodecError;
use crate::persist::PersistError;
use crate::registry::RegistryError;
use switchyard_api::ApiError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error(transparent)]
    Mechanism(#[from] MechanismError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn switch_api(e: &SwitchError) -> ApiError {
    match e {
        SwitchError::TableAllocate => ApiError::TableAllocate,
        SwitchError::PortNotFound(p) => ApiError::PortNotFound(*p),
        SwitchError::NotFound(dpid) => ApiError::SwitchNotFound(dpid.to_string()),
        _ => ApiError::System(e.to_string()),
    }
}

fn resolve_api(e: &ResolveError) -> ApiError {
    match e {
        ResolveError::Timeout(addr) => ApiError::ResolutionTimeout(addr.to_string()),
        _ => ApiError::System(e.to_string()),
    }
}

fn driver_api(e: &DriverError) -> ApiError {
    match e {
        DriverError::BadAddress(msg) => ApiError::BadAddress(msg.clone()),
        _ => ApiError::System(e.to_string()),
    }
}

fn mechanism_api(e: &MechanismError) -> ApiError {
    use MechanismError::*;

    match e {
        NotRegistered(n) => ApiError::NotRegistered(n.clone()),
        AlreadyEnabled(n) => ApiError::AlreadyEnabled(n.clone()),
        AlreadyActivated(n) => ApiError::AlreadyActivated(n.clone()),
        AlreadyDisabled(n) => ApiError::AlreadyDisabled(n.clone()),
        NotEnabled(n) => ApiError::NotEnabled(n.clone()),
        Switch(e) => switch_api(e),
        Resolve(e) => resolve_api(e),
        Driver(e) => driver_api(e),
        _ => ApiError::System(e.to_string()),
    }
}

impl From<&Error> for ApiError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Switch(e) => switch_api(e),
            Error::Mechanism(e) => mechanism_api(e),
            Error::Driver(e) => driver_api(e),
            Error::Resolve(e) => resolve_api(e),
            _ => ApiError::System(e.to_string()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use switchyard_api::Dpid;

    #[test]
    fn api_mapping_sees_through_mechanism_errors() {
        let e = Error::from(MechanismError::from(SwitchError::TableAllocate));
        assert_eq!(ApiError::from(&e), ApiError::TableAllocate);

        let e = Error::from(MechanismError::AlreadyEnabled("arp".into()));
        assert_eq!(ApiError::from(e), ApiError::AlreadyEnabled("arp".into()));

        let e = Error::from(SwitchError::NotFound(Dpid::new(1)));
        assert_eq!(
            ApiError::from(&e),
            ApiError::SwitchNotFound("00:00:00:00:00:00:00:01".into())
        );
    }
}
