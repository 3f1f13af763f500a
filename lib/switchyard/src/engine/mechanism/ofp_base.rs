// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection housekeeping: keepalives and error reports.

use super::ExtensionMechanism;
use super::Mechanism;
use super::MechanismBase;
use super::MechanismContext;
use super::MechanismError;
use crate::engine::conn::Envelope;
use crate::engine::conn::ResponseWriter;
use crate::ofp::Message;
use crate::ofp::MsgType;
use slog::Logger;
use slog::error;
use slog::warn;
use std::sync::Arc;

fn echo(log: &Logger, w: &ResponseWriter, env: &Envelope) {
    let Message::EchoRequest(data) = &env.msg else {
        return;
    };

    let res = w
        .send_xid(env.xid, &Message::EchoReply(data.clone()))
        .and_then(|_| w.flush());
    if let Err(e) = res {
        warn!(log, "failed to answer echo request"; "xid" => env.xid, "error" => %e);
    }
}

fn report(log: &Logger, env: &Envelope) {
    if let Message::Error { err_type, code, data } = &env.msg {
        error!(log, "switch reported error";
            "xid" => env.xid,
            "type" => err_type,
            "code" => code,
            "len" => data.len(),
        );
    }
}

#[derive(Default)]
pub struct OfpBaseMechanism {
    base: MechanismBase,
}

impl OfpBaseMechanism {
    pub const NAME: &'static str = "ofp-base";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Mechanism for OfpBaseMechanism {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &MechanismBase {
        &self.base
    }

    fn on_enable(&self, ctx: &Arc<MechanismContext>) -> Result<(), MechanismError> {
        let log = ctx.log.new(slog::o!("mechanism" => Self::NAME));
        let echo_log = log.clone();
        let ids = [
            ctx.mux.handle_fn(MsgType::EchoRequest, move |w, env| {
                echo(&echo_log, w, env)
            }),
            ctx.mux.handle_fn(MsgType::Error, move |_, env| report(&log, env)),
        ];
        self.base.track(ids);
        Ok(())
    }
}

impl ExtensionMechanism for OfpBaseMechanism {}
