// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Cookie correlation.
//!
//! A switch tells the controller which flow caused a PACKET_IN, or
//! which flow went away in a FLOW_REMOVED, only by echoing back the
//! cookie the controller put on that flow. A [`CookieFilter`] stamps a
//! fresh cookie on each flow a mechanism installs, remembers which
//! handler goes with it, and routes the echoed events back to that
//! handler.

use super::conn::Envelope;
use super::conn::ResponseWriter;
use super::mux::Handler;
use super::mux::HandlerId;
use super::mux::ServeMux;
use crate::ofp::FlowMod;
use crate::ofp::Message;
use crate::ofp::MsgType;
use crate::ofp::OFPFF_SEND_FLOW_REM;
use crate::sync::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Per-switch cookie source.
///
/// Every filter on a switch draws from the same jar so that cookies
/// stay unique across mechanisms: each filter sees every PACKET_IN.
#[derive(Debug)]
pub struct CookieJar(AtomicU64);

impl CookieJar {
    /// Start from a random point so that cookies left on a switch by a
    /// previous controller run are unlikely to collide.
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(seed: u64) -> Self {
        Self(AtomicU64::new(seed))
    }

    /// The next cookie. Zero means "no cookie" on the wire and is never
    /// handed out.
    pub fn next(&self) -> u64 {
        loop {
            let c = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if c != 0 {
                return c;
            }
        }
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls the cookie out of an incoming message.
pub type Baker = fn(&Message) -> Option<u64>;

pub fn packet_in_cookie(msg: &Message) -> Option<u64> {
    match msg {
        Message::PacketIn(pi) => Some(pi.cookie),
        _ => None,
    }
}

pub fn flow_removed_cookie(msg: &Message) -> Option<u64> {
    match msg {
        Message::FlowRemoved(fr) => Some(fr.cookie),
        _ => None,
    }
}

pub struct CookieFilter {
    jar: Arc<CookieJar>,
    baker: Baker,
    cookies: Mutex<BTreeMap<u64, Arc<dyn Handler>>>,
}

impl CookieFilter {
    pub fn new(jar: Arc<CookieJar>, baker: Baker) -> Self {
        Self { jar, baker, cookies: Mutex::new(BTreeMap::new()) }
    }

    /// A filter routing PACKET_IN by cookie.
    pub fn packet_in(jar: Arc<CookieJar>) -> Self {
        Self::new(jar, packet_in_cookie)
    }

    /// Stamp `fm` with a fresh cookie bound to `h`.
    ///
    /// The flow is also marked to report its removal so that the
    /// binding can be released.
    pub fn filter_func(&self, fm: &mut FlowMod, h: Arc<dyn Handler>) -> u64 {
        let cookie = self.jar.next();
        fm.cookie = cookie;
        fm.flags |= OFPFF_SEND_FLOW_REM;
        self.cookies.lock().insert(cookie, h);
        cookie
    }

    pub fn filter_fn<F>(&self, fm: &mut FlowMod, f: F) -> u64
    where
        F: Fn(&ResponseWriter, &Envelope) + Send + Sync + 'static,
    {
        self.filter_func(fm, Arc::new(super::mux::HandlerFn(f)))
    }

    /// Forget the binding for the cookie carried by a FLOW_REMOVED.
    pub fn release(&self, msg: &Message) {
        if let Some(cookie) = flow_removed_cookie(msg) {
            self.release_cookie(cookie);
        }
    }

    pub fn release_cookie(&self, cookie: u64) {
        self.cookies.lock().remove(&cookie);
    }

    pub fn contains(&self, cookie: u64) -> bool {
        self.cookies.lock().contains_key(&cookie)
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hook this filter into `mux`: PACKET_IN is served, FLOW_REMOVED
    /// releases.
    pub fn attach(self: &Arc<Self>, mux: &ServeMux) -> Vec<HandlerId> {
        let release = self.clone();
        vec![
            mux.handle(MsgType::PacketIn, self.clone()),
            mux.handle_fn(MsgType::FlowRemoved, move |_, env| {
                release.release(&env.msg)
            }),
        ]
    }
}

impl Handler for CookieFilter {
    /// Route `env` to the handler bound to its cookie. A cookie with no
    /// binding belongs to a flow that is already gone, or to another
    /// filter; either way the message is dropped.
    fn serve(&self, w: &ResponseWriter, env: &Envelope) {
        let Some(cookie) = (self.baker)(&env.msg) else {
            return;
        };

        let h = self.cookies.lock().get(&cookie).cloned();
        if let Some(h) = h {
            h.serve(w, env);
        }
    }
}
