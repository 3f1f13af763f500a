// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Message dispatch by type.
//!
//! Every handler registered for a message type sees every message of
//! that type. In the normal [`ServeMux::serve`] path each handler runs
//! on its own thread so that a handler blocked on address resolution
//! cannot stall delivery of the reply it is waiting for.

use super::conn::Envelope;
use super::conn::ResponseWriter;
use crate::ofp::MsgType;
use crate::sync::RwLock;
use slog::Logger;
use slog::debug;
use slog::error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

pub trait Handler: Send + Sync {
    fn serve(&self, w: &ResponseWriter, env: &Envelope);
}

/// Adapt a closure into a [`Handler`].
pub struct HandlerFn<F>(pub F);

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&ResponseWriter, &Envelope) + Send + Sync,
{
    fn serve(&self, w: &ResponseWriter, env: &Envelope) {
        (self.0)(w, env)
    }
}

/// Identifies one registration, for removal.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct HandlerId(u64);

type Entry = (HandlerId, Arc<dyn Handler>);

pub struct ServeMux {
    handlers: RwLock<BTreeMap<MsgType, Vec<Entry>>>,
    next_id: AtomicU64,
    log: Logger,
}

impl ServeMux {
    pub fn new(log: &Logger) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            log: log.new(slog::o!("unit" => "mux")),
        }
    }

    pub fn handle(&self, mt: MsgType, h: Arc<dyn Handler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(mt).or_default().push((id, h));
        id
    }

    pub fn handle_fn<F>(&self, mt: MsgType, f: F) -> HandlerId
    where
        F: Fn(&ResponseWriter, &Envelope) + Send + Sync + 'static,
    {
        self.handle(mt, Arc::new(HandlerFn(f)))
    }

    /// Drop a registration. Removing an unknown ID is a no-op.
    pub fn remove(&self, id: HandlerId) {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            list.retain(|(hid, _)| *hid != id);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// The handlers for `mt`, cloned out so no lock is held while they
    /// run.
    fn handlers_for(&self, mt: MsgType) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .read()
            .get(&mt)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_handler(&self, mt: MsgType) -> bool {
        self.handlers.read().contains_key(&mt)
    }

    /// Dispatch `env` to each handler on a thread of its own.
    pub fn serve(&self, w: &ResponseWriter, env: Envelope) {
        let mt = env.msg.msg_type();
        let handlers = self.handlers_for(mt);
        if handlers.is_empty() {
            debug!(self.log, "no handler"; "type" => %mt, "xid" => env.xid);
            return;
        }

        let env = Arc::new(env);
        for h in handlers {
            let w = w.clone();
            let env = env.clone();
            let res = thread::Builder::new()
                .name(format!("handler-{mt}"))
                .spawn(move || h.serve(&w, &env));

            if let Err(e) = res {
                error!(self.log, "failed to spawn handler";
                    "type" => %mt,
                    "error" => %e,
                );
            }
        }
    }

    /// Dispatch `env` to each handler in turn on the calling thread.
    pub fn serve_inline(&self, w: &ResponseWriter, env: &Envelope) {
        for h in self.handlers_for(env.msg.msg_type()) {
            h.serve(w, env);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::conn::NullConn;
    use crate::ofp::Message;
    use std::sync::atomic::AtomicUsize;

    fn env(msg: Message) -> Envelope {
        Envelope { version: 4, xid: 1, msg }
    }

    #[test]
    fn every_handler_for_the_type_runs() {
        let log = Logger::root(slog::Discard, slog::o!());
        let mux = ServeMux::new(&log);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let hits = hits.clone();
            mux.handle_fn(MsgType::EchoRequest, move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let other = hits.clone();
        mux.handle_fn(MsgType::Hello, move |_, _| {
            other.fetch_add(100, Ordering::SeqCst);
        });

        let w: ResponseWriter = Arc::new(NullConn);
        mux.serve_inline(&w, &env(Message::EchoRequest(vec![])));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_handlers_stop_running() {
        let log = Logger::root(slog::Discard, slog::o!());
        let mux = ServeMux::new(&log);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = mux.handle_fn(MsgType::Hello, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let w: ResponseWriter = Arc::new(NullConn);
        mux.serve_inline(&w, &env(Message::Hello));
        mux.remove(id);
        mux.serve_inline(&w, &env(Message::Hello));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mux.has_handler(MsgType::Hello));
    }

    #[test]
    fn threaded_dispatch() {
        let log = Logger::root(slog::Discard, slog::o!());
        let mux = ServeMux::new(&log);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = crate::sync::Mutex::new(tx);
        mux.handle_fn(MsgType::Hello, move |_, env| {
            tx.lock().send(env.xid).unwrap();
        });

        let w: ResponseWriter = Arc::new(NullConn);
        mux.serve(&w, env(Message::Hello));
        let xid = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(xid, 1);
    }
}
