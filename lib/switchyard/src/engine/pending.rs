// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Outstanding address resolutions.
//!
//! Callers resolving the same address share one ARP request: the first
//! to register is told to send it, everyone waits, and a single release
//! wakes them all.

use crate::sync::Condvar;
use crate::sync::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_api::Ipv4Addr;

#[derive(Default)]
struct Waiter {
    released: Mutex<bool>,
    cv: Condvar,
}

/// One caller's place in line for an address.
pub struct WaitToken {
    addr: Ipv4Addr,
    waiter: Arc<Waiter>,
    first: bool,
}

impl WaitToken {
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Whether this caller is the one who must send the request.
    pub fn is_first(&self) -> bool {
        self.first
    }
}

#[derive(Default)]
pub struct PendingTracker {
    waiters: Mutex<BTreeMap<Ipv4Addr, Vec<Arc<Waiter>>>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: Ipv4Addr) -> WaitToken {
        let waiter = Arc::new(Waiter::default());
        let mut waiters = self.waiters.lock();
        let list = waiters.entry(addr).or_default();
        let first = list.is_empty();
        list.push(waiter.clone());
        WaitToken { addr, waiter, first }
    }

    /// Wake everyone waiting on `addr` and drop the list. Returns the
    /// number of waiters woken.
    pub fn release(&self, addr: Ipv4Addr) -> usize {
        let Some(list) = self.waiters.lock().remove(&addr) else {
            return 0;
        };

        for w in &list {
            *w.released.lock() = true;
            w.cv.notify_all();
        }
        list.len()
    }

    /// Block until `token`'s address is released or `timeout` passes.
    /// Returns true if released.
    ///
    /// A caller that gives up takes itself out of the list, and takes
    /// the list out of the map if it was the last one in it.
    pub fn wait(&self, token: WaitToken, timeout: Duration) -> bool {
        let (released, _) = token.waiter.cv.wait_timeout_while(
            token.waiter.released.lock(),
            timeout,
            |released| !*released,
        );
        if *released {
            return true;
        }
        drop(released);

        let mut waiters = self.waiters.lock();
        // A release may have landed between the timeout and taking the
        // map lock. It set the flag before dropping the list.
        if *token.waiter.released.lock() {
            return true;
        }

        if let Some(list) = waiters.get_mut(&token.addr) {
            list.retain(|w| !Arc::ptr_eq(w, &token.waiter));
            if list.is_empty() {
                waiters.remove(&token.addr);
            }
        }
        false
    }

    pub fn is_pending(&self, addr: Ipv4Addr) -> bool {
        self.waiters.lock().contains_key(&addr)
    }

    pub fn waiting(&self, addr: Ipv4Addr) -> usize {
        self.waiters.lock().get(&addr).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    const IP: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 9]);

    #[test]
    fn first_registration_sends() {
        let p = PendingTracker::new();
        let a = p.register(IP);
        let b = p.register(IP);
        assert!(a.is_first());
        assert!(!b.is_first());
        assert_eq!(p.waiting(IP), 2);
    }

    #[test]
    fn release_wakes_all_once() {
        let p = Arc::new(PendingTracker::new());
        let tokens = (0..4).map(|_| p.register(IP)).collect::<Vec<_>>();

        let handles = tokens
            .into_iter()
            .map(|t| {
                let p = p.clone();
                thread::spawn(move || p.wait(t, Duration::from_secs(10)))
            })
            .collect::<Vec<_>>();

        // Give the waiters a moment to park; correctness doesn't depend
        // on it since the flag is checked before sleeping.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(p.release(IP), 4);
        assert!(!p.is_pending(IP));
        assert_eq!(p.release(IP), 0);

        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn release_before_wait() {
        let p = PendingTracker::new();
        let t = p.register(IP);
        p.release(IP);
        assert!(p.wait(t, Duration::from_millis(1)));
    }

    #[test]
    fn timeout_removes_only_self() {
        let p = PendingTracker::new();
        let a = p.register(IP);
        let b = p.register(IP);

        assert!(!p.wait(b, Duration::from_millis(5)));
        assert_eq!(p.waiting(IP), 1);

        assert!(!p.wait(a, Duration::from_millis(5)));
        assert!(!p.is_pending(IP));
    }
}
