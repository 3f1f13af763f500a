// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Lock wrappers.
//!
//! A poisoned lock means a handler thread panicked while mutating
//! controller state. These wrappers propagate that panic instead of
//! handing the poison to every caller.

use core::ops::Deref;
use core::ops::DerefMut;
use std::time::Duration;

pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

pub struct MutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> Mutex<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    pub fn new(val: T) -> Self {
        Mutex { inner: std::sync::Mutex::new(val) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap();
        MutexGuard { guard }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct RwLock<T> {
    inner: std::sync::RwLock<T>,
}

pub struct RwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct RwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> RwLock<T> {
    pub fn new(val: T) -> Self {
        RwLock { inner: std::sync::RwLock::new(val) }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap();
        RwLockReadGuard { guard }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let guard = self.inner.write().unwrap();
        RwLockWriteGuard { guard }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[derive(Default)]
pub struct Condvar {
    cv: std::sync::Condvar,
}

impl Condvar {
    pub fn new() -> Self {
        Self { cv: std::sync::Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    /// Block until notified.
    pub fn wait<'a, T>(&self, lock: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let guard = self.cv.wait(lock.guard).unwrap();
        MutexGuard { guard }
    }

    /// Block until `cond` returns false or `timeout` has elapsed. The
    /// returned flag is true when the wait gave up.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        lock: MutexGuard<'a, T>,
        timeout: Duration,
        cond: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let (guard, res) =
            self.cv.wait_timeout_while(lock.guard, timeout, cond).unwrap();
        (MutexGuard { guard }, res.timed_out())
    }
}
