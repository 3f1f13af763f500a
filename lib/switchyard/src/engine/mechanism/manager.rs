// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A named collection of mechanisms of one category.

use super::Mechanism;
use super::MechanismContext;
use super::MechanismError;
use slog::Logger;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one mechanism made of a bulk lifecycle call.
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub name: &'static str,
    pub result: Result<(), MechanismError>,
}

impl LifecycleOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Log every failed outcome. Bulk calls never stop at a failure, so
/// this is how a faulty mechanism gets noticed.
pub fn log_outcomes(log: &Logger, op: &str, outcomes: &[LifecycleOutcome]) {
    for o in outcomes.iter().filter(|o| !o.is_ok()) {
        if let Err(e) = &o.result {
            warn!(log, "mechanism {op} failed";
                "mechanism" => o.name,
                "error" => %e,
            );
        }
    }
}

pub struct MechanismManager<M: ?Sized> {
    mechs: BTreeMap<&'static str, Arc<M>>,
}

impl<M: ?Sized> Default for MechanismManager<M> {
    fn default() -> Self {
        Self { mechs: BTreeMap::new() }
    }
}

impl<M: Mechanism + ?Sized> MechanismManager<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `m` under its own name, returning whatever it displaced.
    pub fn insert(&mut self, m: Arc<M>) -> Option<Arc<M>> {
        self.mechs.insert(m.name(), m)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<M>> {
        self.mechs.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.mechs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<M>> {
        self.mechs.values()
    }

    pub fn activated(&self) -> impl Iterator<Item = &Arc<M>> {
        self.mechs.values().filter(|m| m.activated())
    }

    pub fn len(&self) -> usize {
        self.mechs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mechs.is_empty()
    }

    fn each<F>(&self, f: F) -> Vec<LifecycleOutcome>
    where
        F: Fn(&M) -> Result<(), MechanismError>,
    {
        self.mechs
            .iter()
            .map(|(name, m)| LifecycleOutcome { name: *name, result: f(&**m) })
            .collect()
    }

    pub fn enable(&self, ctx: &Arc<MechanismContext>) -> Vec<LifecycleOutcome> {
        self.each(|m| m.enable(ctx))
    }

    pub fn activate(&self) -> Vec<LifecycleOutcome> {
        self.each(|m| m.activate())
    }

    pub fn disable(&self) -> Vec<LifecycleOutcome> {
        self.each(|m| m.disable())
    }

    pub fn detach(&self) {
        for m in self.mechs.values() {
            m.detach();
        }
    }

    fn lookup(&self, name: &str) -> Result<&Arc<M>, MechanismError> {
        self.get(name)
            .ok_or_else(|| MechanismError::NotRegistered(name.to_string()))
    }

    pub fn enable_by_name(
        &self,
        name: &str,
        ctx: &Arc<MechanismContext>,
    ) -> Result<(), MechanismError> {
        if !self.lookup(name)?.try_enable(ctx)? {
            return Err(MechanismError::AlreadyEnabled(name.to_string()));
        }
        Ok(())
    }

    pub fn activate_by_name(&self, name: &str) -> Result<(), MechanismError> {
        if !self.lookup(name)?.try_activate()? {
            return Err(MechanismError::AlreadyActivated(name.to_string()));
        }
        Ok(())
    }

    pub fn disable_by_name(&self, name: &str) -> Result<(), MechanismError> {
        if !self.lookup(name)?.try_disable()? {
            return Err(MechanismError::AlreadyDisabled(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::conn::NullConn;
    use crate::engine::mechanism::Lifecycle;
    use crate::engine::mechanism::LinkMechanism;
    use crate::engine::mechanism::MechanismBase;
    use crate::engine::switch::Switch;
    use crate::engine::switch::SwitchError;
    use crate::ofp::SwitchFeatures;
    use crate::sync::Mutex;

    /// Records the hooks it sees.
    struct Recorder {
        name: &'static str,
        base: MechanismBase,
        refuse_activate: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                base: MechanismBase::new(),
                refuse_activate: false,
                calls: Mutex::new(vec![]),
            })
        }

        fn refusing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                base: MechanismBase::new(),
                refuse_activate: true,
                calls: Mutex::new(vec![]),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Mechanism for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn base(&self) -> &MechanismBase {
            &self.base
        }

        fn on_enable(&self, _: &Arc<MechanismContext>) -> Result<(), MechanismError> {
            self.calls.lock().push("enable".into());
            Ok(())
        }

        fn on_activate(&self, _: &Arc<MechanismContext>) -> Result<(), MechanismError> {
            self.calls.lock().push("activate".into());
            if self.refuse_activate {
                return Err(SwitchError::TableAllocate.into());
            }
            Ok(())
        }

        fn on_disable(
            &self,
            _: &Arc<MechanismContext>,
            was: Lifecycle,
        ) -> Result<(), MechanismError> {
            self.calls.lock().push(format!("disable from {was}"));
            Ok(())
        }
    }

    impl LinkMechanism for Recorder {}

    fn context() -> Arc<MechanismContext> {
        let features = SwitchFeatures {
            datapath_id: 0x99,
            n_tables: 4,
            ..Default::default()
        };
        let sw = Arc::new(Switch::new(Arc::new(NullConn), 4, features, vec![]));
        let log = Logger::root(slog::Discard, slog::o!());
        Arc::new(MechanismContext::new(sw, &log))
    }

    fn manager(recorders: &[Arc<Recorder>]) -> MechanismManager<dyn LinkMechanism> {
        let mut mgr: MechanismManager<dyn LinkMechanism> = MechanismManager::new();
        for p in recorders {
            mgr.insert(p.clone());
        }
        mgr
    }

    #[test]
    fn one_failure_does_not_stop_the_rest() {
        let (a, b, c) = (Recorder::new("a"), Recorder::refusing("b"), Recorder::new("c"));
        let mgr = manager(&[c.clone(), b.clone(), a.clone()]);
        let ctx = context();

        assert!(mgr.enable(&ctx).iter().all(|o| o.is_ok()));
        let outcomes = mgr.activate();
        let names: Vec<_> = outcomes.iter().map(|o| (o.name, o.is_ok())).collect();
        assert_eq!(names, vec![("a", true), ("b", false), ("c", true)]);
        log_outcomes(&ctx.log, "activate", &outcomes);

        // A failed activation leaves the mechanism enabled.
        assert_eq!(b.lifecycle(), Lifecycle::Enabled);
        assert!(a.activated() && c.activated());
        assert_eq!(mgr.activated().count(), 2);
    }

    #[test]
    fn transitions_are_idempotent() {
        let p = Recorder::new("p");
        let ctx = context();

        p.enable(&ctx).unwrap();
        p.enable(&ctx).unwrap();
        p.activate().unwrap();
        p.activate().unwrap();
        p.disable().unwrap();
        p.disable().unwrap();

        assert_eq!(p.calls(), vec!["enable", "activate", "disable from activated"]);
        assert!(p.context().is_none());
    }

    #[test]
    fn activate_needs_enable() {
        let p = Recorder::new("p");
        assert!(matches!(p.activate(), Err(MechanismError::NotEnabled(_))));
        assert!(p.calls().is_empty());
    }

    #[test]
    fn by_name_reports_redundant_requests() {
        let p = Recorder::new("p");
        let mgr = manager(&[p.clone()]);
        let ctx = context();

        assert!(matches!(
            mgr.activate_by_name("p"),
            Err(MechanismError::NotEnabled(_))
        ));
        mgr.enable_by_name("p", &ctx).unwrap();
        assert!(matches!(
            mgr.enable_by_name("p", &ctx),
            Err(MechanismError::AlreadyEnabled(_))
        ));
        mgr.disable_by_name("p").unwrap();
        assert!(matches!(
            mgr.disable_by_name("p"),
            Err(MechanismError::AlreadyDisabled(_))
        ));
        assert!(matches!(
            mgr.enable_by_name("q", &ctx),
            Err(MechanismError::NotRegistered(_))
        ));
        assert_eq!(p.calls(), vec!["enable", "disable from enabled"]);
    }

    #[test]
    fn concurrent_enables_have_one_winner() {
        let p = Recorder::new("p");
        let mgr = manager(&[p.clone()]);
        let ctx = context();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| mgr.enable_by_name("p", &ctx)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
            r,
            Err(MechanismError::AlreadyEnabled(_))
        )));
        assert_eq!(p.calls(), vec!["enable"]);
    }

    #[test]
    fn detach_skips_the_switch() {
        let p = Recorder::new("p");
        let mgr = manager(&[p.clone()]);
        let ctx = context();

        mgr.enable(&ctx);
        mgr.activate();
        mgr.detach();
        assert_eq!(p.lifecycle(), Lifecycle::Disabled);
        assert_eq!(p.calls(), vec!["enable", "activate"]);
    }

    #[test]
    fn insert_replaces_by_name() {
        let mut mgr = manager(&[Recorder::new("p")]);
        let displaced = mgr.insert(Recorder::new("p"));
        assert!(displaced.is_some());
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.names(), vec!["p"]);
    }
}
