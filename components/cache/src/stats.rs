//! Lifecycle and operation counters

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cache-wide counters, bumped from dispatch passes and API calls
pub struct Stats {
    pub(crate) dispatch_passes: Counter,
    pub(crate) transitions: Counter,
    pub(crate) events_raised: Counter,
    pub(crate) lookups: Counter,
    pub(crate) lookups_positive: Counter,
    pub(crate) lookups_negative: Counter,
    pub(crate) lookup_failures: Counter,
    pub(crate) creations: Counter,
    pub(crate) available: Counter,
    pub(crate) updates: Counter,
    pub(crate) invalidations: Counter,
    pub(crate) kills: Counter,
    pub(crate) drops: Counter,
    pub(crate) ops_submitted: Counter,
    pub(crate) ops_deferred: Counter,
    pub(crate) ops_completed: Counter,
    pub(crate) ops_cancelled: Counter,
}

impl Stats {
    pub(crate) const fn new() -> Self {
        Self {
            dispatch_passes: Counter::new(),
            transitions: Counter::new(),
            events_raised: Counter::new(),
            lookups: Counter::new(),
            lookups_positive: Counter::new(),
            lookups_negative: Counter::new(),
            lookup_failures: Counter::new(),
            creations: Counter::new(),
            available: Counter::new(),
            updates: Counter::new(),
            invalidations: Counter::new(),
            kills: Counter::new(),
            drops: Counter::new(),
            ops_submitted: Counter::new(),
            ops_deferred: Counter::new(),
            ops_completed: Counter::new(),
            ops_cancelled: Counter::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatch_passes: self.dispatch_passes.get(),
            transitions: self.transitions.get(),
            events_raised: self.events_raised.get(),
            lookups: self.lookups.get(),
            lookups_positive: self.lookups_positive.get(),
            lookups_negative: self.lookups_negative.get(),
            lookup_failures: self.lookup_failures.get(),
            creations: self.creations.get(),
            available: self.available.get(),
            updates: self.updates.get(),
            invalidations: self.invalidations.get(),
            kills: self.kills.get(),
            drops: self.drops.get(),
            ops_submitted: self.ops_submitted.get(),
            ops_deferred: self.ops_deferred.get(),
            ops_completed: self.ops_completed.get(),
            ops_cancelled: self.ops_cancelled.get(),
        }
    }
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatch_passes: u64,
    pub transitions: u64,
    pub events_raised: u64,
    pub lookups: u64,
    pub lookups_positive: u64,
    pub lookups_negative: u64,
    pub lookup_failures: u64,
    pub creations: u64,
    pub available: u64,
    pub updates: u64,
    pub invalidations: u64,
    pub kills: u64,
    pub drops: u64,
    pub ops_submitted: u64,
    pub ops_deferred: u64,
    pub ops_completed: u64,
    pub ops_cancelled: u64,
}
