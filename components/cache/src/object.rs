//! The cache object and its state-machine dispatcher
//!
//! # Purpose
//! A `CacheObject` tracks one cached entity through lookup, creation,
//! steady-state service, invalidation, and teardown. All lifecycle work runs
//! on dispatcher workers; callers only raise events and wait.
//!
//! # Architecture
//! Objects form a tree. A child pins its parent with an `Arc` and may not
//! look itself up until the parent is available; until then it sits on the
//! parent's dependents list. Teardown runs the other way: a dying object
//! kills its dependents, then waits for live children and in-flight
//! operations to clear before detaching from its parent.
//!
//! ## Dispatch protocol
//! Exactly one state-machine pass runs per object at a time, without holding
//! any lock across backend calls:
//!
//! - `raise_event` ORs bits into the event word and enqueues the object
//!   unless `QUEUED` is already set.
//! - A pass clears `QUEUED` first, then test-and-sets `RUNNING`; a loser
//!   returns immediately, because the active pass re-checks pending events
//!   after clearing `RUNNING` and re-enqueues itself if any are relevant to
//!   the state it parked in. Raises are therefore never lost.
//! - A pass burns at most `MAX_TRANSITIONS` transitions, then yields its
//!   worker with `Disposition::Requeue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use cachet_engine::{Dispatcher, Disposition, EventMask, Work};

use crate::backend::{CacheBackend, LookupResult};
use crate::operation::{OpQueue, Operation, QueuedOp};
use crate::state::{ObjectEvents, ObjectState, OOB_EVENTS};
use crate::stats::Stats;
use crate::{CacheError, Result};

/// Transitions a single dispatch pass may make before yielding its worker
const MAX_TRANSITIONS: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ObjectFlags: u32 {
        /// An entry for this object sits in the dispatcher queue
        const QUEUED = 1 << 0;
        /// A dispatch pass is active
        const RUNNING = 1 << 1;
        /// Lookup/creation finished; operations may run
        const AVAILABLE = 1 << 2;
        /// Invalidation in progress; new operations are deferred
        const INVALIDATING = 1 << 3;
        /// Teardown has begun
        const DYING = 1 << 4;
        /// Teardown has finished
        const DEAD = 1 << 5;
        /// Delete backend storage on drop
        const RETIRE = 1 << 6;
    }
}

/// Shared plumbing an object needs to run: the worker pool, the storage
/// backend, and the cache-wide counters.
pub(crate) struct CacheCore {
    pub(crate) name: String,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) backend: Box<dyn CacheBackend>,
    pub(crate) stats: Stats,
    next_debug_id: AtomicU64,
}

impl CacheCore {
    pub(crate) fn new(name: String, dispatcher: Dispatcher, backend: Box<dyn CacheBackend>) -> Self {
        Self {
            name,
            dispatcher,
            backend,
            stats: Stats::new(),
            next_debug_id: AtomicU64::new(1),
        }
    }
}

struct Inner {
    state: ObjectState,
    dependents: VecDeque<Arc<CacheObject>>,
    ops: OpQueue,
}

/// One cached entity and its lifecycle state machine
pub struct CacheObject {
    key: String,
    debug_id: u64,
    parent: Option<Arc<CacheObject>>,
    core: Arc<CacheCore>,
    flags: AtomicU32,
    n_children: AtomicUsize,
    events: EventMask,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl CacheObject {
    pub(crate) fn new(
        core: Arc<CacheCore>,
        key: &str,
        parent: Option<Arc<CacheObject>>,
    ) -> Arc<Self> {
        if let Some(parent) = &parent {
            parent.n_children.fetch_add(1, Ordering::AcqRel);
        }
        let debug_id = core.next_debug_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            key: key.to_string(),
            debug_id,
            parent,
            core,
            flags: AtomicU32::new(0),
            n_children: AtomicUsize::new(0),
            events: EventMask::new(),
            inner: Mutex::new(Inner {
                state: ObjectState::WaitForInit,
                dependents: VecDeque::new(),
                ops: OpQueue::new(),
            }),
            wake: Condvar::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn debug_id(&self) -> u64 {
        self.debug_id
    }

    pub fn parent(&self) -> Option<&Arc<CacheObject>> {
        self.parent.as_ref()
    }

    /// Current machine state (racy snapshot, for observation only)
    pub fn state(&self) -> ObjectState {
        self.inner.lock().unwrap().state
    }

    /// Live children still attached to this object
    pub fn n_children(&self) -> usize {
        self.n_children.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.flag_any(ObjectFlags::AVAILABLE)
    }

    pub fn is_dying(&self) -> bool {
        self.flag_any(ObjectFlags::DYING | ObjectFlags::DEAD)
    }

    pub fn is_dead(&self) -> bool {
        self.flag_any(ObjectFlags::DEAD)
    }

    pub(crate) fn set_retire(&self) {
        self.flag_set(ObjectFlags::RETIRE);
    }

    // ---- flag helpers -------------------------------------------------

    /// Set `flag`, returning whether it was already set
    fn flag_set(&self, flag: ObjectFlags) -> bool {
        let prior = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        prior & flag.bits() == flag.bits()
    }

    fn flag_clear(&self, flag: ObjectFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    fn flag_any(&self, flags: ObjectFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flags.bits() != 0
    }

    // ---- events and queueing ------------------------------------------

    /// Raise events on this object and schedule a dispatch pass.
    ///
    /// Callable from any thread, including a pass on this very object.
    pub(crate) fn raise_event(self: &Arc<Self>, events: ObjectEvents) {
        if self.is_dead() {
            log::debug!("{self}: ignoring {events:?} raised on dead object");
            return;
        }
        log::trace!("{self}: raise {events:?}");
        self.core.stats.events_raised.inc();
        self.events.raise(events.bits());
        self.enqueue();
    }

    fn enqueue(self: &Arc<Self>) {
        if self.flag_set(ObjectFlags::QUEUED) {
            return;
        }
        if self.core.dispatcher.enqueue(self.clone()).is_err() {
            // Dispatcher is shutting down; the object stays parked
            self.flag_clear(ObjectFlags::QUEUED);
            log::debug!("{self}: dropped wakeup, dispatcher shut down");
        }
    }

    fn take_events(&self, mask: ObjectEvents) -> ObjectEvents {
        ObjectEvents::from_bits_truncate(self.events.take(mask.bits()))
    }

    // ---- the state machine --------------------------------------------

    fn set_state(&self, next: ObjectState) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.state;
        inner.state = next;
        self.core.stats.transitions.inc();
        log::debug!("{self}: {old} -> {next}");
        self.wake.notify_all();
    }

    fn run_machine(self: &Arc<Self>) -> Disposition {
        self.core.stats.dispatch_passes.inc();

        for _ in 0..MAX_TRANSITIONS {
            let state = self.inner.lock().unwrap().state;

            if state.is_terminal() {
                let stray = self.take_events(ObjectEvents::all());
                if !stray.is_empty() {
                    log::debug!("{self}: discarding {stray:?} in {state}");
                }
                return Disposition::Done;
            }

            if let Some(next) = self.check_oob(state) {
                self.set_state(next);
                continue;
            }

            if state.is_wait() {
                match self.wait_transition(state) {
                    Some(next) => self.set_state(next),
                    None => return Disposition::Done,
                }
            } else {
                let next = self.work_transition(state);
                self.set_state(next);
            }
        }

        // Still runnable; yield the worker
        Disposition::Requeue
    }

    /// Service out-of-band events ahead of the current state's work
    fn check_oob(&self, state: ObjectState) -> Option<ObjectState> {
        if state.is_dying() {
            // Already on the teardown path; further kill/error is noise
            let dropped = self.take_events(OOB_EVENTS);
            if !dropped.is_empty() {
                log::debug!("{self}: already dying, dropping {dropped:?}");
            }
            return None;
        }

        if !self.take_events(ObjectEvents::KILL).is_empty() {
            return Some(ObjectState::KillObject);
        }
        if !self.take_events(ObjectEvents::ERROR).is_empty() {
            return Some(if self.is_available() {
                ObjectState::KillObject
            } else {
                ObjectState::LookupFailure
            });
        }
        None
    }

    fn wait_transition(self: &Arc<Self>, state: ObjectState) -> Option<ObjectState> {
        match state {
            ObjectState::WaitForInit => {
                if self.take_events(ObjectEvents::NEW_CHILD).is_empty() {
                    return None;
                }
                Some(self.begin_lookup())
            }
            ObjectState::WaitForParent => {
                if self.take_events(ObjectEvents::PARENT_READY).is_empty() {
                    return None;
                }
                Some(ObjectState::LookUpObject)
            }
            ObjectState::WaitForCmd => {
                // Invalidation outranks update
                if !self.take_events(ObjectEvents::INVALIDATE).is_empty() {
                    return Some(ObjectState::InvalidateObject);
                }
                if !self.take_events(ObjectEvents::UPDATE).is_empty() {
                    return Some(ObjectState::UpdateObject);
                }
                None
            }
            ObjectState::WaitForClearance => {
                if self.take_events(ObjectEvents::CLEARED).is_empty() {
                    return None;
                }
                Some(ObjectState::InvalidateObject)
            }
            ObjectState::WaitForChildren => {
                if self.take_events(ObjectEvents::CLEARED).is_empty() {
                    return None;
                }
                Some(ObjectState::KillDependents)
            }
            _ => unreachable!("{state} is not a wait state"),
        }
    }

    fn work_transition(self: &Arc<Self>, state: ObjectState) -> ObjectState {
        match state {
            ObjectState::LookUpObject => self.do_lookup(),
            ObjectState::CreateObject => self.do_create(),
            ObjectState::Available => self.do_available(),
            ObjectState::JumpstartDeps => self.do_jumpstart(),
            ObjectState::UpdateObject => self.do_update(),
            ObjectState::InvalidateObject => self.do_invalidate(),
            ObjectState::LookupFailure => self.do_lookup_failure(),
            ObjectState::KillObject => self.do_kill(),
            ObjectState::KillDependents => self.do_kill_dependents(),
            ObjectState::DropObject => self.do_drop(),
            _ => unreachable!("{state} is not a work state"),
        }
    }

    /// Decide where to go once the birth command arrives.
    ///
    /// The re-check under the parent's inner lock closes the race against a
    /// concurrent jumpstart: either the parent sees us on its dependents
    /// list, or we see its AVAILABLE flag.
    fn begin_lookup(self: &Arc<Self>) -> ObjectState {
        let parent = match &self.parent {
            None => return ObjectState::LookUpObject,
            Some(parent) => parent,
        };

        if parent.is_available() {
            return ObjectState::LookUpObject;
        }
        if parent.is_dying() {
            log::debug!("{self}: parent {parent} is dying, aborting lookup");
            return ObjectState::LookupFailure;
        }

        let mut parent_inner = parent.inner.lock().unwrap();
        if parent.is_available() {
            ObjectState::LookUpObject
        } else if parent.is_dying() {
            ObjectState::LookupFailure
        } else {
            parent_inner.dependents.push_back(self.clone());
            ObjectState::WaitForParent
        }
    }

    fn do_lookup(&self) -> ObjectState {
        self.core.stats.lookups.inc();
        match self.core.backend.lookup_object(self) {
            Ok(LookupResult::Positive) => {
                self.core.stats.lookups_positive.inc();
                ObjectState::Available
            }
            Ok(LookupResult::Negative) => {
                self.core.stats.lookups_negative.inc();
                ObjectState::CreateObject
            }
            Err(err) => {
                log::warn!("{self}: lookup failed: {err}");
                ObjectState::LookupFailure
            }
        }
    }

    fn do_create(&self) -> ObjectState {
        match self.core.backend.create_object(self) {
            Ok(()) => {
                self.core.stats.creations.inc();
                ObjectState::Available
            }
            Err(err) => {
                log::warn!("{self}: creation failed: {err}");
                ObjectState::LookupFailure
            }
        }
    }

    fn do_available(self: &Arc<Self>) -> ObjectState {
        // Flag first: children re-checking under our inner lock must either
        // see this or be on the dependents list for the jumpstart to drain.
        self.flag_set(ObjectFlags::AVAILABLE);
        self.core.stats.available.inc();
        self.start_deferred_ops();
        ObjectState::JumpstartDeps
    }

    fn do_jumpstart(self: &Arc<Self>) -> ObjectState {
        let dependents = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.dependents)
        };
        for dep in dependents {
            dep.raise_event(ObjectEvents::PARENT_READY);
        }
        ObjectState::WaitForCmd
    }

    fn do_update(self: &Arc<Self>) -> ObjectState {
        match self.core.backend.update_object(self) {
            Ok(()) => {
                self.core.stats.updates.inc();
            }
            Err(err) => {
                log::warn!("{self}: update failed: {err}");
                self.raise_event(ObjectEvents::ERROR);
            }
        }
        ObjectState::WaitForCmd
    }

    fn do_invalidate(self: &Arc<Self>) -> ObjectState {
        // Flag before checking counts so a racing completion raises CLEARED
        self.flag_set(ObjectFlags::INVALIDATING);
        {
            let inner = self.inner.lock().unwrap();
            if inner.ops.n_ops() > 0 {
                log::debug!(
                    "{self}: invalidation waiting for {} operation(s)",
                    inner.ops.n_ops()
                );
                return ObjectState::WaitForClearance;
            }
        }

        match self.core.backend.invalidate_object(self) {
            Ok(()) => {
                self.core.stats.invalidations.inc();
            }
            Err(err) => {
                log::warn!("{self}: invalidation failed: {err}");
                self.flag_clear(ObjectFlags::INVALIDATING);
                self.raise_event(ObjectEvents::ERROR);
                return ObjectState::WaitForCmd;
            }
        }

        self.flag_clear(ObjectFlags::INVALIDATING);
        self.start_deferred_ops();
        // Refresh backend attributes now that the slate is clean
        self.raise_event(ObjectEvents::UPDATE);
        ObjectState::WaitForCmd
    }

    fn do_lookup_failure(&self) -> ObjectState {
        self.core.stats.lookup_failures.inc();
        ObjectState::KillObject
    }

    fn do_kill(self: &Arc<Self>) -> ObjectState {
        // Flag before draining: submits and completions that see DYING
        // refuse/report; anything that raced in earlier is drained here.
        self.flag_set(ObjectFlags::DYING);
        self.core.stats.kills.inc();

        let (cancelled, dependents) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.ops.cancel_all(),
                std::mem::take(&mut inner.dependents),
            )
        };

        self.core.stats.ops_cancelled.add(cancelled.len() as u64);
        for op in cancelled {
            op.cancel();
        }
        for dep in dependents {
            dep.raise_event(ObjectEvents::KILL);
        }

        ObjectState::KillDependents
    }

    fn do_kill_dependents(self: &Arc<Self>) -> ObjectState {
        let (dependents, n_ops) = {
            let mut inner = self.inner.lock().unwrap();
            (std::mem::take(&mut inner.dependents), inner.ops.n_ops())
        };
        for dep in dependents {
            dep.raise_event(ObjectEvents::KILL);
        }

        let n_children = self.n_children.load(Ordering::Acquire);
        if n_children > 0 || n_ops > 0 {
            log::debug!(
                "{self}: teardown waiting ({n_children} child(ren), {n_ops} op(s) in flight)"
            );
            ObjectState::WaitForChildren
        } else {
            ObjectState::DropObject
        }
    }

    fn do_drop(self: &Arc<Self>) -> ObjectState {
        let retired = self.flag_any(ObjectFlags::RETIRE);
        self.core.backend.drop_object(self, retired);
        self.core.stats.drops.inc();

        if let Some(parent) = &self.parent {
            parent.child_detached();
        }

        self.flag_set(ObjectFlags::DEAD);
        ObjectState::Dead
    }

    /// A child finished dropping; re-check any teardown wait
    fn child_detached(self: &Arc<Self>) {
        self.n_children.fetch_sub(1, Ordering::AcqRel);
        self.raise_event(ObjectEvents::CLEARED);
    }

    // ---- operations ---------------------------------------------------

    /// Submit an operation for execution against this object
    pub(crate) fn submit_op(self: &Arc<Self>, op: Arc<Operation>) -> Result<()> {
        let start_now = {
            let mut inner = self.inner.lock().unwrap();

            if self.is_dying() {
                drop(inner);
                op.cancel();
                self.core.stats.ops_cancelled.inc();
                return Err(CacheError::ObjectDead {
                    key: self.key.clone(),
                });
            }

            self.core.stats.ops_submitted.inc();

            let deferred = !self.is_available()
                || self.flag_any(ObjectFlags::INVALIDATING)
                || !inner.ops.admit(op.is_exclusive());
            if deferred {
                op.mark_pending();
                inner.ops.defer(op.clone());
                self.core.stats.ops_deferred.inc();
                false
            } else {
                inner.ops.start_new(&op);
                op.mark_in_progress();
                true
            }
        };

        if start_now {
            self.dispatch_op(op);
        }
        Ok(())
    }

    /// Called by a finished [`QueuedOp`]
    pub(crate) fn op_complete(self: &Arc<Self>, op: &Arc<Operation>) {
        let (started, cleared) = {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.finish(op);

            // Read under the lock: INVALIDATING/DYING are always set before
            // the machine takes `inner` to decide whether to park, so the
            // lock serializes this read against that decision.
            let blocked = self.flag_any(ObjectFlags::INVALIDATING | ObjectFlags::DYING);

            let mut started = Vec::new();
            if !blocked {
                while let Some(next) = inner.ops.start_next() {
                    next.mark_in_progress();
                    started.push(next);
                }
            }
            let cleared = blocked && inner.ops.n_ops() == 0;
            (started, cleared)
        };

        self.core.stats.ops_completed.inc();
        for next in started {
            self.dispatch_op(next);
        }
        if cleared {
            self.raise_event(ObjectEvents::CLEARED);
        }
    }

    /// Drain the deferred queue after becoming available or finishing an
    /// invalidation
    fn start_deferred_ops(self: &Arc<Self>) {
        let started = {
            let mut inner = self.inner.lock().unwrap();
            let mut started = Vec::new();
            while let Some(op) = inner.ops.start_next() {
                op.mark_in_progress();
                started.push(op);
            }
            started
        };
        for op in started {
            self.dispatch_op(op);
        }
    }

    fn dispatch_op(self: &Arc<Self>, op: Arc<Operation>) {
        let queued = Arc::new(QueuedOp {
            op: op.clone(),
            object: self.clone(),
        });
        if self.core.dispatcher.enqueue(queued).is_err() {
            log::debug!("{self}: dispatcher shut down, cancelling op {}", op.debug_id());
            op.cancel();
            self.op_complete(&op);
        }
    }

    // ---- waiting ------------------------------------------------------

    /// Block until the object comes available (or dies first)
    pub fn wait_for_available(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "object availability", |obj| {
            if obj.is_available() {
                Some(Ok(()))
            } else if obj.is_dying() {
                Some(Err(CacheError::ObjectDead {
                    key: obj.key.clone(),
                }))
            } else {
                None
            }
        })
    }

    /// Block until teardown finishes
    pub fn wait_for_dead(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "object teardown", |obj| {
            if obj.is_dead() {
                Some(Ok(()))
            } else {
                None
            }
        })
    }

    fn wait_for(
        &self,
        timeout: Duration,
        what: &'static str,
        check: impl Fn(&Self) -> Option<Result<()>>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(outcome) = check(self) {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::Timeout { what });
            }
            let (guard, _timed_out) = self.wake.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }
}

impl Work for CacheObject {
    fn execute(self: Arc<Self>) -> Disposition {
        // Allow re-queueing from here on; raises during the pass land a
        // fresh entry that the RUNNING guard turns into a cheap no-op.
        self.flag_clear(ObjectFlags::QUEUED);

        if self.flag_set(ObjectFlags::RUNNING) {
            return Disposition::Done;
        }
        let disposition = self.run_machine();
        self.flag_clear(ObjectFlags::RUNNING);

        if disposition == Disposition::Done {
            // Exit check: pick up anything raised while we were finishing
            let state = self.inner.lock().unwrap().state;
            let interest = if state.is_terminal() {
                ObjectEvents::empty()
            } else {
                state.wait_mask() | OOB_EVENTS
            };
            if self.events.pending(interest.bits()) != 0 {
                self.enqueue();
            }
        }
        disposition
    }
}

impl core::fmt::Display for CacheObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "obj{}({})", self.debug_id, self.key)
    }
}

impl core::fmt::Debug for CacheObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheObject")
            .field("debug_id", &self.debug_id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("n_children", &self.n_children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn test_core(name: &str) -> Arc<CacheCore> {
        let dispatcher = Dispatcher::new(name, 2).unwrap();
        Arc::new(CacheCore::new(
            name.to_string(),
            dispatcher,
            Box::new(MemBackend::new()),
        ))
    }

    #[test]
    fn flag_set_reports_prior_state() {
        let core = test_core("obj-flags");
        let obj = CacheObject::new(core.clone(), "k", None);

        assert!(!obj.flag_set(ObjectFlags::AVAILABLE));
        assert!(obj.flag_set(ObjectFlags::AVAILABLE));
        obj.flag_clear(ObjectFlags::AVAILABLE);
        assert!(!obj.is_available());
        core.dispatcher.shutdown();
    }

    #[test]
    fn new_object_starts_parked_in_wait_for_init() {
        let core = test_core("obj-init");
        let obj = CacheObject::new(core.clone(), "k", None);

        assert_eq!(obj.state(), ObjectState::WaitForInit);
        assert!(!obj.is_available());
        assert!(!obj.is_dying());
        core.dispatcher.shutdown();
    }

    #[test]
    fn child_construction_pins_parent_count() {
        let core = test_core("obj-children");
        let parent = CacheObject::new(core.clone(), "p", None);
        let _a = CacheObject::new(core.clone(), "a", Some(parent.clone()));
        let _b = CacheObject::new(core.clone(), "b", Some(parent.clone()));

        assert_eq!(parent.n_children(), 2);
        core.dispatcher.shutdown();
    }

    #[test]
    fn full_lifecycle_via_events() {
        let core = test_core("obj-lifecycle");
        let obj = CacheObject::new(core.clone(), "k", None);

        obj.raise_event(ObjectEvents::NEW_CHILD);
        obj.wait_for_available(Duration::from_secs(5)).unwrap();
        assert_eq!(core.stats.snapshot().lookups_negative, 1);
        assert_eq!(core.stats.snapshot().creations, 1);

        obj.raise_event(ObjectEvents::KILL);
        obj.wait_for_dead(Duration::from_secs(5)).unwrap();
        assert_eq!(obj.state(), ObjectState::Dead);
        assert_eq!(core.stats.snapshot().drops, 1);
        core.dispatcher.shutdown();
    }
}
