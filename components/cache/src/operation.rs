//! Operation queuing
//!
//! Work against a cache object (reads, writes, attribute fetches) is wrapped
//! in an [`Operation`] and submitted through the object. Admission rules:
//!
//! - An object that is not yet available, or is mid-invalidation, defers
//!   everything.
//! - An exclusive operation runs only when nothing else is in progress.
//! - A shared operation runs only when no exclusive operation is in progress,
//!   and never jumps the FIFO queue.
//! - Killing an object cancels every deferred operation; in-flight ones are
//!   left to finish.
//!
//! When the in-flight count drops to zero on an object that is invalidating
//! or dying, the queue raises `CLEARED` so the state machine can move on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use cachet_engine::{Disposition, Work};

use crate::object::CacheObject;
use crate::{CacheError, Result};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Where an operation is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Built but not yet submitted
    Initialised,
    /// Submitted and sitting in the object's deferred queue
    Pending,
    /// Running (or queued to a dispatcher worker)
    InProgress,
    /// Ran to completion
    Complete,
    /// Cancelled before it could run
    Cancelled,
}

/// A unit of work against a cache object.
///
/// The closure runs at most once, on a dispatcher worker. Waiters block on
/// [`Operation::wait`] until the operation completes or is cancelled.
pub struct Operation {
    debug_id: u64,
    exclusive: bool,
    state: Mutex<OpState>,
    done: Condvar,
    work: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Operation {
    /// Create a shared operation
    pub fn new(work: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::build(work, false)
    }

    /// Create an exclusive operation (runs alone on its object)
    pub fn exclusive(work: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::build(work, true)
    }

    fn build(work: impl FnOnce() + Send + 'static, exclusive: bool) -> Arc<Self> {
        Arc::new(Self {
            debug_id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            exclusive,
            state: Mutex::new(OpState::Initialised),
            done: Condvar::new(),
            work: Mutex::new(Some(Box::new(work))),
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn debug_id(&self) -> u64 {
        self.debug_id
    }

    pub fn state(&self) -> OpState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn mark_pending(&self) {
        *self.state.lock().unwrap() = OpState::Pending;
    }

    pub(crate) fn mark_in_progress(&self) {
        *self.state.lock().unwrap() = OpState::InProgress;
    }

    /// Run the closure once and mark the operation complete.
    ///
    /// A cancel that raced in first wins; the closure is then dropped unrun.
    pub(crate) fn run(&self) {
        let work = {
            let state = self.state.lock().unwrap();
            if *state == OpState::Cancelled {
                return;
            }
            drop(state);
            self.work.lock().unwrap().take()
        };

        if let Some(work) = work {
            work();
        }

        let mut state = self.state.lock().unwrap();
        if *state != OpState::Cancelled {
            *state = OpState::Complete;
        }
        self.done.notify_all();
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, OpState::Complete | OpState::Cancelled) {
            return;
        }
        *state = OpState::Cancelled;
        drop(state);

        // Drop the closure so captured resources are released now
        self.work.lock().unwrap().take();
        self.done.notify_all();
    }

    /// Block until the operation completes or is cancelled
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                OpState::Complete => return Ok(()),
                OpState::Cancelled => return Err(CacheError::OpCancelled),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::Timeout {
                    what: "operation completion",
                });
            }
            let (guard, _timed_out) = self.done.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

impl core::fmt::Debug for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Operation")
            .field("debug_id", &self.debug_id)
            .field("exclusive", &self.exclusive)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-object operation bookkeeping, guarded by the object's inner lock
pub(crate) struct OpQueue {
    pending: VecDeque<Arc<Operation>>,
    n_ops: usize,
    n_in_progress: usize,
    exclusive_in_progress: bool,
}

impl OpQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            n_ops: 0,
            n_in_progress: 0,
            exclusive_in_progress: false,
        }
    }

    /// Total operations charged to the object (deferred + in flight)
    pub(crate) fn n_ops(&self) -> usize {
        self.n_ops
    }

    #[cfg(test)]
    pub(crate) fn n_in_progress(&self) -> usize {
        self.n_in_progress
    }

    /// Whether a newly submitted operation may start immediately
    pub(crate) fn admit(&self, exclusive: bool) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        if exclusive {
            self.n_in_progress == 0
        } else {
            !self.exclusive_in_progress
        }
    }

    /// Charge and start a freshly admitted operation
    pub(crate) fn start_new(&mut self, op: &Arc<Operation>) {
        self.n_ops += 1;
        self.start_counters(op);
    }

    /// Queue an operation for later
    pub(crate) fn defer(&mut self, op: Arc<Operation>) {
        self.n_ops += 1;
        self.pending.push_back(op);
    }

    /// Pop and start the next deferred operation if admission allows it
    pub(crate) fn start_next(&mut self) -> Option<Arc<Operation>> {
        let front = self.pending.front()?;
        let admissible = if front.is_exclusive() {
            self.n_in_progress == 0
        } else {
            !self.exclusive_in_progress
        };
        if !admissible {
            return None;
        }
        let op = self.pending.pop_front().unwrap();
        self.start_counters(&op);
        Some(op)
    }

    fn start_counters(&mut self, op: &Arc<Operation>) {
        self.n_in_progress += 1;
        if op.is_exclusive() {
            self.exclusive_in_progress = true;
        }
    }

    /// Retire a finished operation
    pub(crate) fn finish(&mut self, op: &Arc<Operation>) {
        debug_assert!(self.n_in_progress > 0);
        debug_assert!(self.n_ops > 0);
        self.n_in_progress -= 1;
        self.n_ops -= 1;
        if op.is_exclusive() {
            self.exclusive_in_progress = false;
        }
    }

    /// Drain the deferred queue for cancellation; the caller cancels the
    /// returned operations outside the object lock.
    pub(crate) fn cancel_all(&mut self) -> Vec<Arc<Operation>> {
        let drained: Vec<_> = self.pending.drain(..).collect();
        self.n_ops -= drained.len();
        drained
    }
}

/// Dispatcher work item binding an operation to its object
pub(crate) struct QueuedOp {
    pub(crate) op: Arc<Operation>,
    pub(crate) object: Arc<CacheObject>,
}

impl Work for QueuedOp {
    fn execute(self: Arc<Self>) -> Disposition {
        self.op.run();
        self.object.op_complete(&self.op);
        Disposition::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> Arc<Operation> {
        Operation::new(|| {})
    }

    fn noop_exclusive() -> Arc<Operation> {
        Operation::exclusive(|| {})
    }

    #[test]
    fn shared_ops_admit_together() {
        let mut q = OpQueue::new();
        let a = noop();
        let b = noop();

        assert!(q.admit(false));
        q.start_new(&a);
        assert!(q.admit(false));
        q.start_new(&b);

        assert_eq!(q.n_in_progress(), 2);
        q.finish(&a);
        q.finish(&b);
        assert_eq!(q.n_ops(), 0);
    }

    #[test]
    fn exclusive_op_waits_for_drain_and_blocks_others() {
        let mut q = OpQueue::new();
        let shared = noop();
        let excl = noop_exclusive();

        q.start_new(&shared);

        // Exclusive cannot start while anything is in flight
        assert!(!q.admit(true));
        q.defer(excl.clone());

        // Shared submitted behind a queued exclusive must not jump it
        assert!(!q.admit(false));
        let late = noop();
        q.defer(late.clone());

        // Exclusive starts only once the shared op retires
        assert!(q.start_next().is_none());
        q.finish(&shared);
        let started = q.start_next().unwrap();
        assert!(Arc::ptr_eq(&started, &excl));

        // Nothing else may start beside it
        assert!(q.start_next().is_none());
        q.finish(&excl);

        let started = q.start_next().unwrap();
        assert!(Arc::ptr_eq(&started, &late));
    }

    #[test]
    fn cancel_all_uncharges_deferred_ops() {
        let mut q = OpQueue::new();
        let running = noop();
        q.start_new(&running);
        q.defer(noop());
        q.defer(noop());
        assert_eq!(q.n_ops(), 3);

        let cancelled = q.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(q.n_ops(), 1);
        assert_eq!(q.n_in_progress(), 1);
    }

    #[test]
    fn cancelled_op_never_runs_its_closure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let op = Operation::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        op.cancel();
        op.run();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(op.state(), OpState::Cancelled);
        assert!(matches!(
            op.wait(Duration::from_millis(10)),
            Err(CacheError::OpCancelled)
        ));
    }

    #[test]
    fn run_completes_and_wakes_waiters() {
        let op = noop();
        op.mark_in_progress();
        op.run();
        assert_eq!(op.state(), OpState::Complete);
        op.wait(Duration::from_millis(10)).unwrap();
    }
}
