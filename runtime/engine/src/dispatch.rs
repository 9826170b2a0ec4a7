//! Worker-pool dispatcher
//!
//! The workqueue role for the object layer: work items are `Arc`s flowing
//! over an unbounded MPMC channel to a fixed set of named worker threads.
//!
//! ## Design
//!
//! - A work item may return `Requeue` to yield its worker and be scheduled
//!   again; long-running state machines use this to bound the number of
//!   transitions they burn per pass.
//! - The dispatcher never deduplicates entries. An owner that must not run
//!   concurrently with itself (the cache object does not) tracks its own
//!   queued/running flags and bails out of redundant passes.
//! - Shutdown sends one poison message per worker. Messages already queued
//!   ahead of the poison drain first; items requeued after shutdown began
//!   may be dropped.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::{EngineError, Result};

/// A schedulable unit of work.
///
/// Implementors are shared, so `execute` takes `Arc<Self>`; the dispatcher
/// clones the handle when the item asks to be requeued.
pub trait Work: Send + Sync + 'static {
    /// Run one pass. Return [`Disposition::Requeue`] to be scheduled again.
    fn execute(self: Arc<Self>) -> Disposition;
}

/// What a work item wants after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Finished for now; the item is re-enqueued only by its owner
    Done,
    /// Yield the worker but schedule another pass immediately
    Requeue,
}

enum Message {
    Run(Arc<dyn Work>),
    Shutdown,
}

/// Fixed pool of worker threads executing [`Work`] items in FIFO order.
pub struct Dispatcher {
    name: String,
    tx: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut: AtomicBool,
}

impl Dispatcher {
    /// Spawn `workers` threads named `{name}-{index}`.
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers.max(1) {
            let rx: Receiver<Message> = rx.clone();
            let tx: Sender<Message> = tx.clone();
            let thread_name = format!("{name}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(rx, tx))
                .map_err(|_| EngineError::SpawnFailed { name: thread_name })?;
            handles.push(handle);
        }

        log::debug!("{name}: dispatcher started with {} workers", handles.len());

        Ok(Self {
            name: name.to_string(),
            tx,
            workers: Mutex::new(handles),
            shut: AtomicBool::new(false),
        })
    }

    /// Queue a work item for execution
    pub fn enqueue(&self, work: Arc<dyn Work>) -> Result<()> {
        if self.shut.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        self.tx
            .send(Message::Run(work))
            .map_err(|_| EngineError::ShutDown)
    }

    /// Whether shutdown has begun
    pub fn is_shut_down(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Stop accepting work, drain what is already queued, and join the
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        for _ in 0..handles.len() {
            let _ = self.tx.send(Message::Shutdown);
        }
        for handle in handles {
            let _ = handle.join();
        }

        log::debug!("{}: dispatcher stopped", self.name);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Message>, tx: Sender<Message>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Run(work) => {
                if work.clone().execute() == Disposition::Requeue {
                    // Send can only fail once every worker has exited
                    let _ = tx.send(Message::Run(work));
                }
            }
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::time::Duration;

    struct CountedWork {
        hits: AtomicUsize,
        requeues_left: AtomicUsize,
        lock: Mutex<()>,
        cond: Condvar,
    }

    impl CountedWork {
        fn new(requeues: usize) -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                requeues_left: AtomicUsize::new(requeues),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            })
        }

        fn wait_for_hits(&self, want: usize) {
            let guard = self.lock.lock().unwrap();
            let (_guard, timed_out) = self
                .cond
                .wait_timeout_while(guard, Duration::from_secs(5), |_| {
                    self.hits.load(Ordering::Acquire) < want
                })
                .unwrap();
            assert!(!timed_out.timed_out(), "work never reached {want} hits");
        }
    }

    impl Work for CountedWork {
        fn execute(self: Arc<Self>) -> Disposition {
            self.hits.fetch_add(1, Ordering::AcqRel);
            let _guard = self.lock.lock().unwrap();
            self.cond.notify_all();

            if self
                .requeues_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                Disposition::Requeue
            } else {
                Disposition::Done
            }
        }
    }

    #[test]
    fn executes_queued_work() {
        let dispatcher = Dispatcher::new("test-exec", 2).unwrap();
        let work = CountedWork::new(0);

        dispatcher.enqueue(work.clone()).unwrap();
        work.wait_for_hits(1);

        assert_eq!(work.hits.load(Ordering::Acquire), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn requeue_runs_again() {
        let dispatcher = Dispatcher::new("test-requeue", 2).unwrap();
        let work = CountedWork::new(2);

        dispatcher.enqueue(work.clone()).unwrap();
        work.wait_for_hits(3);

        dispatcher.shutdown();
        assert_eq!(work.hits.load(Ordering::Acquire), 3);
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let dispatcher = Dispatcher::new("test-drain", 1).unwrap();
        let works: Vec<_> = (0..8).map(|_| CountedWork::new(0)).collect();

        for work in &works {
            dispatcher.enqueue(work.clone()).unwrap();
        }
        dispatcher.shutdown();

        for work in &works {
            assert_eq!(work.hits.load(Ordering::Acquire), 1);
        }
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let dispatcher = Dispatcher::new("test-shut", 1).unwrap();
        dispatcher.shutdown();

        let work = CountedWork::new(0);
        assert!(matches!(
            dispatcher.enqueue(work),
            Err(EngineError::ShutDown)
        ));
    }
}
