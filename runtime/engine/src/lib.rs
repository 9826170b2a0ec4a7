//! Dispatch Engine - Event masks and worker-pool execution
//!
//! # Purpose
//! Provides the two primitives the cache object state machine is built on:
//! lock-free event words that any thread can raise bits on, and a fixed pool
//! of worker threads that execute queued work items.
//!
//! # Integration Points
//! - Depends on: crossbeam channels, std threads
//! - Provides to: the `cachet` object layer (objects and queued operations
//!   are both `Work` items)
//!
//! # Architecture
//! Events are a single atomic `u32` per owner; raising an event never takes
//! a lock, so it is safe from any context including a dispatch pass on the
//! same owner. Work items travel over an unbounded MPMC channel to named
//! worker threads. The engine does not deduplicate work: owners track their
//! own queued/running flags.
//!
//! # Testing Strategy
//! - Unit tests: event raise/take semantics, dispatch ordering, requeue,
//!   shutdown draining

mod dispatch;
mod events;

pub use dispatch::{Dispatcher, Disposition, Work};
pub use events::EventMask;

use thiserror::Error;

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {name}")]
    SpawnFailed { name: String },
}

pub type Result<T> = core::result::Result<T, EngineError>;
