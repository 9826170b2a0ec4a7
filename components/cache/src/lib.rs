//! cachet - Cache-object lifecycle engine
//!
//! # Purpose
//! Coordinates the lifecycle of objects in a local cache of remote data:
//! lookup, creation, update, invalidation, and teardown, driven by a
//! concurrent event-driven state machine per object.
//!
//! # Integration Points
//! - Depends on: `cachet-engine` (event masks, worker-pool dispatch)
//! - Provides to: applications embedding a local cache; storage backends
//!   plug in through the [`CacheBackend`] trait
//!
//! # Architecture
//! Every cache object runs a finite-state machine (see [`state`]) executed
//! by dispatcher workers. Events are raised from any thread as atomic bits;
//! a per-object queued/running protocol guarantees exactly one dispatch pass
//! at a time while never losing a wakeup. Objects form a tree: children pin
//! their parents and may not finish lookup until the parent is available;
//! teardown cascades down through dependents and waits for children to
//! detach. I/O-style work against an object travels through an operation
//! queue with exclusive/shared admission rules.
//!
//! # Testing Strategy
//! - Unit tests: state table, operation admission rules, backend accounting
//! - Integration tests: full lifecycles, dependency chaining against a
//!   gated backend, kill cascades, cancellation on teardown

mod backend;
mod cache;
mod object;
mod operation;
pub mod state;
mod stats;

pub use backend::{BackendError, CacheBackend, LookupResult, MemBackend};
pub use cache::{Cache, CacheConfig};
pub use object::CacheObject;
pub use operation::{OpState, Operation};
pub use state::{ObjectEvents, ObjectState};
pub use stats::{Stats, StatsSnapshot};

use thiserror::Error;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object is dead: {key}")]
    ObjectDead { key: String },

    #[error("cache is shut down")]
    ShutDown,

    #[error("operation was cancelled")]
    OpCancelled,

    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("engine error: {0}")]
    Engine(#[from] cachet_engine::EngineError),
}

pub type Result<T> = core::result::Result<T, CacheError>;
