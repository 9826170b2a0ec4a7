//! Storage backend seam
//!
//! The object state machine drives a [`CacheBackend`]: lookup on boot,
//! create on negative lookup, update/invalidate on command, drop on
//! teardown. Backends may block; they
//! are called from dispatcher workers with no object lock held, and must not
//! synchronously re-enter the same object's API (raise events, submit
//! operations) from inside a callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::object::CacheObject;

/// Error types surfaced by storage backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O failure: {reason}")]
    Io { reason: String },

    #[error("no space left in cache")]
    NoSpace,

    #[error("stored object is corrupt: {key}")]
    Corrupt { key: String },

    #[error("no such object: {key}")]
    NoSuchObject { key: String },
}

/// What a lookup found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// The object already exists in the backend
    Positive,
    /// Nothing stored under this key; the machine will create it
    Negative,
}

/// Storage operations the object state machine drives.
pub trait CacheBackend: Send + Sync + 'static {
    /// See whether `object` already exists in storage
    fn lookup_object(&self, object: &CacheObject) -> Result<LookupResult, BackendError>;

    /// Create storage for an object that looked up negative
    fn create_object(&self, object: &CacheObject) -> Result<(), BackendError>;

    /// Push attribute changes for an available object
    fn update_object(&self, object: &CacheObject) -> Result<(), BackendError>;

    /// Discard the stored data but keep the object
    fn invalidate_object(&self, object: &CacheObject) -> Result<(), BackendError>;

    /// The object is going away. `retired` means delete the stored data too;
    /// otherwise it stays for a future lookup to find.
    fn drop_object(&self, object: &CacheObject, retired: bool);
}

/// Shared backends delegate, so a caller can keep a handle to the backend
/// it hands the cache
impl<B: CacheBackend + ?Sized> CacheBackend for std::sync::Arc<B> {
    fn lookup_object(&self, object: &CacheObject) -> Result<LookupResult, BackendError> {
        (**self).lookup_object(object)
    }

    fn create_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        (**self).create_object(object)
    }

    fn update_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        (**self).update_object(object)
    }

    fn invalidate_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        (**self).invalidate_object(object)
    }

    fn drop_object(&self, object: &CacheObject, retired: bool) {
        (**self).drop_object(object, retired)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MemEntry {
    version: u64,
    invalidations: u64,
}

/// Per-method call counters, for tests asserting backend traffic
#[derive(Debug, Default, Clone, Copy)]
pub struct MemBackendCalls {
    pub lookups: u64,
    pub creates: u64,
    pub updates: u64,
    pub invalidations: u64,
    pub drops: u64,
}

/// In-memory reference backend: a keyed map standing in for real storage.
pub struct MemBackend {
    store: Mutex<HashMap<String, MemEntry>>,
    lookups: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    invalidations: AtomicU64,
    drops: AtomicU64,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            lookups: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Pre-populate a key so the next lookup is positive
    pub fn seed(&self, key: &str) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), MemEntry::default());
    }

    /// Whether storage currently holds `key`
    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    /// Stored entry count
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().unwrap().is_empty()
    }

    pub fn calls(&self) -> MemBackendCalls {
        MemBackendCalls {
            lookups: self.lookups.load(Ordering::Acquire),
            creates: self.creates.load(Ordering::Acquire),
            updates: self.updates.load(Ordering::Acquire),
            invalidations: self.invalidations.load(Ordering::Acquire),
            drops: self.drops.load(Ordering::Acquire),
        }
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemBackend {
    fn lookup_object(&self, object: &CacheObject) -> Result<LookupResult, BackendError> {
        self.lookups.fetch_add(1, Ordering::AcqRel);
        let store = self.store.lock().unwrap();
        if store.contains_key(object.key()) {
            Ok(LookupResult::Positive)
        } else {
            Ok(LookupResult::Negative)
        }
    }

    fn create_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        self.creates.fetch_add(1, Ordering::AcqRel);
        self.store
            .lock()
            .unwrap()
            .insert(object.key().to_string(), MemEntry::default());
        Ok(())
    }

    fn update_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        self.updates.fetch_add(1, Ordering::AcqRel);
        let mut store = self.store.lock().unwrap();
        match store.get_mut(object.key()) {
            Some(entry) => {
                entry.version += 1;
                Ok(())
            }
            None => Err(BackendError::NoSuchObject {
                key: object.key().to_string(),
            }),
        }
    }

    fn invalidate_object(&self, object: &CacheObject) -> Result<(), BackendError> {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        let mut store = self.store.lock().unwrap();
        match store.get_mut(object.key()) {
            Some(entry) => {
                entry.version = 0;
                entry.invalidations += 1;
                Ok(())
            }
            None => Err(BackendError::NoSuchObject {
                key: object.key().to_string(),
            }),
        }
    }

    fn drop_object(&self, object: &CacheObject, retired: bool) {
        self.drops.fetch_add(1, Ordering::AcqRel);
        if retired {
            self.store.lock().unwrap().remove(object.key());
        }
    }
}
