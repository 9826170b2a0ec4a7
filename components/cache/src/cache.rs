//! Cache front end
//!
//! # Purpose
//! Owns the worker pool, the storage backend, the root index object, and the
//! key index. Callers acquire objects, raise lifecycle commands on them,
//! submit operations, and relinquish them when done.
//!
//! # Architecture
//! One `Cache` is one object tree: every acquired object hangs off the root
//! (or an explicit parent). Keys are cache-global; acquiring a key that is
//! already live shares the existing object. Shutdown kills every live
//! object, waits for the tree to die leaves-first, then stops the workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachet_engine::Dispatcher;

use crate::backend::CacheBackend;
use crate::object::{CacheCore, CacheObject};
use crate::operation::Operation;
use crate::state::ObjectEvents;
use crate::stats::StatsSnapshot;
use crate::{CacheError, Result};

/// How long `Cache::new` and `Cache::shutdown` wait on object transitions
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used for worker threads and log lines
    pub name: String,
    /// Dispatcher worker threads
    pub workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cachet".to_string(),
            workers: 4,
        }
    }
}

/// A running cache: worker pool, backend, root object, key index
pub struct Cache {
    core: Arc<CacheCore>,
    root: Arc<CacheObject>,
    objects: Mutex<HashMap<String, Arc<CacheObject>>>,
    shut: AtomicBool,
}

impl Cache {
    /// Bring a cache up: spawn the workers, boot the root index object, and
    /// wait for it to come available.
    pub fn new(backend: Box<dyn CacheBackend>, config: CacheConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config.name, config.workers)?;
        let core = Arc::new(CacheCore::new(config.name.clone(), dispatcher, backend));

        let root = CacheObject::new(core.clone(), "<root>", None);
        root.raise_event(ObjectEvents::NEW_CHILD);
        root.wait_for_available(SETTLE_TIMEOUT)?;

        log::info!("{}: cache ready", config.name);
        Ok(Self {
            core,
            root,
            objects: Mutex::new(HashMap::new()),
            shut: AtomicBool::new(false),
        })
    }

    /// The root index object
    pub fn root(&self) -> &Arc<CacheObject> {
        &self.root
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Number of live objects in the index (excluding the root)
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Acquire an object under the root index
    pub fn acquire(&self, key: &str) -> Result<Arc<CacheObject>> {
        let root = self.root.clone();
        self.acquire_child(&root, key)
    }

    /// Acquire an object under an explicit parent.
    ///
    /// Returns the existing object if the key is already live; otherwise a
    /// new object is created and booted. The new object only finishes lookup
    /// once `parent` is available.
    pub fn acquire_child(
        &self,
        parent: &Arc<CacheObject>,
        key: &str,
    ) -> Result<Arc<CacheObject>> {
        if self.shut.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }
        if parent.is_dying() {
            return Err(CacheError::ObjectDead {
                key: parent.key().to_string(),
            });
        }

        let mut objects = self.objects.lock().unwrap();
        if let Some(existing) = objects.get(key) {
            if !existing.is_dying() {
                return Ok(existing.clone());
            }
            // A dead object under this key is stale; replace it
        }

        let object = CacheObject::new(self.core.clone(), key, Some(parent.clone()));
        objects.insert(key.to_string(), object.clone());
        drop(objects);

        object.raise_event(ObjectEvents::NEW_CHILD);
        Ok(object)
    }

    /// Ask the object to push attribute changes to the backend
    pub fn update(&self, object: &Arc<CacheObject>) {
        object.raise_event(ObjectEvents::UPDATE);
    }

    /// Ask the object to discard its cached data and start afresh
    pub fn invalidate(&self, object: &Arc<CacheObject>) {
        object.raise_event(ObjectEvents::INVALIDATE);
    }

    /// Submit an operation against an object
    pub fn submit(&self, object: &Arc<CacheObject>, op: Arc<Operation>) -> Result<()> {
        object.submit_op(op)
    }

    /// Let go of an object. `retire` deletes its backend storage as well;
    /// otherwise the stored data survives for a later acquire to find.
    pub fn relinquish(&self, object: Arc<CacheObject>, retire: bool) {
        let mut objects = self.objects.lock().unwrap();
        let indexed_here = objects
            .get(object.key())
            .is_some_and(|indexed| Arc::ptr_eq(indexed, &object));
        if indexed_here {
            objects.remove(object.key());
        }
        drop(objects);

        if retire {
            object.set_retire();
        }
        object.raise_event(ObjectEvents::KILL);
    }

    /// Tear the whole cache down. Idempotent.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }

        let objects: Vec<_> = {
            let mut map = self.objects.lock().unwrap();
            map.drain().map(|(_, obj)| obj).collect()
        };

        for object in &objects {
            object.raise_event(ObjectEvents::KILL);
        }
        for object in &objects {
            if object.wait_for_dead(SETTLE_TIMEOUT).is_err() {
                log::warn!("{}: {object} did not die on shutdown", self.core.name);
            }
        }

        self.root.raise_event(ObjectEvents::KILL);
        if self.root.wait_for_dead(SETTLE_TIMEOUT).is_err() {
            log::warn!("{}: root object did not die on shutdown", self.core.name);
        }

        self.core.dispatcher.shutdown();
        log::info!("{}: cache shut down", self.core.name);
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
