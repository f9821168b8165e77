//! Working-set observers.
//!
//! Presentation code registers a callback and receives every published
//! [`WorkingSetUpdate`]. The returned handle unsubscribes; doing so more than
//! once is a no-op.

use crate::working_set::WorkingSetUpdate;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for an observer.
pub type ObserverId = u64;

/// Callback receiving working-set updates.
pub type Observer = Arc<dyn Fn(&WorkingSetUpdate) + Send + Sync>;

struct Observers {
    /// Ordered by registration
    callbacks: BTreeMap<ObserverId, Observer>,
    next_id: ObserverId,
}

/// Registry of working-set observers.
#[derive(Clone)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<Observers>>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Observers {
                callbacks: BTreeMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Registers an observer.
    pub fn subscribe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&WorkingSetUpdate) + Send + Sync + 'static,
    {
        let mut observers = self.inner.lock();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.callbacks.insert(id, Arc::new(callback));

        ObserverHandle {
            id,
            registry: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Returns the current observers in registration order.
    ///
    /// Callers invoke them after releasing the registry lock.
    pub fn snapshot(&self) -> Vec<(ObserverId, Observer)> {
        self.inner
            .lock()
            .callbacks
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect()
    }

    /// Returns true if `id` is still registered.
    pub fn contains(&self, id: ObserverId) -> bool {
        self.inner.lock().callbacks.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }
}

/// Handle returned by [`ObserverRegistry::subscribe`].
pub struct ObserverHandle {
    id: ObserverId,
    registry: Weak<Mutex<Observers>>,
    active: AtomicBool,
}

impl ObserverHandle {
    #[inline]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the observer. Returns true if this call removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.lock().callbacks.remove(&self.id).is_some(),
            None => false,
        }
    }
}

impl core::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
