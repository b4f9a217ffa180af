//! Ordered observer list for session changes

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::state::SessionState;

type Callback = Arc<dyn Fn(&SessionState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Callbacks notified, in registration order, on every applied transition
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Callbacks never run while the lock is held, so a poisoned lock still
    // guards a consistent list.
    fn lock(inner: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        let mut registry = Self::lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push((id, Arc::new(callback)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber registered at the time of the call.
    pub(crate) fn notify(&self, state: &SessionState) {
        let snapshot: Vec<Callback> = Self::lock(&self.inner)
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            callback(state);
        }
    }
}

/// Handle returned by `subscribe`; the callback is removed when it is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the callback registered for as long as the registry lives.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            SubscriberRegistry::lock(&inner)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}
