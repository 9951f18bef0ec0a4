//! Minimal observer plumbing: a listener set and an unsubscribe handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// A set of listeners invoked synchronously, in registration order.
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Registers a listener. It stays registered for as long as the returned
    /// [`Subscription`] is alive.
    pub fn add(&self, callback: Callback<T>) -> Subscription {
        let id = {
            let mut set = lock(&self.inner);
            let id = set.next_id;
            set.next_id += 1;
            set.callbacks.insert(id, callback);
            id
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                // Dropped outside the lock: the callback may own subscriptions too.
                let removed = lock(&inner).callbacks.remove(&id);
                drop(removed);
            }
        })
    }

    /// Invokes every listener with `value`.
    ///
    /// The set is snapshotted first, so listeners may subscribe or
    /// unsubscribe from inside the callback.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = lock(&self.inner).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle returned by `subscribe`. The listener is removed when the handle is
/// dropped or [`unsubscribe`](Self::unsubscribe)d.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
