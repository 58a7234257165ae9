use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: Mutex<T>,
    subscribers: Mutex<BTreeMap<u64, Subscriber<T>>>,
    next_id: AtomicU64,
}

/// Observable value cell.
///
/// Subscribers run synchronously on every [`set`](Self::set), in
/// subscription order, after the new value is stored.
pub struct Signal<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Default + Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal")
            .field(&*lock_unpoisoned(&self.inner.value))
            .finish()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(value),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn get(&self) -> T {
        lock_unpoisoned(&self.inner.value).clone()
    }

    pub fn set(&self, value: T) {
        *lock_unpoisoned(&self.inner.value) = value.clone();

        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
        let subscribers: Vec<Subscriber<T>> = lock_unpoisoned(&self.inner.subscribers)
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber(&value);
        }
    }

    /// Registers `callback`; it stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.inner.subscribers).insert(id, Arc::new(callback));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock_unpoisoned(&inner.subscribers).remove(&id);
                }
            })),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner.subscribers).len()
    }
}

/// Handle keeping one [`Signal`] callback registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
