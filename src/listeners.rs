//! Subscriber registry shared by the event bus and the state store.
//!
//! Dispatch never iterates the live list: callers take a [`snapshot`]
//! (cloned `Arc`s) and invoke listeners with the lock released, so a
//! listener may subscribe or unsubscribe while it is being notified.
//!
//! [`snapshot`]: ListenerRegistry::snapshot

use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// No lock in this crate is held while user code runs, so a poisoned
/// mutex still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

/// Handle returned by every `subscribe`/`on` call.
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[must_use = "dropping a Subscription does not unsubscribe; keep it to call unsubscribe()"]
pub struct Subscription {
    id: u64,
    owner: Weak<dyn Detach>,
}

impl Subscription {
    /// Remove the listener. A no-op if it was already removed (e.g. a
    /// `once` listener that fired, or after `off`).
    pub fn unsubscribe(self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct Entry<K, F: ?Sized> {
    id: u64,
    key: K,
    once: bool,
    listener: Arc<F>,
}

struct Inner<K, F: ?Sized> {
    next_id: u64,
    entries: Vec<Entry<K, F>>,
}

impl<K, F> Detach for Mutex<Inner<K, F>>
where
    K: Send + 'static,
    F: ?Sized + Send + Sync + 'static,
{
    fn detach(&self, id: u64) {
        lock(self).entries.retain(|e| e.id != id);
    }
}

/// Ordered listener list keyed by `K` (use `()` for an unkeyed list).
pub struct ListenerRegistry<K, F: ?Sized> {
    inner: Arc<Mutex<Inner<K, F>>>,
}

impl<K, F> Default for ListenerRegistry<K, F>
where
    K: PartialEq + Send + 'static,
    F: ?Sized + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, F> ListenerRegistry<K, F>
where
    K: PartialEq + Send + 'static,
    F: ?Sized + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add(&self, key: K, listener: Arc<F>, once: bool) -> Subscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                key,
                once,
                listener,
            });
            id
        };
        let owner: Weak<Mutex<Inner<K, F>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            owner: owner as Weak<dyn Detach>,
        }
    }

    /// Listeners registered for `key`, in registration order.
    ///
    /// `once` listeners are removed from the registry as part of taking
    /// the snapshot, so each is delivered at most one time even if the
    /// same key is dispatched again from inside a listener.
    pub fn snapshot(&self, key: &K) -> Vec<Arc<F>> {
        let mut inner = lock(&self.inner);
        let selected: Vec<Arc<F>> = inner
            .entries
            .iter()
            .filter(|e| &e.key == key)
            .map(|e| Arc::clone(&e.listener))
            .collect();
        inner.entries.retain(|e| !(e.once && &e.key == key));
        selected
    }

    pub fn remove_key(&self, key: &K) {
        lock(&self.inner).entries.retain(|e| &e.key != key);
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    pub fn count(&self, key: &K) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|e| &e.key == key)
            .count()
    }

    pub fn total(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cb = dyn Fn() -> u32 + Send + Sync;

    #[test]
    fn snapshot_preserves_order() {
        let reg: ListenerRegistry<&str, Cb> = ListenerRegistry::new();
        let _a = reg.add("x", Arc::new(|| 1u32), false);
        let _b = reg.add("y", Arc::new(|| 2u32), false);
        let _c = reg.add("x", Arc::new(|| 3u32), false);
        let values: Vec<u32> = reg.snapshot(&"x").iter().map(|f| f()).collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn once_is_removed_by_snapshot() {
        let reg: ListenerRegistry<(), Cb> = ListenerRegistry::new();
        let _s = reg.add((), Arc::new(|| 1u32), true);
        assert_eq!(reg.snapshot(&()).len(), 1);
        assert_eq!(reg.snapshot(&()).len(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let reg: ListenerRegistry<(), Cb> = ListenerRegistry::new();
        let a = reg.add((), Arc::new(|| 1u32), false);
        let _b = reg.add((), Arc::new(|| 2u32), false);
        a.unsubscribe();
        let values: Vec<u32> = reg.snapshot(&()).iter().map(|f| f()).collect();
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_noop() {
        let reg: ListenerRegistry<(), Cb> = ListenerRegistry::new();
        let sub = reg.add((), Arc::new(|| 1u32), false);
        drop(reg);
        sub.unsubscribe();
    }

    #[test]
    fn remove_key_and_clear() {
        let reg: ListenerRegistry<u8, Cb> = ListenerRegistry::new();
        let _a = reg.add(1, Arc::new(|| 1u32), false);
        let _b = reg.add(2, Arc::new(|| 2u32), false);
        reg.remove_key(&1);
        assert_eq!(reg.count(&1), 0);
        assert_eq!(reg.count(&2), 1);
        reg.clear();
        assert_eq!(reg.total(), 0);
    }
}
