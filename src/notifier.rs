//! Cross-context change notification.
//!
//! Two inputs feed one subscriber list per context:
//! - `notify_changed`: the same-context channel, published to directly by
//!   `BasicStorage` on every write (the native event never fires in the
//!   tab that made the write)
//! - `dispatch_external`: native cross-context events, from other tabs
//!
//! Each subscription remembers the last value it observed and is only called
//! when an incoming value differs structurally, which breaks feedback loops
//! where a subscriber's own write comes back to it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::storage::{normalize_value, BasicStorage, StorageBackend};

/// Handle returned by `subscribe`
pub type SubscriptionId = u64;

/// Where a change was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Written in this context
    Local,
    /// Written by another context over the same origin
    CrossContext,
    /// Found by a focus-time re-read
    Reconcile,
}

/// One changed storage key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// Raw stored string; `None` when the key was removed
    pub new_value: Option<String>,
    pub source: ChangeSource,
}

impl StorageChange {
    #[must_use]
    pub fn new(key: impl Into<String>, new_value: Option<String>, source: ChangeSource) -> Self {
        Self {
            key: key.into(),
            new_value: normalize_value(new_value),
            source,
        }
    }
}

/// Structural equality: JSON documents compare as values, anything else as text
#[must_use]
pub fn values_equivalent(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) if a == b => true,
        (Some(a), Some(b)) => {
            match (
                serde_json::from_str::<serde_json::Value>(a),
                serde_json::from_str::<serde_json::Value>(b),
            ) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        _ => false,
    }
}

type Callback = Rc<RefCell<dyn FnMut(&StorageChange)>>;

struct Subscription {
    id: SubscriptionId,
    key: String,
    /// `None` until the first delivery (or an explicit initial value)
    last_seen: Option<Option<String>>,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<Subscription>,
    next_id: SubscriptionId,
    queue: VecDeque<StorageChange>,
    dispatching: bool,
}

/// Per-context pub/sub channel for storage changes
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Rc<RefCell<Inner>>,
}

/// Non-owning handle, held by storage origins so contexts can go away
#[derive(Clone)]
pub struct WeakNotifier(Weak<RefCell<Inner>>);

impl WeakNotifier {
    #[must_use]
    pub fn upgrade(&self) -> Option<ChangeNotifier> {
        self.0.upgrade().map(|inner| ChangeNotifier { inner })
    }
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakNotifier {
        WeakNotifier(Rc::downgrade(&self.inner))
    }

    /// Call `callback` whenever `key` changes to a value not seen before
    pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
    where
        F: FnMut(&StorageChange) + 'static,
    {
        self.register(key, None, Rc::new(RefCell::new(callback)))
    }

    /// Like `subscribe`, seeded with the value the caller already rendered
    pub fn subscribe_with_initial<F>(&self, key: &str, initial: Option<String>, callback: F) -> SubscriptionId
    where
        F: FnMut(&StorageChange) + 'static,
    {
        self.register(key, Some(normalize_value(initial)), Rc::new(RefCell::new(callback)))
    }

    fn register(&self, key: &str, last_seen: Option<Option<String>>, callback: Callback) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            key: key.to_string(),
            last_seen,
            callback,
        });
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|sub| sub.id != id);
        inner.subscriptions.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }

    /// Same-context channel: publish a write made in this context
    pub fn notify_changed(&self, key: &str, new_value: Option<&str>) {
        self.publish(StorageChange::new(
            key,
            new_value.map(str::to_string),
            ChangeSource::Local,
        ));
    }

    /// Native channel: deliver a change made by another context
    pub fn dispatch_external(&self, change: StorageChange) {
        self.publish(change);
    }

    /// Re-read every subscribed key, e.g. when the context regains focus
    ///
    /// Covers events missed while suspended. Unchanged values are filtered
    /// by the usual de-duplication.
    pub fn reconcile<B: StorageBackend>(&self, storage: &BasicStorage<B>) {
        let mut keys: Vec<String> = self
            .inner
            .borrow()
            .subscriptions
            .iter()
            .map(|sub| sub.key.clone())
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let value = storage.get(&key);
            self.publish(StorageChange::new(key, value, ChangeSource::Reconcile));
        }
    }

    fn publish(&self, change: StorageChange) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.queue.push_back(change);
            // A callback is writing; the running dispatch loop picks it up
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }

        loop {
            let next = self.inner.borrow_mut().queue.pop_front();
            match next {
                Some(change) => self.deliver(&change),
                None => break,
            }
        }

        self.inner.borrow_mut().dispatching = false;
    }

    fn deliver(&self, change: &StorageChange) {
        let targets: Vec<Callback> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .subscriptions
                .iter_mut()
                .filter(|sub| sub.key == change.key)
                .filter_map(|sub| {
                    let duplicate = sub.last_seen.as_ref().is_some_and(|seen| {
                        values_equivalent(seen.as_deref(), change.new_value.as_deref())
                    });
                    if duplicate {
                        return None;
                    }
                    sub.last_seen = Some(change.new_value.clone());
                    Some(Rc::clone(&sub.callback))
                })
                .collect()
        };

        for callback in targets {
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(change),
                Err(_) => tracing::debug!(key = %change.key, "subscriber busy; change skipped"),
            }
        }
    }
}
