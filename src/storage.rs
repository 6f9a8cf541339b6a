//! Basic persistence adapter over a synchronous string key/value store.
//!
//! `StorageBackend` abstracts the medium:
//! - `localStorage` (via JS imports in WASM)
//! - In-memory origin (for tests and native use)
//!
//! `BasicStorage` wraps a backend so that quota and access failures are
//! caught and logged instead of reaching the caller, and publishes every
//! write to the same-context change channel.
//!
//! # Security Notes
//!
//! - Nothing here encrypts; the secure stores hand this layer ciphertext
//! - `InMemoryStorage` keeps whatever it is given in plaintext memory

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::notifier::{ChangeNotifier, ChangeSource, StorageChange, WeakNotifier};

/// Literal some callers persist for "no value"
pub const UNDEFINED_LITERAL: &str = "undefined";

/// Error types for the persistence medium
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded while writing '{key}'")]
    QuotaExceeded { key: String },
    #[error("Storage access denied")]
    AccessDenied,
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Abstract string key/value medium
pub trait StorageBackend {
    /// Read the raw string stored under `key`
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`; deleting an absent key succeeds
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Map the `"undefined"` literal to "no value"
pub(crate) fn normalize_value(value: Option<String>) -> Option<String> {
    value.filter(|v| v != UNDEFINED_LITERAL)
}

/// Identifier of one execution context (tab/window) over an origin
pub type ContextId = u32;

#[derive(Default)]
struct Origin {
    items: HashMap<String, String>,
    write_counts: HashMap<String, usize>,
    quota: Option<usize>,
    access_denied: bool,
    listeners: Vec<(ContextId, WeakNotifier)>,
    next_context: ContextId,
}

impl Origin {
    fn used_bytes_with(&self, key: &str, value: &str) -> usize {
        self.items
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + key.len()
            + value.len()
    }

    /// Drop listeners whose context has gone away
    fn prune_listeners(&mut self) {
        self.listeners.retain(|(_, weak)| weak.upgrade().is_some());
    }

    /// Live notifiers of every context except `origin`
    fn foreign_listeners(&mut self, origin: ContextId) -> Vec<ChangeNotifier> {
        self.prune_listeners();
        self.listeners
            .iter()
            .filter(|(context, _)| *context != origin)
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

/// In-memory origin-scoped store
///
/// Clones share the same data and context. `open_context` models another
/// tab of the same origin: its writes reach notifiers connected from other
/// contexts, the way the browser's `storage` event does.
#[derive(Clone)]
pub struct InMemoryStorage {
    origin: Rc<RefCell<Origin>>,
    context: ContextId,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        let origin = Origin {
            next_context: 1,
            ..Origin::default()
        };
        Self {
            origin: Rc::new(RefCell::new(origin)),
            context: 0,
        }
    }

    /// Limit total stored bytes (keys + values)
    #[must_use]
    pub fn with_quota(self, bytes: usize) -> Self {
        self.origin.borrow_mut().quota = Some(bytes);
        self
    }

    /// Open another context over the same origin
    #[must_use]
    pub fn open_context(&self) -> Self {
        let mut origin = self.origin.borrow_mut();
        let context = origin.next_context;
        origin.next_context += 1;
        Self {
            origin: Rc::clone(&self.origin),
            context,
        }
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Deliver other contexts' writes to `notifier`
    pub fn connect(&self, notifier: &ChangeNotifier) {
        let mut origin = self.origin.borrow_mut();
        origin.prune_listeners();
        origin.listeners.push((self.context, notifier.downgrade()));
    }

    /// Connected notifiers still registered with the origin (for testing)
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.origin.borrow().listeners.len()
    }

    /// Simulate private-browsing style access restrictions
    pub fn set_access_denied(&self, denied: bool) {
        self.origin.borrow_mut().access_denied = denied;
    }

    /// Raw stored string, bypassing every wrapper (for testing)
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.origin.borrow().items.get(key).cloned()
    }

    /// Write a raw string without events or counters (for testing)
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.origin
            .borrow_mut()
            .items
            .insert(key.to_string(), value.to_string());
    }

    /// Number of successful writes to `key` (for testing write suppression)
    #[must_use]
    pub fn write_count(&self, key: &str) -> usize {
        *self.origin.borrow().write_counts.get(key).unwrap_or(&0)
    }

    /// Reset write count for a key (for testing)
    pub fn reset_write_count(&self, key: &str) {
        self.origin.borrow_mut().write_counts.insert(key.to_string(), 0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.origin.borrow().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn broadcast(&self, key: &str, new_value: Option<&str>) {
        // Collect first: listeners may write back into this origin.
        let targets = self.origin.borrow_mut().foreign_listeners(self.context);
        for notifier in targets {
            notifier.dispatch_external(StorageChange::new(
                key,
                new_value.map(str::to_string),
                ChangeSource::CrossContext,
            ));
        }
    }
}

impl StorageBackend for InMemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let origin = self.origin.borrow();
        if origin.access_denied {
            return Err(StorageError::AccessDenied);
        }
        Ok(origin.items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let changed = {
            let mut origin = self.origin.borrow_mut();
            if origin.access_denied {
                return Err(StorageError::AccessDenied);
            }
            if let Some(quota) = origin.quota {
                if origin.used_bytes_with(key, value) > quota {
                    return Err(StorageError::QuotaExceeded { key: key.to_string() });
                }
            }
            let previous = origin.items.insert(key.to_string(), value.to_string());
            *origin.write_counts.entry(key.to_string()).or_insert(0) += 1;
            previous.as_deref() != Some(value)
        };

        // Browsers only fire the storage event when the value actually changed
        if changed {
            self.broadcast(key, Some(value));
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let existed = {
            let mut origin = self.origin.borrow_mut();
            if origin.access_denied {
                return Err(StorageError::AccessDenied);
            }
            origin.items.remove(key).is_some()
        };

        if existed {
            self.broadcast(key, None);
        }
        Ok(())
    }
}

/// Error-containing get/set/remove/has wrapper over a backend
#[derive(Clone)]
pub struct BasicStorage<B> {
    backend: B,
    notifier: Option<ChangeNotifier>,
}

impl<B: StorageBackend> BasicStorage<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend, notifier: None }
    }

    /// Publish every successful write to `notifier`
    #[must_use]
    pub fn with_notifier(backend: B, notifier: ChangeNotifier) -> Self {
        Self {
            backend,
            notifier: Some(notifier),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn notifier(&self) -> Option<&ChangeNotifier> {
        self.notifier.as_ref()
    }

    /// Read a value; absent, `"undefined"` and unreadable all mean `None`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self.backend.get_item(key) {
            Ok(value) => normalize_value(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "storage read failed");
                None
            }
        }
    }

    /// Store a value; returns whether it reached the medium
    pub fn set(&self, key: &str, value: &str) -> bool {
        match self.backend.set_item(key, value) {
            Ok(()) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_changed(key, Some(value));
                }
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "storage write failed; value not persisted");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) {
        match self.backend.remove_item(key) {
            Ok(()) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_changed(key, None);
                }
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "storage remove failed"),
        }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Read a plaintext JSON value (UI preferences, recent searches)
    #[must_use]
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "stored value is not valid JSON");
                None
            }
        }
    }

    /// Store a plaintext JSON value
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "value could not be serialized");
                false
            }
        }
    }
}
