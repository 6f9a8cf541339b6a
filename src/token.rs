//! GitHub token façade over the secure store.
//!
//! Adds two behaviours on top of plain `SecretStore` calls:
//! - writes within the cooldown of the last accepted write are dropped
//! - writing the value already in effect does nothing at all

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::config::{StoreConfig, WRITE_COOLDOWN};
use crate::notifier::{ChangeNotifier, SubscriptionId};
use crate::secure_store::{BackendKind, SecretStore, StoreError};

/// Token key used by the fallback store
pub const GITHUB_TOKEN_KEY: &str = "github_token";
/// Token key used by the Web-Crypto store
pub const GITHUB_TOKEN_SECURE_KEY: &str = "github_token_secure";

/// Storage key reserved for the token under a given backend
#[must_use]
pub fn token_key_for(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::WebCrypto => GITHUB_TOKEN_SECURE_KEY,
        BackendKind::Fallback => GITHUB_TOKEN_KEY,
    }
}

/// Monotonic time source for the write throttle
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// Wall clock backed by `Instant`
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(not(target_arch = "wasm32"))]
impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Convert a high-resolution millisecond reading into a `Duration`
///
/// Negative or non-finite readings clamp to zero.
#[must_use]
pub fn duration_from_millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

/// Manually advanced clock (for testing)
/// Clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

/// Result of `set_token`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTokenOutcome {
    /// Encrypted and persisted
    Stored,
    /// Value already in effect; nothing written
    Unchanged,
    /// Rejected by the write cooldown; previous value kept
    Throttled,
}

enum CachedToken {
    Unknown,
    Absent,
    Present(Zeroizing<String>),
}

/// Named accessor for the GitHub token
pub struct TokenVault<S, C> {
    store: S,
    clock: C,
    key: &'static str,
    cooldown: Duration,
    last_write: Cell<Option<Duration>>,
    cache: Rc<RefCell<CachedToken>>,
    watch: Option<(ChangeNotifier, SubscriptionId)>,
}

impl<S: SecretStore, C: Clock> TokenVault<S, C> {
    /// Vault with the standard 500 ms cooldown
    #[must_use]
    pub fn new(store: S, clock: C) -> Self {
        Self::with_cooldown(store, clock, WRITE_COOLDOWN)
    }

    #[must_use]
    pub fn with_config(store: S, clock: C, config: &StoreConfig) -> Self {
        Self::with_cooldown(store, clock, config.write_cooldown())
    }

    fn with_cooldown(store: S, clock: C, cooldown: Duration) -> Self {
        let key = token_key_for(store.backend());
        Self {
            store,
            clock,
            key,
            cooldown,
            last_write: Cell::new(None),
            cache: Rc::new(RefCell::new(CachedToken::Unknown)),
            watch: None,
        }
    }

    /// Forget the cached token whenever its key changes (any context)
    #[must_use]
    pub fn watching(mut self, notifier: &ChangeNotifier) -> Self {
        let cache = Rc::downgrade(&self.cache);
        let id = notifier.subscribe(self.key, move |_| {
            if let Some(cache) = cache.upgrade() {
                *cache.borrow_mut() = CachedToken::Unknown;
            }
        });
        if let Some((old, old_id)) = self.watch.replace((notifier.clone(), id)) {
            old.unsubscribe(old_id);
        }
        self
    }

    /// Storage key this vault reads and writes
    #[must_use]
    pub fn key(&self) -> &'static str {
        self.key
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn get_token(&self) -> Result<Option<String>, StoreError> {
        let token = self.store.get(self.key).await?;
        *self.cache.borrow_mut() = match &token {
            Some(value) => CachedToken::Present(Zeroizing::new(value.clone())),
            None => CachedToken::Absent,
        };
        Ok(token)
    }

    pub async fn set_token(&self, value: &str) -> Result<SetTokenOutcome, StoreError> {
        if self.is_in_effect(value).await {
            tracing::debug!(key = self.key, "token unchanged; skipping write");
            return Ok(SetTokenOutcome::Unchanged);
        }

        let now = self.clock.now();
        if let Some(last) = self.last_write.get() {
            let since = now.saturating_sub(last);
            if since < self.cooldown {
                tracing::warn!(
                    key = self.key,
                    since_ms = since.as_millis() as u64,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "token write throttled"
                );
                return Ok(SetTokenOutcome::Throttled);
            }
        }

        self.store.set(self.key, value).await?;
        self.last_write.set(Some(now));
        *self.cache.borrow_mut() = CachedToken::Present(Zeroizing::new(value.to_string()));
        tracing::info!(key = self.key, "token updated");
        Ok(SetTokenOutcome::Stored)
    }

    pub fn clear_token(&self) {
        self.store.remove(self.key);
        *self.cache.borrow_mut() = CachedToken::Absent;
        tracing::info!(key = self.key, "token cleared");
    }

    async fn is_in_effect(&self, value: &str) -> bool {
        // Without a watch nothing invalidates the cache; other writers would go unseen
        if self.watch.is_some() {
            match &*self.cache.borrow() {
                CachedToken::Present(current) => return current.as_str() == value,
                CachedToken::Absent => return false,
                CachedToken::Unknown => {}
            }
        }
        // An unreadable stored token never matches, so the caller can replace it
        matches!(self.get_token().await, Ok(Some(current)) if current == value)
    }
}

impl<S, C> Drop for TokenVault<S, C> {
    fn drop(&mut self) {
        if let Some((notifier, id)) = self.watch.take() {
            notifier.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationSecret, KdfParams};
    use crate::secure_store::{ForcedBackend, SecureStorage};
    use crate::storage::{BasicStorage, InMemoryStorage};

    fn vault(backend: BackendKind) -> (InMemoryStorage, ManualClock, TokenVault<SecureStorage<InMemoryStorage>, ManualClock>) {
        let storage = InMemoryStorage::new();
        let config = StoreConfig::new(ApplicationSecret::new("token-tests")).with_kdf(KdfParams::TINY);
        let store = SecureStorage::select(BasicStorage::new(storage.clone()), &config, &ForcedBackend(backend));
        let clock = ManualClock::new();
        (storage, clock.clone(), TokenVault::with_config(store, clock, &config))
    }

    #[test]
    fn test_key_follows_backend() {
        let (_, _, strong) = vault(BackendKind::WebCrypto);
        let (_, _, fallback) = vault(BackendKind::Fallback);
        assert_eq!(strong.key(), "github_token_secure");
        assert_eq!(fallback.key(), "github_token");
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        let (storage, _, vault) = vault(BackendKind::WebCrypto);
        assert_eq!(vault.get_token().await, Ok(None));

        assert_eq!(vault.set_token("ghp_abc123").await, Ok(SetTokenOutcome::Stored));
        assert_eq!(vault.get_token().await.unwrap().as_deref(), Some("ghp_abc123"));
        assert!(!storage.get_raw(GITHUB_TOKEN_SECURE_KEY).unwrap().contains("ghp_abc123"));

        vault.clear_token();
        assert_eq!(vault.get_token().await, Ok(None));
        assert_eq!(storage.get_raw(GITHUB_TOKEN_SECURE_KEY), None);
    }

    #[tokio::test]
    async fn test_same_value_is_noop() {
        let (storage, clock, vault) = vault(BackendKind::WebCrypto);
        vault.set_token("ghp_same").await.unwrap();
        let raw = storage.get_raw(GITHUB_TOKEN_SECURE_KEY);

        clock.advance(Duration::from_secs(5));
        assert_eq!(vault.set_token("ghp_same").await, Ok(SetTokenOutcome::Unchanged));
        assert_eq!(storage.write_count(GITHUB_TOKEN_SECURE_KEY), 1);
        assert_eq!(storage.get_raw(GITHUB_TOKEN_SECURE_KEY), raw);
    }

    #[tokio::test]
    async fn test_noop_does_not_consume_window() {
        let (_, clock, vault) = vault(BackendKind::WebCrypto);
        vault.set_token("a").await.unwrap();
        clock.advance(Duration::from_millis(600));
        assert_eq!(vault.set_token("a").await, Ok(SetTokenOutcome::Unchanged));
        // Window is measured from the last accepted write, not the no-op
        assert_eq!(vault.set_token("b").await, Ok(SetTokenOutcome::Stored));
    }

    #[tokio::test]
    async fn test_rapid_writes_throttled() {
        let (_, clock, vault) = vault(BackendKind::WebCrypto);
        assert_eq!(vault.set_token("first").await, Ok(SetTokenOutcome::Stored));
        clock.advance(Duration::from_millis(499));
        assert_eq!(vault.set_token("second").await, Ok(SetTokenOutcome::Throttled));
        assert_eq!(vault.get_token().await.unwrap().as_deref(), Some("first"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(vault.set_token("third").await, Ok(SetTokenOutcome::Stored));
        assert_eq!(vault.get_token().await.unwrap().as_deref(), Some("third"));
    }

    #[test]
    fn test_duration_from_millis() {
        assert_eq!(duration_from_millis(1500.0), Duration::from_millis(1500));
        // Sub-millisecond readings are kept, so the cooldown compares exactly
        assert_eq!(duration_from_millis(499.5), Duration::from_micros(499_500));
        assert_eq!(duration_from_millis(-3.0), Duration::ZERO);
        assert_eq!(duration_from_millis(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_millis(f64::INFINITY), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_cache_reads_store() {
        let (storage, clock, vault) = vault(BackendKind::Fallback);
        vault.set_token("ghp_x").await.unwrap();

        // A fresh vault over the same data starts with nothing cached
        let config = StoreConfig::new(ApplicationSecret::new("token-tests")).with_kdf(KdfParams::TINY);
        let store = SecureStorage::select(BasicStorage::new(storage.clone()), &config, &ForcedBackend(BackendKind::Fallback));
        let second = TokenVault::with_config(store, clock, &config);
        assert_eq!(second.set_token("ghp_x").await, Ok(SetTokenOutcome::Unchanged));
        assert_eq!(storage.write_count(GITHUB_TOKEN_KEY), 1);
    }

    #[tokio::test]
    async fn test_unwatched_vault_rereads_store() {
        let (storage, clock, vault) = vault(BackendKind::WebCrypto);
        vault.set_token("ghp_a").await.unwrap();

        // Written behind the vault's back, no notifier attached
        vault.store().set(GITHUB_TOKEN_SECURE_KEY, "ghp_b").await.unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(vault.set_token("ghp_a").await, Ok(SetTokenOutcome::Stored));
        assert_eq!(vault.get_token().await.unwrap().as_deref(), Some("ghp_a"));
        assert_eq!(storage.write_count(GITHUB_TOKEN_SECURE_KEY), 3);
    }

    #[tokio::test]
    async fn test_unreadable_token_can_be_replaced() {
        let (storage, _, vault) = vault(BackendKind::WebCrypto);
        storage.insert_raw(GITHUB_TOKEN_SECURE_KEY, "corrupted");
        assert!(vault.get_token().await.is_err());
        assert_eq!(vault.set_token("ghp_new").await, Ok(SetTokenOutcome::Stored));
        assert_eq!(vault.get_token().await.unwrap().as_deref(), Some("ghp_new"));
    }

    #[tokio::test]
    async fn test_watching_invalidates_cache() {
        let storage = InMemoryStorage::new();
        let notifier = ChangeNotifier::new();
        let config = StoreConfig::new(ApplicationSecret::new("token-tests")).with_kdf(KdfParams::TINY);
        let basic = BasicStorage::with_notifier(storage.clone(), notifier.clone());
        let store = Rc::new(SecureStorage::select(basic, &config, &ForcedBackend(BackendKind::WebCrypto)));
        let clock = ManualClock::new();
        let vault = TokenVault::with_config(Rc::clone(&store), clock.clone(), &config).watching(&notifier);

        vault.set_token("old").await.unwrap();
        // Another component writes the same key directly
        store.secure_set(GITHUB_TOKEN_SECURE_KEY, "new").await.unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(vault.set_token("new").await, Ok(SetTokenOutcome::Unchanged));
        assert_eq!(notifier.subscriber_count(), 1);
        drop(vault);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
