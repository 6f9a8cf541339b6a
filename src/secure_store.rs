//! Secure value store: transparent encryption over `BasicStorage`.
//!
//! Two interchangeable implementations behind `SecretStore`:
//! - `WebCryptoStore`: PBKDF2 + AES-256-GCM, async contract, typed errors
//! - `FallbackStore`: HKDF + ChaCha20-Poly1305, sync contract, silent defaults
//!
//! `SecureStorage` picks one of them once, from a `CryptoProbe`, and every
//! later call goes to that implementation.
//!
//! # Security Properties
//!
//! - **Fresh salt and nonce per write**: every `set` builds a new blob, so
//!   re-storing the same value never reuses a nonce
//! - **No plaintext at rest**: only the base64 blob reaches the medium
//! - **No silent data loss**: a value that fails to decrypt is reported and
//!   left in place

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_chacha::rand_core::RngCore;
use rand_chacha::ChaCha20Rng;
use zeroize::Zeroizing;

use crate::blob::{BlobError, EncryptedBlob, NONCE_SIZE, SALT_SIZE};
use crate::config::{ApplicationSecret, StoreConfig};
use crate::crypto::{self, CipherSuite, CryptoError};
use crate::storage::{BasicStorage, StorageBackend};

/// Key holding the fallback generator's chain state (not secret)
pub const FALLBACK_SEED_KEY: &str = "devcard_fallback_seed";

/// Which implementation serves a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    WebCrypto,
    Fallback,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebCrypto => "web-crypto",
            Self::Fallback => "fallback",
        }
    }
}

/// Error types for secure store operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Malformed stored value: {0}")]
    Malformed(#[from] BlobError),
    #[error("Value for '{key}' could not be persisted")]
    NotPersisted { key: String },
}

impl StoreError {
    /// The stored value exists but cannot be read back
    #[must_use]
    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_)
                | Self::Crypto(CryptoError::AuthenticationFailed)
                | Self::Crypto(CryptoError::InvalidPlaintext)
        )
    }
}

/// Get/set/remove a secret string
#[async_trait(?Send)]
pub trait SecretStore {
    /// Implementation serving this store
    fn backend(&self) -> BackendKind;

    /// Decrypted value, `Ok(None)` when nothing is stored
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Encrypt and persist `value`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete the stored value
    fn remove(&self, key: &str);
}

#[async_trait(?Send)]
impl<S: SecretStore + ?Sized> SecretStore for Rc<S> {
    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    fn remove(&self, key: &str) {
        (**self).remove(key);
    }
}

/// Shared read path: absent → `None`, otherwise unpack and open
fn open_stored<B: StorageBackend>(
    storage: &BasicStorage<B>,
    suite: CipherSuite,
    secret: &ApplicationSecret,
    key: &str,
) -> Result<Option<String>, StoreError> {
    let Some(raw) = storage.get(key) else {
        return Ok(None);
    };

    let blob = EncryptedBlob::decode(&raw).map_err(|e| {
        tracing::warn!(key = %key, error = %e, "stored value is not a valid encrypted blob");
        StoreError::from(e)
    })?;

    let plaintext = suite.open(secret.expose(), &blob).map_err(|e| {
        tracing::warn!(key = %key, error = %e, "stored value could not be decrypted; leaving it in place");
        StoreError::from(e)
    })?;

    Ok(Some(plaintext))
}

/// Shared write path: seal with the given salt and nonce, then persist
fn seal_and_store<B: StorageBackend>(
    storage: &BasicStorage<B>,
    suite: CipherSuite,
    secret: &ApplicationSecret,
    key: &str,
    value: &str,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
) -> Result<(), StoreError> {
    let blob = suite.seal(secret.expose(), salt, nonce, value).map_err(|e| {
        tracing::error!(key = %key, error = %e, "encryption failed");
        StoreError::from(e)
    })?;

    if storage.set(key, &blob.encode()) {
        Ok(())
    } else {
        Err(StoreError::NotPersisted { key: key.to_string() })
    }
}

/// Strong path: PBKDF2-HMAC-SHA256 + AES-256-GCM
pub struct WebCryptoStore<B> {
    storage: BasicStorage<B>,
    secret: ApplicationSecret,
    suite: CipherSuite,
}

impl<B: StorageBackend> WebCryptoStore<B> {
    #[must_use]
    pub fn new(storage: BasicStorage<B>, config: &StoreConfig) -> Self {
        Self {
            storage,
            secret: config.secret().clone(),
            suite: CipherSuite::Strong {
                iterations: config.kdf().iterations,
            },
        }
    }

    #[must_use]
    pub fn storage(&self) -> &BasicStorage<B> {
        &self.storage
    }
}

#[async_trait(?Send)]
impl<B: StorageBackend> SecretStore for WebCryptoStore<B> {
    fn backend(&self) -> BackendKind {
        BackendKind::WebCrypto
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        open_stored(&self.storage, self.suite, &self.secret, key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let salt = crypto::random_salt()?;
        let nonce = crypto::random_nonce()?;
        seal_and_store(&self.storage, self.suite, &self.secret, key, value, salt, nonce)?;
        tracing::debug!(key = %key, backend = "web-crypto", "stored encrypted value");
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.storage.remove(key);
    }
}

/// Fallback path: HKDF-SHA256 + ChaCha20-Poly1305, synchronous
///
/// Salts and nonces come from a generator seeded once at construction, so
/// this store keeps working where the CSPRNG cannot be reached per call.
pub struct FallbackStore<B> {
    storage: BasicStorage<B>,
    secret: ApplicationSecret,
    rng: RefCell<ChaCha20Rng>,
}

impl<B: StorageBackend> FallbackStore<B> {
    /// Seed the generator from the stored chain state, then advance it
    #[must_use]
    pub fn new(storage: BasicStorage<B>, config: &StoreConfig) -> Self {
        let persisted = storage
            .get(FALLBACK_SEED_KEY)
            .and_then(|text| BASE64.decode(text.trim()).ok())
            .map(Zeroizing::new)
            .unwrap_or_default();
        let mut rng = crypto::seed_fallback_rng(&persisted);

        let mut next = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut next[..]);
        if !storage.set(FALLBACK_SEED_KEY, &BASE64.encode(&next[..])) {
            tracing::warn!("fallback seed state not persisted; next run cannot chain from this one");
        }

        Self {
            storage,
            secret: config.secret().clone(),
            rng: RefCell::new(rng),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &BasicStorage<B> {
        &self.storage
    }

    /// Decrypted value; `None` when absent or unreadable
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.try_get(key).unwrap_or(None)
    }

    /// Encrypt and persist; failures are logged and dropped
    pub fn set(&self, key: &str, value: &str) {
        let _ = self.try_set(key, value);
    }

    pub fn remove(&self, key: &str) {
        self.storage.remove(key);
    }

    pub fn try_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        open_stored(&self.storage, CipherSuite::Fallback, &self.secret, key)
    }

    pub fn try_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        {
            let mut rng = self.rng.borrow_mut();
            rng.fill_bytes(&mut salt);
            rng.fill_bytes(&mut nonce);
        }
        seal_and_store(&self.storage, CipherSuite::Fallback, &self.secret, key, value, salt, nonce)?;
        tracing::debug!(key = %key, backend = "fallback", "stored encrypted value");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<B: StorageBackend> SecretStore for FallbackStore<B> {
    fn backend(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.try_get(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.try_set(key, value)
    }

    fn remove(&self, key: &str) {
        self.storage.remove(key);
    }
}

/// Decides whether the strong primitive is usable here
pub trait CryptoProbe {
    fn strong_crypto_available(&self) -> bool;
}

/// Runs a canary encrypt/decrypt through the strong suite
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfTestProbe;

impl CryptoProbe for SelfTestProbe {
    fn strong_crypto_available(&self) -> bool {
        match crypto::strong_suite_self_test() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "strong crypto self-test failed");
                false
            }
        }
    }
}

/// Pins the selection (tests, or hosts that know their environment)
#[derive(Debug, Clone, Copy)]
pub struct ForcedBackend(pub BackendKind);

impl CryptoProbe for ForcedBackend {
    fn strong_crypto_available(&self) -> bool {
        self.0 == BackendKind::WebCrypto
    }
}

/// Capability-selected secure store
pub enum SecureStorage<B> {
    WebCrypto(WebCryptoStore<B>),
    Fallback(FallbackStore<B>),
}

impl<B: StorageBackend> SecureStorage<B> {
    /// Probe once and build the matching implementation
    #[must_use]
    pub fn select(storage: BasicStorage<B>, config: &StoreConfig, probe: &dyn CryptoProbe) -> Self {
        let store = if probe.strong_crypto_available() {
            Self::WebCrypto(WebCryptoStore::new(storage, config))
        } else {
            Self::Fallback(FallbackStore::new(storage, config))
        };

        if config.secret().is_development() {
            tracing::warn!(backend = store.backend().as_str(), "secure storage running with the development secret");
        } else {
            tracing::info!(backend = store.backend().as_str(), "secure storage initialized");
        }
        store
    }

    #[must_use]
    pub fn storage(&self) -> &BasicStorage<B> {
        match self {
            Self::WebCrypto(store) => store.storage(),
            Self::Fallback(store) => store.storage(),
        }
    }

    /// Alias of [`SecretStore::get`] for the generic secure-store surface
    pub async fn secure_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        SecretStore::get(self, key).await
    }

    /// Alias of [`SecretStore::set`] for the generic secure-store surface
    pub async fn secure_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        SecretStore::set(self, key, value).await
    }

    pub fn secure_remove(&self, key: &str) {
        SecretStore::remove(self, key);
    }
}

#[async_trait(?Send)]
impl<B: StorageBackend> SecretStore for SecureStorage<B> {
    fn backend(&self) -> BackendKind {
        match self {
            Self::WebCrypto(_) => BackendKind::WebCrypto,
            Self::Fallback(_) => BackendKind::Fallback,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::WebCrypto(store) => SecretStore::get(store, key).await,
            Self::Fallback(store) => store.try_get(key),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match self {
            Self::WebCrypto(store) => SecretStore::set(store, key, value).await,
            Self::Fallback(store) => store.try_set(key, value),
        }
    }

    fn remove(&self, key: &str) {
        match self {
            Self::WebCrypto(store) => SecretStore::remove(store, key),
            Self::Fallback(store) => store.remove(key),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
