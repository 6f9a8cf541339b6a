//! Devcard Storage - encrypted browser-local credential store
//!
//! This crate keeps the developer profile dashboard's GitHub token (and any
//! other sensitive string) in the origin's string key/value store, encrypted
//! at rest. It uses:
//! - PBKDF2-HMAC-SHA256 (100,000 iterations) + AES-256-GCM when available
//! - HKDF-SHA256 + ChaCha20-Poly1305 as a synchronous fallback
//! - A fresh 16-byte salt and 12-byte nonce for every write
//! - A same-context pub/sub channel mirroring the browser's `storage` event
//!
//! ## Architecture
//!
//! ```text
//! UI components
//!     ↓ get_token / set_token / clear_token
//! TokenVault (write throttle, no-op on unchanged value)
//!     ↓ get / set / remove
//! SecureStorage ── WebCryptoStore | FallbackStore (selected once)
//!     ↓ base64(salt || nonce || ciphertext+tag)
//! BasicStorage (error containment, "undefined" handling)
//!     ├── ChangeNotifier (same-context channel)
//!     ↓ getItem / setItem / removeItem
//! localStorage (or InMemoryStorage)
//!     └── storage event → other contexts' ChangeNotifier
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod blob;
pub mod config;
pub mod crypto;
pub mod notifier;
pub mod secure_store;
pub mod storage;
pub mod token;

pub use blob::{
    pack, unpack, BlobError, EncryptedBlob,
    HEADER_SIZE, MIN_BLOB_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
pub use config::{
    ApplicationSecret, ConfigError, KdfParams, MissingSecretPolicy, SecretSource, StoreConfig,
    DEVELOPMENT_SECRET, SECRET_ENV_VAR, WRITE_COOLDOWN,
};
pub use crypto::{
    chain_seed, decrypt, derive_fallback_key, derive_key, encrypt, fallback_decrypt,
    fallback_encrypt, random_nonce, random_salt, seed_fallback_rng, CipherSuite, CryptoError,
    DerivedKey, KEY_SIZE,
};
pub use notifier::{
    values_equivalent, ChangeNotifier, ChangeSource, StorageChange, SubscriptionId, WeakNotifier,
};
pub use secure_store::{
    BackendKind, CryptoProbe, FallbackStore, ForcedBackend, SecretStore, SecureStorage,
    SelfTestProbe, StoreError, WebCryptoStore, FALLBACK_SEED_KEY,
};
pub use storage::{
    BasicStorage, ContextId, InMemoryStorage, StorageBackend, StorageError, UNDEFINED_LITERAL,
};
#[cfg(not(target_arch = "wasm32"))]
pub use token::SystemClock;
pub use token::{
    duration_from_millis, token_key_for, Clock, ManualClock, SetTokenOutcome, TokenVault,
    GITHUB_TOKEN_KEY, GITHUB_TOKEN_SECURE_KEY,
};

#[cfg(feature = "wasm")]
mod wasm;

#[cfg(feature = "wasm")]
pub use wasm::*;
