//! Key derivation and authenticated encryption.
//!
//! Two cipher suites share the same blob layout:
//! - Strong: PBKDF2-HMAC-SHA256 → AES-256-GCM (the Web-Crypto-equivalent path)
//! - Fallback: HKDF-SHA256 → ChaCha20-Poly1305 (cheap, synchronous)
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `DerivedKey` implements `ZeroizeOnDrop`
//! - **Fresh salt and nonce**: every `seal` call takes a new salt and nonce
//!   from the caller; nothing here caches keys between calls
//! - **Fail closed**: any tag mismatch is `CryptoError::AuthenticationFailed`,
//!   never a partial plaintext

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::blob::{EncryptedBlob, NONCE_SIZE, SALT_SIZE};

/// Symmetric key size in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Domain separation label for the fallback HKDF
const FALLBACK_KDF_INFO: &[u8] = b"devcard-storage-fallback-v1";

/// Domain separation label for the fallback generator seed
const FALLBACK_SEED_LABEL: &[u8] = b"devcard-storage-fallback-seed-v1";

/// Error types for crypto operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Secure random source unavailable")]
    RandomUnavailable,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Authentication failed (tampered, truncated or wrong key)")]
    AuthenticationFailed,
    #[error("Decrypted value is not valid UTF-8")]
    InvalidPlaintext,
}

/// Ephemeral 256-bit key scoped to one encrypt or decrypt call
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Derive the strong-suite key with PBKDF2-HMAC-SHA256
///
/// Deterministic in `(secret, salt, iterations)`, so the salt embedded in a
/// stored blob reproduces the key used at encryption time.
#[must_use]
pub fn derive_key(secret: &str, salt: &[u8; SALT_SIZE], iterations: u32) -> DerivedKey {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations.max(1), &mut key);
    DerivedKey(key)
}

/// Derive the fallback-suite key with HKDF-SHA256
pub fn derive_fallback_key(secret: &str, salt: &[u8; SALT_SIZE]) -> Result<DerivedKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(FALLBACK_KDF_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(DerivedKey(key))
}

/// Encrypt with AES-256-GCM, tag appended
pub fn encrypt(key: &DerivedKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(nonce.into(), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt AES-256-GCM ciphertext with appended tag
pub fn decrypt(key: &DerivedKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt with ChaCha20-Poly1305, tag appended
pub fn fallback_encrypt(key: &DerivedKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(nonce.into(), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt ChaCha20-Poly1305 ciphertext with appended tag
pub fn fallback_decrypt(key: &DerivedKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Fresh random salt from the OS / browser CSPRNG
pub fn random_salt() -> Result<[u8; SALT_SIZE], CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::fill(&mut salt).map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(salt)
}

/// Fresh random nonce from the OS / browser CSPRNG
pub fn random_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce).map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(nonce)
}

/// Seed the fallback store's generator
///
/// `persisted` is the chain state a previous run left in storage (empty on
/// first use). Uses the CSPRNG when it answers. Otherwise the seed is
/// `chain_seed(persisted, local entropy)` and a warning is logged, since the
/// fallback must still come up.
#[must_use]
pub fn seed_fallback_rng(persisted: &[u8]) -> ChaCha20Rng {
    let mut seed = Zeroizing::new([0u8; 32]);
    if getrandom::fill(&mut seed[..]).is_ok() {
        return ChaCha20Rng::from_seed(*seed);
    }

    tracing::warn!("secure random source unavailable; seeding fallback generator from local entropy");
    let local = Zeroizing::new(local_entropy());
    *seed = chain_seed(persisted, &local);
    ChaCha20Rng::from_seed(*seed)
}

/// Mix the persisted chain state with fresh local entropy
///
/// Distinct chain states give distinct seeds even when `local` repeats, so a
/// run never replays an earlier run's salts and nonces while storage keeps
/// advancing the chain.
#[must_use]
pub fn chain_seed(persisted: &[u8], local: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(FALLBACK_SEED_LABEL);
    hasher.update((persisted.len() as u64).to_le_bytes());
    hasher.update(persisted);
    hasher.update(local);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&hasher.finalize());
    seed
}

fn local_entropy() -> Vec<u8> {
    let mut entropy = Vec::with_capacity(48);
    let marker = 0u8;
    entropy.extend_from_slice(&(&marker as *const u8 as usize).to_le_bytes());
    entropy.extend_from_slice(&(local_entropy as fn() -> Vec<u8> as usize).to_le_bytes());

    #[cfg(all(feature = "wasm", target_arch = "wasm32"))]
    {
        entropy.extend_from_slice(&js_sys::Date::now().to_le_bytes());
        entropy.extend_from_slice(&js_sys::Math::random().to_le_bytes());
        entropy.extend_from_slice(&js_sys::Math::random().to_le_bytes());
    }

    #[cfg(not(target_arch = "wasm32"))]
    if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        entropy.extend_from_slice(&elapsed.as_nanos().to_le_bytes());
    }

    entropy
}

/// Cipher suite selected once per store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    /// PBKDF2-HMAC-SHA256 + AES-256-GCM
    Strong { iterations: u32 },
    /// HKDF-SHA256 + ChaCha20-Poly1305
    Fallback,
}

impl CipherSuite {
    /// Derive the key for `salt`
    pub fn derive(&self, secret: &str, salt: &[u8; SALT_SIZE]) -> Result<DerivedKey, CryptoError> {
        match *self {
            Self::Strong { iterations } => Ok(derive_key(secret, salt, iterations)),
            Self::Fallback => derive_fallback_key(secret, salt),
        }
    }

    pub fn encrypt(&self, key: &DerivedKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Strong { .. } => encrypt(key, nonce, plaintext),
            Self::Fallback => fallback_encrypt(key, nonce, plaintext),
        }
    }

    pub fn decrypt(&self, key: &DerivedKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Strong { .. } => decrypt(key, nonce, ciphertext),
            Self::Fallback => fallback_decrypt(key, nonce, ciphertext),
        }
    }

    /// Derive, encrypt and assemble a blob from caller-provided salt and nonce
    pub fn seal(
        &self,
        secret: &str,
        salt: [u8; SALT_SIZE],
        nonce: [u8; NONCE_SIZE],
        plaintext: &str,
    ) -> Result<EncryptedBlob, CryptoError> {
        let key = self.derive(secret, &salt)?;
        let ciphertext = self.encrypt(&key, &nonce, plaintext.as_bytes())?;
        Ok(EncryptedBlob::new(salt, nonce, ciphertext))
    }

    /// Re-derive the key from the embedded salt and decrypt
    pub fn open(&self, secret: &str, blob: &EncryptedBlob) -> Result<String, CryptoError> {
        let key = self.derive(secret, &blob.salt)?;
        let plaintext = self.decrypt(&key, &blob.nonce, &blob.ciphertext)?;
        String::from_utf8(plaintext).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            CryptoError::InvalidPlaintext
        })
    }
}

/// One-shot availability check for the strong suite
///
/// Exercises the CSPRNG, PBKDF2 and AES-GCM on a canary value.
pub fn strong_suite_self_test() -> Result<(), CryptoError> {
    const CANARY: &str = "devcard-storage-canary";
    let suite = CipherSuite::Strong { iterations: 1 };
    let blob = suite.seal("probe", random_salt()?, random_nonce()?, CANARY)?;
    match suite.open("probe", &blob)?.as_str() {
        CANARY => Ok(()),
        _ => Err(CryptoError::AuthenticationFailed),
    }
}

// ============================================================
// TESTS
// ============================================================
