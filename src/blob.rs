//! At-rest representation of one encrypted value.
//!
//! Layout (no length prefixes, no delimiters):
//!
//! ```text
//! [0, 16)   salt        KDF input only
//! [16, 28)  nonce       AEAD nonce for this encryption only
//! [28, end) ciphertext  includes the 16-byte tag appended by the cipher
//! ```
//!
//! The concatenation is base64-encoded (standard alphabet, padded) because
//! the persistence medium only stores strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Salt size in bytes
pub const SALT_SIZE: usize = 16;
/// AEAD nonce size in bytes (96-bit)
pub const NONCE_SIZE: usize = 12;
/// Fixed header: salt + nonce
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;
/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;
/// Smallest decodable blob: header plus the tag of an empty plaintext
pub const MIN_BLOB_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Error types for blob decoding
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("Stored value is not valid base64")]
    InvalidEncoding,
    #[error("Encrypted blob too short: {len} bytes (minimum {MIN_BLOB_SIZE})")]
    TooShort { len: usize },
}

/// Salt, nonce and ciphertext of one stored secret
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    #[must_use]
    pub fn new(salt: [u8; SALT_SIZE], nonce: [u8; NONCE_SIZE], ciphertext: Vec<u8>) -> Self {
        Self { salt, nonce, ciphertext }
    }

    /// Serialize to `salt || nonce || ciphertext`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Split raw bytes at the fixed offsets
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() < MIN_BLOB_SIZE {
            return Err(BlobError::TooShort { len: bytes.len() });
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[..SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[SALT_SIZE..HEADER_SIZE]);

        Ok(Self {
            salt,
            nonce,
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// Text form handed to the persistence adapter
    #[must_use]
    pub fn encode(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Parse the text form read back from the persistence adapter
    pub fn decode(text: &str) -> Result<Self, BlobError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|_| BlobError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

// Ciphertext is not secret but there is no reason to dump it into logs either.
impl std::fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Pack the three fields into their stored text form
#[must_use]
pub fn pack(salt: &[u8; SALT_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> String {
    EncryptedBlob::new(*salt, *nonce, ciphertext.to_vec()).encode()
}

/// Unpack stored text into salt, nonce and ciphertext
pub fn unpack(text: &str) -> Result<EncryptedBlob, BlobError> {
    EncryptedBlob::decode(text)
}
