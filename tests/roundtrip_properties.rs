//! Property-based tests for encryption round trips and tamper detection.

use devcard_storage::{
    values_equivalent, ApplicationSecret, BasicStorage, CipherSuite, EncryptedBlob, FallbackStore,
    InMemoryStorage, KdfParams, StoreConfig, MIN_BLOB_SIZE, NONCE_SIZE, SALT_SIZE,
};
use proptest::prelude::*;

fn suites() -> impl Strategy<Value = CipherSuite> {
    prop_oneof![Just(CipherSuite::Strong { iterations: 1 }), Just(CipherSuite::Fallback)]
}

/// For any string and either suite, open(seal(s)) == s.
#[test]
fn property_seal_open_roundtrip() {
    proptest!(|(
        suite in suites(),
        secret in "\\PC{1,32}",
        salt in any::<[u8; SALT_SIZE]>(),
        nonce in any::<[u8; NONCE_SIZE]>(),
        plaintext in "\\PC{0,300}",
    )| {
        let blob = suite.seal(&secret, salt, nonce, &plaintext).unwrap();
        prop_assert_eq!(blob.ciphertext.len(), plaintext.len() + 16);

        let decoded = EncryptedBlob::decode(&blob.encode()).unwrap();
        prop_assert_eq!(suite.open(&secret, &decoded).unwrap(), plaintext);
    });
}

/// Flipping any bit of a sealed blob never yields a plaintext.
#[test]
fn property_bit_flip_never_decrypts() {
    proptest!(|(
        suite in suites(),
        salt in any::<[u8; SALT_SIZE]>(),
        nonce in any::<[u8; NONCE_SIZE]>(),
        plaintext in "[a-zA-Z0-9_]{0,64}",
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    )| {
        let blob = suite.seal("secret", salt, nonce, &plaintext).unwrap();
        let mut bytes = blob.to_bytes();
        let index = position.index(bytes.len());
        bytes[index] ^= 1 << bit;

        let tampered = EncryptedBlob::from_bytes(&bytes).unwrap();
        prop_assert!(suite.open("secret", &tampered).is_err(), "flip at byte {} accepted", index);
    });
}

/// Anything shorter than header + tag is rejected before decryption.
#[test]
fn property_short_input_rejected() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..MIN_BLOB_SIZE))| {
        prop_assert!(EncryptedBlob::from_bytes(&bytes).is_err());
    });
}

/// Decoding arbitrary text never panics, and what decodes has a header and a tag.
#[test]
fn property_decode_arbitrary_text() {
    proptest!(|(text in "\\PC{0,120}")| {
        if let Ok(blob) = EncryptedBlob::decode(&text) {
            prop_assert!(blob.to_bytes().len() >= MIN_BLOB_SIZE);
        }
    });
}

/// The fallback store hands back exactly what it was given.
#[test]
fn property_fallback_store_roundtrip() {
    let config = StoreConfig::new(ApplicationSecret::new("property-secret")).with_kdf(KdfParams::TINY);
    proptest!(|(
        key in "[a-z_]{1,24}",
        value in "\\PC{0,200}",
    )| {
        let storage = InMemoryStorage::new();
        let store = FallbackStore::new(BasicStorage::new(storage.clone()), &config);
        store.set(&key, &value);
        prop_assert!(storage.get_raw(&key).is_some());
        prop_assert_eq!(store.get(&key), Some(value));
    });
}

/// Key order in a JSON object never counts as a change.
#[test]
fn property_json_key_order_is_equivalent() {
    proptest!(|(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i32>(), 1..8),
    )| {
        let forward: Vec<String> = entries.iter().map(|(k, v)| format!("\"{k}\":{v}")).collect();
        let reverse: Vec<String> = forward.iter().rev().cloned().collect();
        let a = format!("{{{}}}", forward.join(","));
        let b = format!("{{{}}}", reverse.join(","));
        prop_assert!(values_equivalent(Some(&a), Some(&b)));
    });
}
