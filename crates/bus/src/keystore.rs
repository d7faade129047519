//! Volatile store of per-entity message-encryption keys.
//!
//! Keys exist only in process memory, populated at entity creation, key
//! regeneration, and the first API-key-authenticated MCP request. Cleared
//! on deactivation, deletion, and process exit; never serialized.

use std::collections::HashMap;
use std::sync::RwLock;

use {
    hkdf::Hkdf,
    sha2::{Digest, Sha256},
};

const KEY_INFO: &[u8] = b"entity-msg-encryption";

/// Derive the 32-byte message-encryption key from the raw API key and the
/// entity's stored salt. Deterministic: the same key reappears whenever the
/// same raw API key is presented.
#[must_use]
pub fn derive_key(api_key: &str, salt: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), api_key.as_bytes());
    let mut okm = [0u8; 32];
    if hk.expand(KEY_INFO, &mut okm).is_err() {
        unreachable!("32 bytes is always a valid HKDF-SHA256 output length");
    }
    okm
}

struct KeyEntry {
    key: [u8; 32],
    /// SHA-256 of the raw API key: lets repeated requests in a session skip
    /// the bcrypt verification.
    fingerprint: [u8; 32],
}

/// In-memory mapping entity id → derived key.
#[derive(Default)]
pub struct KeyStore {
    inner: RwLock<HashMap<String, KeyEntry>>,
}

impl KeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and cache the key for an entity. Returns the derived key.
    pub fn insert(&self, entity_id: &str, api_key: &str, salt: &str) -> [u8; 32] {
        let key = derive_key(api_key, salt);
        let entry = KeyEntry {
            key,
            fingerprint: fingerprint(api_key),
        };
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string(), entry);
        key
    }

    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<[u8; 32]> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .map(|e| e.key)
    }

    /// Whether the cached entry was derived from exactly this raw API key.
    /// A match means the key already passed bcrypt once this session.
    #[must_use]
    pub fn matches_fingerprint(&self, entity_id: &str, api_key: &str) -> bool {
        let fp = fingerprint(api_key);
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .is_some_and(|e| e.fingerprint == fp)
    }

    /// Purge one slot (deactivation, deletion, key regeneration).
    pub fn remove(&self, entity_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
    }
}

fn fingerprint(api_key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.finalize().into()
}
