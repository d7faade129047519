//! At-rest message encryption: AES-256-GCM, fresh 96-bit nonce per
//! message, authentication tag appended, no associated data. Ciphertext is
//! stored base64-encoded as `nonce || ct || tag`.

use {
    aes_gcm::{
        Aes256Gcm, Key, Nonce,
        aead::{Aead, AeadCore, KeyInit, OsRng},
    },
    base64::Engine,
};

const NONCE_LEN: usize = 12;

/// Encrypt plaintext under the entity's derived key. `None` only on an
/// internal AEAD failure, in which case the caller keeps the plaintext.
#[must_use]
pub fn encrypt_content(key: &[u8; 32], plaintext: &str) -> Option<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Some(base64::engine::general_purpose::STANDARD.encode(out))
}

/// Decrypt a stored message. `None` on malformed input or authentication
/// failure (wrong key); the caller substitutes a sentinel and keeps the
/// message.
#[must_use]
pub fn decrypt_content(key: &[u8; 32], stored: &str) -> Option<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(stored)
        .ok()?;
    if raw.len() <= NONCE_LEN {
        return None;
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
    String::from_utf8(plaintext).ok()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_identity() {
        let key = [7u8; 32];
        let ct = encrypt_content(&key, "secret").unwrap();
        assert_ne!(ct, "secret");
        assert_eq!(decrypt_content(&key, &ct).unwrap(), "secret");
    }

    #[test]
    fn nonces_are_fresh_per_message() {
        let key = [7u8; 32];
        let a = encrypt_content(&key, "same").unwrap();
        let b = encrypt_content(&key, "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ct = encrypt_content(&[1u8; 32], "secret").unwrap();
        assert!(decrypt_content(&[2u8; 32], &ct).is_none());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let key = [7u8; 32];
        assert!(decrypt_content(&key, "not base64 !!!").is_none());
        assert!(decrypt_content(&key, "AAAA").is_none());
    }
}
