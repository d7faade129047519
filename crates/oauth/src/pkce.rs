//! PKCE (RFC 7636), S256 only.

use {
    base64::Engine,
    sha2::{Digest, Sha256},
};

/// base64url(SHA-256(verifier)), no padding.
#[must_use]
pub fn challenge_s256(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Constant-shape comparison of a presented verifier against the stored
/// challenge.
#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    challenge_s256(verifier) == challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        // Verifier and challenge from RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_s256(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(verify_s256(verifier, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"));
    }

    #[test]
    fn wrong_verifier_fails() {
        let challenge = challenge_s256("the-real-verifier");
        assert!(!verify_s256("wrong", &challenge));
    }
}
