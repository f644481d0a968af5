//! PKCE (RFC 7636) and CSRF state material

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Challenge method sent to the authorize endpoint
pub const CHALLENGE_METHOD: &str = "S256";

/// Verifier/challenge pair for one authorization attempt
#[derive(Debug, Clone)]
pub struct Pkce {
    /// Secret kept by this process until the code exchange
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, sent with the authorize request
    pub challenge: String,
}

impl Pkce {
    /// Generate a fresh pair from 64 random bytes (86-character verifier)
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_urlsafe::<64>();
        let challenge = compute_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// S256 code challenge for a verifier
#[must_use]
pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random CSRF state (32 bytes, base64url)
#[must_use]
pub fn generate_state() -> String {
    random_urlsafe::<32>()
}

fn random_urlsafe<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            compute_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_86_urlsafe_chars() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 86);
        assert!(
            pkce.verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_eq!(pkce.challenge, compute_code_challenge(&pkce.verifier));
        assert_eq!(pkce.challenge.len(), 43);
    }

    #[test]
    fn generated_values_are_unique() {
        let a = Pkce::generate();
        let b = Pkce::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn state_is_43_chars() {
        let state = generate_state();
        assert_eq!(state.len(), 43);
        assert!(!state.contains('='));
    }
}
