//! Credential-at-rest seam.
//!
//! The cipher itself is an external collaborator. Callers receive decrypted values as
//! `Zeroizing<String>` so the plaintext is wiped when dropped, and must never log them.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{FarmError, Result};

pub trait CredentialCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>>;
}

/// Development cipher: stored credentials are plaintext.
///
/// Refuses to run unless explicitly allowed in configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlaintextCipher {
    allowed: bool,
}

impl PlaintextCipher {
    pub fn new(allowed: bool) -> Self {
        Self { allowed }
    }
}

impl CredentialCipher for PlaintextCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>> {
        if !self.allowed {
            return Err(FarmError::Crypto(
                "plaintext credentials are disabled (security.allow_plaintext_credentials)"
                    .to_string(),
            ));
        }
        if ciphertext.is_empty() {
            return Err(FarmError::Crypto("stored credential is empty".to_string()));
        }
        Ok(Zeroizing::new(ciphertext.to_string()))
    }
}

/// Short non-reversible fingerprint of a secret, safe for logs.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_cipher_gate() {
        assert!(PlaintextCipher::new(false).decrypt("pw").is_err());
        assert_eq!(PlaintextCipher::new(true).decrypt("pw").unwrap().as_str(), "pw");
        assert!(PlaintextCipher::new(true).decrypt("").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("secret"), fingerprint("secret"));
        assert_eq!(fingerprint("secret").len(), 8);
        assert_ne!(fingerprint("secret"), fingerprint("Secret"));
    }
}
