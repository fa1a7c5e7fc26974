// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key generation, storage, and fingerprints.
//!
//! Keys are Ed25519. The fingerprint of a key is the first 16 hex
//! characters of the SHA-256 of its public key bytes — short enough for a
//! signature line, long enough that accidental collision is not a
//! concern for a trust store of human scale.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::path::Path;
use strand_core::sha256_hex;
use strand_error::{ErrorCode, StrandError};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// Compute the fingerprint of a verifying key.
#[must_use]
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let mut fp = sha256_hex(key.as_bytes());
    fp.truncate(FINGERPRINT_LEN);
    fp
}

/// A signing key with its precomputed fingerprint.
#[derive(Clone)]
pub struct KeyPair {
    /// The Ed25519 signing key.
    pub signing: SigningKey,
    /// Fingerprint of the corresponding verifying key.
    pub fingerprint: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose secret material through Debug.
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let fingerprint = fingerprint_of(&signing.verifying_key());
        Self {
            signing,
            fingerprint,
        }
    }

    /// Wrap an existing signing key.
    #[must_use]
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let fingerprint = fingerprint_of(&signing.verifying_key());
        Self {
            signing,
            fingerprint,
        }
    }

    /// Load a key pair from a secret-key file written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns a `FILE_SYSTEM` error when the file cannot be read, or a
    /// `PARSING` error when it does not hold a base64 32-byte secret.
    pub fn load(path: &Path) -> strand_error::Result<Self> {
        let encoded = std::fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim()).map_err(|e| {
            StrandError::new(
                ErrorCode::Parsing,
                format!("key file {} is not base64: {e}", path.display()),
            )
        })?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StrandError::new(
                ErrorCode::Parsing,
                format!("key file {} has wrong length", path.display()),
            )
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    /// Persist the secret key as base64, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns a `FILE_SYSTEM` error when the file cannot be written.
    pub fn save(&self, path: &Path) -> strand_error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, BASE64.encode(self.signing.to_bytes()))?;
        Ok(())
    }

    /// Persist the public key as base64 under
    /// `{dir}/{fingerprint}.pub` for trust-store loading.
    ///
    /// # Errors
    ///
    /// Returns a `FILE_SYSTEM` error when the file cannot be written.
    pub fn save_public(&self, dir: &Path) -> strand_error::Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.pub", self.fingerprint));
        std::fs::write(
            &path,
            BASE64.encode(self.signing.verifying_key().as_bytes()),
        )?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_short_hex() {
        let kp = KeyPair::generate();
        assert_eq!(kp.fingerprint.len(), FINGERPRINT_LEN);
        assert!(kp.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/alice.key");
        let kp = KeyPair::generate();
        kp.save(&path).unwrap();
        let loaded = KeyPair::load(&path).unwrap();
        assert_eq!(loaded.fingerprint, kp.fingerprint);
    }

    #[test]
    fn save_public_uses_fingerprint_name() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        let path = kp.save_public(dir.path()).unwrap();
        assert!(
            path.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with(&kp.fingerprint)
        );
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not base64 at all!!!").unwrap();
        let err = KeyPair::load(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[test]
    fn debug_hides_secret() {
        let kp = KeyPair::generate();
        let dbg = format!("{kp:?}");
        assert!(dbg.contains(&kp.fingerprint));
        assert!(!dbg.contains("signing"));
    }
}
