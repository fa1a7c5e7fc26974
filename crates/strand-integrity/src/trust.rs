// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trust store: fingerprint → verifying key, with space precedence.
//!
//! Keys are loaded from `keys/` directories, one per space, walked in
//! precedence order (project first). The first occurrence of a
//! fingerprint wins, mirroring item resolution.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::keys::fingerprint_of;

/// Mapping from fingerprint (or `registry@{user}` authority alias) to
/// verifying key, plus bootstrap roots where unsigned items are
/// tolerated.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: HashMap<String, VerifyingKey>,
    bootstrap_roots: Vec<PathBuf>,
}

impl TrustStore {
    /// Create an empty store that trusts nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keys from `keys/` directories in precedence order (highest
    /// first). Later directories cannot shadow earlier fingerprints.
    ///
    /// Unreadable files and malformed keys are skipped with a warning;
    /// an absent directory is not an error.
    #[must_use]
    pub fn load(key_dirs: &[PathBuf]) -> Self {
        let mut store = Self::new();
        for dir in key_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("pub") {
                    continue;
                }
                match load_public_key(&path) {
                    Some(key) => {
                        let fp = fingerprint_of(&key);
                        store.keys.entry(fp).or_insert(key);
                    }
                    None => {
                        tracing::warn!(
                            target: "strand.integrity",
                            path = %path.display(),
                            "skipping malformed public key"
                        );
                    }
                }
            }
        }
        store
    }

    /// Register a verifying key under an explicit name.
    pub fn insert(&mut self, name: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(name.into(), key);
    }

    /// Register a registry authority so compound fingerprints
    /// (`fp|registry@{user}`) verify.
    pub fn insert_authority(&mut self, username: &str, key: VerifyingKey) {
        self.keys.insert(format!("registry@{username}"), key);
    }

    /// Look up a fingerprint or authority alias.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&VerifyingKey> {
        self.keys.get(name)
    }

    /// Number of trusted keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` when no keys are trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Allow unsigned items under `root` (system bootstrap only).
    pub fn allow_unsigned_bootstrap(&mut self, root: &Path) {
        let real = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        self.bootstrap_roots.push(real);
    }

    /// `true` when `path` falls under a registered bootstrap root.
    #[must_use]
    pub fn unsigned_allowed(&self, path: &Path) -> bool {
        self.bootstrap_roots.iter().any(|root| path.starts_with(root))
    }
}

fn load_public_key(path: &Path) -> Option<VerifyingKey> {
    let encoded = std::fs::read_to_string(path).ok()?;
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let arr: [u8; 32] = bytes.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}
