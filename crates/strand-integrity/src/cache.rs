// SPDX-License-Identifier: MIT OR Apache-2.0
//! Verification result cache keyed by `(realpath, content_hash)`.
//!
//! Verification is pure over its key, so a hit is always valid: editing a
//! file changes its content hash and misses naturally. The cache is a
//! handle owning a read-write-guarded map; clone the handle and pass it
//! down the call stack instead of reaching for a global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::Verdict;

/// Shared verification cache handle.
#[derive(Debug, Clone, Default)]
pub struct VerifyCache {
    inner: Arc<RwLock<HashMap<(PathBuf, String), Verdict>>>,
}

impl VerifyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached verdict.
    #[must_use]
    pub fn get(&self, path: &Path, content_hash: &str) -> Option<Verdict> {
        self.inner
            .read()
            .expect("verify cache lock poisoned")
            .get(&(path.to_path_buf(), content_hash.to_string()))
            .cloned()
    }

    /// Store a verdict.
    pub fn insert(&self, path: PathBuf, content_hash: String, verdict: Verdict) {
        self.inner
            .write()
            .expect("verify cache lock poisoned")
            .insert((path, content_hash), verdict);
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("verify cache lock poisoned").len()
    }

    /// `true` when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries (used by tests and by `sign`, which changes
    /// hashes anyway).
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("verify cache lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = VerifyCache::new();
        let path = Path::new("/a/b.md");
        assert!(cache.get(path, "h1").is_none());
        cache.insert(path.to_path_buf(), "h1".into(), Verdict::Unsigned);
        assert_eq!(cache.get(path, "h1"), Some(Verdict::Unsigned));
    }

    #[test]
    fn different_hash_misses() {
        let cache = VerifyCache::new();
        let path = Path::new("/a/b.md");
        cache.insert(path.to_path_buf(), "h1".into(), Verdict::Unsigned);
        assert!(cache.get(path, "h2").is_none());
    }

    #[test]
    fn clones_share_state() {
        let cache = VerifyCache::new();
        let clone = cache.clone();
        cache.insert(
            PathBuf::from("/x.md"),
            "h".into(),
            Verdict::Tampered {
                reason: "test".into(),
            },
        );
        assert_eq!(clone.len(), 1);
    }

    #[test]
    fn clear_empties() {
        let cache = VerifyCache::new();
        cache.insert(PathBuf::from("/x.md"), "h".into(), Verdict::Unsigned);
        cache.clear();
        assert!(cache.is_empty());
    }
}
