// SPDX-License-Identifier: MIT OR Apache-2.0
//! Anchor contexts for multi-file tools.
//!
//! An anchor declares the load scope of a tool that ships sibling files:
//! where the scope is rooted, which extensions belong to it, and which
//! environment variables should have the scope prepended (language load
//! paths). Activation walks the scope and verifies **every** file before
//! anything is spawned, so dynamically loaded code is covered by the same
//! fail-closed policy as the tool itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strand_core::{AnchorConfig, AnchorMode};
use strand_error::{ErrorCode, StrandError};
use strand_integrity::{TrustStore, VerifyCache, verify_file};
use walkdir::WalkDir;

/// The computed context of an activated anchor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorContext {
    /// Absolute scope root.
    pub root: PathBuf,
    /// `{relative_path → sha256}` over every file in scope.
    pub file_hashes: BTreeMap<String, String>,
    /// Environment variables to prepend the scope root onto.
    pub env_prepend: Vec<String>,
}

/// Decide whether `anchor` activates for a tool at `tool_path`.
///
/// `always` mode always activates; `auto` activates when one of the
/// declared marker files exists next to the tool.
#[must_use]
pub fn anchor_active(anchor: &AnchorConfig, tool_path: &Path) -> bool {
    match anchor.mode {
        AnchorMode::Always => true,
        AnchorMode::Auto => {
            let dir = tool_path.parent().unwrap_or(Path::new("."));
            anchor.markers.iter().any(|m| dir.join(m).exists())
        }
    }
}

/// Walk and verify an activated anchor's scope.
///
/// # Errors
///
/// Surfaces the first integrity failure in scope — pre-spawn dependency
/// verification is all-or-nothing.
pub fn compute_anchor(
    anchor: &AnchorConfig,
    tool_path: &Path,
    store: &TrustStore,
    cache: &VerifyCache,
) -> strand_error::Result<AnchorContext> {
    let tool_dir = tool_path.parent().unwrap_or(Path::new("."));
    let root = match &anchor.scope {
        Some(rel) => tool_dir.join(rel),
        None => tool_dir.to_path_buf(),
    };
    if !root.is_dir() {
        return Err(StrandError::new(
            ErrorCode::FileSystem,
            format!("anchor scope {} is not a directory", root.display()),
        ));
    }

    let mut file_hashes = BTreeMap::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            StrandError::new(ErrorCode::FileSystem, format!("anchor scope walk: {e}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !extension_in_scope(anchor, path) {
            continue;
        }

        let verdict = verify_file(path, store, cache)?;
        if let Some(err) = verdict.to_error(path) {
            return Err(err);
        }

        let content = std::fs::read_to_string(path)?;
        let rel = path
            .strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        file_hashes.insert(rel, strand_integrity::content_hash(&content));
    }

    Ok(AnchorContext {
        root,
        file_hashes,
        env_prepend: anchor.env_prepend.clone(),
    })
}

/// Hash an anchor scope without verifying signatures.
///
/// Used by the lockfile fast-path: when the pinned hashes still match,
/// the expensive per-file signature verification of [`compute_anchor`]
/// is skipped.
///
/// # Errors
///
/// `FILE_SYSTEM` when the scope cannot be walked or a file read.
pub fn hash_scope(
    anchor: &AnchorConfig,
    tool_path: &Path,
) -> strand_error::Result<BTreeMap<String, String>> {
    let tool_dir = tool_path.parent().unwrap_or(Path::new("."));
    let root = match &anchor.scope {
        Some(rel) => tool_dir.join(rel),
        None => tool_dir.to_path_buf(),
    };
    let mut hashes = BTreeMap::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            StrandError::new(ErrorCode::FileSystem, format!("anchor scope walk: {e}"))
        })?;
        if !entry.file_type().is_file() || !extension_in_scope(anchor, entry.path()) {
            continue;
        }
        let content = std::fs::read_to_string(entry.path())?;
        let rel = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        hashes.insert(rel, strand_integrity::content_hash(&content));
    }
    Ok(hashes)
}

fn extension_in_scope(anchor: &AnchorConfig, path: &Path) -> bool {
    if anchor.extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| anchor.extensions.iter().any(|a| a == ext))
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use strand_integrity::KeyPair;

    fn signed(dir: &Path, name: &str, body: &str, key: &KeyPair) {
        let suffix = name.rsplit('.').next().unwrap_or("");
        let content = strand_integrity::sign_content(body, key, suffix);
        std::fs::create_dir_all(dir.join(name).parent().unwrap()).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn trusting(key: &KeyPair) -> TrustStore {
        let mut store = TrustStore::new();
        store.insert(key.fingerprint.clone(), key.signing.verifying_key());
        store
    }

    #[test]
    fn always_mode_activates() {
        let anchor = AnchorConfig {
            mode: AnchorMode::Always,
            ..AnchorConfig::default()
        };
        assert!(anchor_active(&anchor, Path::new("/tools/x.py")));
    }

    #[test]
    fn auto_mode_needs_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool.py");
        std::fs::write(&tool, "x").unwrap();
        let anchor = AnchorConfig {
            mode: AnchorMode::Auto,
            markers: vec!["__anchor__".into()],
            ..AnchorConfig::default()
        };
        assert!(!anchor_active(&anchor, &tool));
        std::fs::write(dir.path().join("__anchor__"), "").unwrap();
        assert!(anchor_active(&anchor, &tool));
    }

    #[test]
    fn scope_walk_collects_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate();
        signed(dir.path(), "tool.py", "VERSION = \"1.0.0\"\n", &key);
        signed(dir.path(), "lib/helpers.py", "def helper(): pass\n", &key);
        signed(dir.path(), "README.md", "docs\n", &key);

        let anchor = AnchorConfig {
            mode: AnchorMode::Always,
            extensions: vec!["py".into()],
            env_prepend: vec!["PYTHONPATH".into()],
            ..AnchorConfig::default()
        };
        let ctx = compute_anchor(
            &anchor,
            &dir.path().join("tool.py"),
            &trusting(&key),
            &VerifyCache::new(),
        )
        .unwrap();
        assert_eq!(ctx.file_hashes.len(), 2);
        assert!(ctx.file_hashes.contains_key("tool.py"));
        assert!(ctx.file_hashes.contains_key("lib/helpers.py"));
        assert_eq!(ctx.env_prepend, vec!["PYTHONPATH"]);
    }

    #[test]
    fn unsigned_file_in_scope_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate();
        signed(dir.path(), "tool.py", "VERSION = \"1.0.0\"\n", &key);
        std::fs::write(dir.path().join("rogue.py"), "import os\n").unwrap();

        let anchor = AnchorConfig {
            mode: AnchorMode::Always,
            extensions: vec!["py".into()],
            ..AnchorConfig::default()
        };
        let err = compute_anchor(
            &anchor,
            &dir.path().join("tool.py"),
            &trusting(&key),
            &VerifyCache::new(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsigned);
    }

    #[test]
    fn explicit_scope_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate();
        signed(dir.path(), "tool.py", "VERSION = \"1.0.0\"\n", &key);
        signed(dir.path(), "vendor/dep.py", "DEP = 1\n", &key);

        let anchor = AnchorConfig {
            mode: AnchorMode::Always,
            scope: Some("vendor".into()),
            extensions: vec!["py".into()],
            ..AnchorConfig::default()
        };
        let ctx = compute_anchor(
            &anchor,
            &dir.path().join("tool.py"),
            &trusting(&key),
            &VerifyCache::new(),
        )
        .unwrap();
        assert_eq!(ctx.file_hashes.len(), 1);
        assert!(ctx.file_hashes.contains_key("dep.py"));
    }
}
