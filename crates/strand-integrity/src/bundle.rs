// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle manifest verification.
//!
//! A bundle is a registry-level grouping of related items — not a fourth
//! item kind. Its manifest is a signed YAML file enumerating member items
//! and their content hashes, with an optional entrypoint. The manifest
//! signature uses the same substrate as any other item.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strand_core::{ItemId, ItemKind};
use strand_error::{ErrorCode, StrandError};

use crate::{TrustStore, Verdict, content_hash, verify_content};

/// One member of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleItem {
    /// The member's item id.
    pub id: ItemId,
    /// The member's kind.
    pub kind: ItemKind,
    /// Path relative to the bundle directory.
    pub path: String,
    /// Expected hex SHA-256 of the member's normalized content.
    pub sha256: String,
}

/// A signed YAML manifest enumerating a bundle's items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Bundle name.
    pub name: String,
    /// Bundle version.
    #[serde(default)]
    pub version: String,
    /// Member items with content hashes.
    pub items: Vec<BundleItem>,
    /// Optional entrypoint among the members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<ItemId>,
}

impl BundleManifest {
    /// Parse a manifest from signed YAML content. The signature line is a
    /// YAML comment, so parsing does not need to strip it.
    ///
    /// # Errors
    ///
    /// Returns a `PARSING` error on malformed YAML.
    pub fn parse(content: &str) -> strand_error::Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| StrandError::new(ErrorCode::Parsing, format!("bundle manifest: {e}")))
    }
}

/// Verify a bundle: the manifest's own signature, then every member's
/// content hash against the manifest.
///
/// Returns the parsed manifest on success.
///
/// # Errors
///
/// Surfaces the manifest's integrity error, a `PARSING` error, or a
/// `TAMPERED` error naming the first member whose hash does not match.
pub fn verify_bundle(
    manifest_path: &Path,
    store: &TrustStore,
) -> strand_error::Result<BundleManifest> {
    let content = std::fs::read_to_string(manifest_path)?;
    let verdict = verify_content(&content, store);
    if let Some(err) = verdict.to_error(manifest_path) {
        return Err(err);
    }
    debug_assert!(matches!(verdict, Verdict::Trusted { .. }));

    let manifest = BundleManifest::parse(&content)?;
    let bundle_dir = manifest_path.parent().unwrap_or(Path::new("."));

    for item in &manifest.items {
        let member_path = bundle_dir.join(&item.path);
        let member = std::fs::read_to_string(&member_path).map_err(|e| {
            StrandError::new(
                ErrorCode::FileSystem,
                format!("bundle member {} unreadable: {e}", member_path.display()),
            )
            .with_detail("bundle", &manifest.name)
            .with_detail("member", item.id.as_str())
        })?;
        let actual = content_hash(&member);
        if actual != item.sha256 {
            return Err(StrandError::new(
                ErrorCode::Tampered,
                format!("bundle member {} hash mismatch", item.id),
            )
            .with_detail("path", member_path.display().to_string())
            .with_detail("expected_hash", &item.sha256)
            .with_detail("actual_hash", &actual));
        }
    }

    Ok(manifest)
}
