// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lockfiles: content-hash pinning for executed chains.
//!
//! After a chain's first successful execution its hashes are pinned to a
//! YAML lockfile. Subsequent executions compare the pinned hashes against
//! the freshly built chain (and anchor scope) and skip the full
//! re-verification on a match. Any drift discards the lockfile.

use crate::anchor::AnchorContext;
use crate::chain::Chain;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strand_core::{ItemId, Space};
use strand_error::{ErrorCode, StrandError};
use strand_resolve::SpaceLayout;

/// Pinned record of one chain element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedElement {
    /// Element item id.
    pub id: ItemId,
    /// Space the element resolved from.
    pub space: Space,
    /// Pinned content hash.
    pub integrity: String,
}

/// A chain lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Root item id.
    pub root: ItemId,
    /// Root item version at pin time.
    pub version: String,
    /// Combined hash over all element hashes.
    pub combined_hash: String,
    /// Per-element pins, root first.
    pub elements: Vec<LockedElement>,
    /// Anchor dependency pins (`relative_path → sha256`), when the tool
    /// uses the anchor feature.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub anchor_files: BTreeMap<String, String>,
}

impl Lockfile {
    /// Build a lockfile from an executed chain.
    #[must_use]
    pub fn pin(chain: &Chain, anchor: Option<&AnchorContext>) -> Self {
        Self {
            root: chain.root().item_id.clone(),
            version: chain.root().meta.version.clone(),
            combined_hash: chain.combined_hash.clone(),
            elements: chain
                .elements
                .iter()
                .map(|e| LockedElement {
                    id: e.item_id.clone(),
                    space: e.resolved.space,
                    integrity: e.content_hash.clone(),
                })
                .collect(),
            anchor_files: anchor.map(|a| a.file_hashes.clone()).unwrap_or_default(),
        }
    }

    /// `true` when the freshly built chain (and anchor) still match the
    /// pinned hashes.
    #[must_use]
    pub fn matches(&self, chain: &Chain, anchor: Option<&AnchorContext>) -> bool {
        if self.combined_hash != chain.combined_hash {
            return false;
        }
        let anchor_hashes = anchor.map(|a| &a.file_hashes);
        match (self.anchor_files.is_empty(), anchor_hashes) {
            (true, None) => true,
            (_, Some(current)) => &self.anchor_files == current,
            (false, None) => false,
        }
    }

    /// Lockfile path for this chain's root under `layout`.
    ///
    /// Lockfiles land in the space the root resolved from, clamped to
    /// project or user.
    #[must_use]
    pub fn path_for(layout: &SpaceLayout, chain: &Chain) -> PathBuf {
        let dir = layout.lockfile_dir(chain.root().resolved.space);
        let version = if chain.root().meta.version.is_empty() {
            "0.0.0"
        } else {
            &chain.root().meta.version
        };
        dir.join(format!("{}_{version}.lock.yaml", chain.root().item_id.slug()))
    }

    /// Load a lockfile, returning `None` when absent.
    ///
    /// A malformed lockfile is treated as absent (it will be rewritten on
    /// the next success) with a warning.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_yaml::from_str(&content) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!(
                    target: "strand.executor",
                    path = %path.display(),
                    error = %e,
                    "discarding malformed lockfile"
                );
                None
            }
        }
    }

    /// Write the lockfile, creating parent directories.
    ///
    /// # Errors
    ///
    /// `FILE_SYSTEM` on write failure, `PARSING` on serialization failure.
    pub fn write(&self, path: &Path) -> strand_error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| StrandError::new(ErrorCode::Parsing, format!("lockfile: {e}")))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}
