// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Three-space item resolver.
//!
//! Maps `(item_kind, item_id)` to a file by walking the project, user, and
//! system spaces in precedence order. The id-to-filename mapping is
//! deterministic: slashes become directory separators and a fixed suffix
//! order is tried. Two files in the *same* space differing only by suffix
//! are an authoring error and resolution rejects them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strand_core::{ItemId, ItemKind, Space, ThreadId};
use strand_error::{ErrorCode, StrandError};
use walkdir::WalkDir;

/// Suffixes tried during resolution, in preference order.
pub const SUFFIXES: [&str; 7] = ["md", "py", "yaml", "yml", "js", "ts", "sh"];

// ---------------------------------------------------------------------------
// SpaceLayout
// ---------------------------------------------------------------------------

/// The three space roots an orchestrator works against.
///
/// Each root is a state directory (conventionally named `.strand`) holding
/// `directives/`, `tools/`, `knowledge/`, `keys/`, `lockfiles/`,
/// `bundles/`, and — for the project space — `threads/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceLayout {
    /// Project-space state directory (highest precedence).
    pub project: PathBuf,
    /// User-space state directory.
    pub user: PathBuf,
    /// System-space state directory (lowest precedence).
    pub system: PathBuf,
}

impl SpaceLayout {
    /// Conventional layout under a project root plus the user's home
    /// directory and a system prefix.
    #[must_use]
    pub fn conventional(project_root: &Path, home: &Path, system_prefix: &Path) -> Self {
        Self {
            project: project_root.join(strand_core::STATE_DIR),
            user: home.join(strand_core::STATE_DIR),
            system: system_prefix.join("strand"),
        }
    }

    /// The state directory of one space.
    #[must_use]
    pub fn space_root(&self, space: Space) -> &Path {
        match space {
            Space::Project => &self.project,
            Space::User => &self.user,
            Space::System => &self.system,
        }
    }

    /// Directory holding items of `kind` in `space`.
    #[must_use]
    pub fn item_dir(&self, space: Space, kind: ItemKind) -> PathBuf {
        self.space_root(space).join(kind.dir_name())
    }

    /// Key directories in precedence order, for trust-store loading.
    #[must_use]
    pub fn key_dirs(&self) -> Vec<PathBuf> {
        Space::resolution_order()
            .iter()
            .map(|s| self.space_root(*s).join("keys"))
            .collect()
    }

    /// Lockfile directory for a space. Only project and user spaces hold
    /// lockfiles; system-space roots pin into the user space.
    #[must_use]
    pub fn lockfile_dir(&self, space: Space) -> PathBuf {
        let space = match space {
            Space::System => Space::User,
            other => other,
        };
        self.space_root(space).join("lockfiles")
    }

    /// Bundle directory for a space.
    #[must_use]
    pub fn bundle_dir(&self, space: Space) -> PathBuf {
        self.space_root(space).join("bundles")
    }

    /// Per-thread state directory (always project space).
    #[must_use]
    pub fn thread_dir(&self, thread_id: &ThreadId) -> PathBuf {
        self.project.join("threads").join(thread_id.as_str())
    }

    /// Path of the thread registry / budget database.
    #[must_use]
    pub fn registry_db(&self) -> PathBuf {
        self.project.join("threads").join("registry.db")
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Absolute path of the item file.
    pub path: PathBuf,
    /// The space the item was found in.
    pub space: Space,
    /// The suffix the file carries (without the dot).
    pub suffix: String,
}

/// Resolve `(kind, id)` to a file, walking spaces in precedence order.
///
/// # Errors
///
/// `ITEM_NOT_FOUND` when no space holds the item; `AMBIGUOUS_SUFFIX` when
/// one space holds two candidates differing only by suffix.
pub fn resolve(
    layout: &SpaceLayout,
    kind: ItemKind,
    id: &ItemId,
) -> strand_error::Result<Resolved> {
    for space in Space::resolution_order() {
        let base = layout.item_dir(space, kind).join(id.as_str());
        let mut found: Vec<(PathBuf, &str)> = Vec::new();
        for suffix in SUFFIXES {
            let candidate = base.with_extension(suffix);
            if candidate.is_file() {
                found.push((candidate, suffix));
            }
        }
        match found.len() {
            0 => continue,
            1 => {
                let (path, suffix) = found.remove(0);
                return Ok(Resolved {
                    path,
                    space,
                    suffix: suffix.to_string(),
                });
            }
            _ => {
                let candidates: Vec<String> = found
                    .iter()
                    .map(|(p, _)| p.display().to_string())
                    .collect();
                return Err(StrandError::new(
                    ErrorCode::AmbiguousSuffix,
                    format!("{kind} {id} has multiple candidates in the {space} space"),
                )
                .with_detail("candidates", candidates)
                .with_suggestion("keep exactly one file per item id in a space"));
            }
        }
    }

    Err(
        StrandError::new(ErrorCode::ItemNotFound, format!("{kind} {id} not found"))
            .with_detail("kind", kind.to_string())
            .with_detail("item_id", id.as_str()),
    )
}

// ---------------------------------------------------------------------------
// Listing (backs the public `search` operation)
// ---------------------------------------------------------------------------

/// One item discovered by [`list_items`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedItem {
    /// Reconstructed item id.
    pub item_id: ItemId,
    /// Item kind.
    pub kind: ItemKind,
    /// Space the listed occurrence lives in.
    pub space: Space,
    /// Absolute file path.
    pub path: PathBuf,
}

/// List all items of `kind`, optionally filtered to one space.
///
/// Occurrences shadowed by a higher-precedence space are omitted, matching
/// what [`resolve`] would return for each id.
#[must_use]
pub fn list_items(layout: &SpaceLayout, kind: ItemKind, space: Option<Space>) -> Vec<ListedItem> {
    let mut seen: Vec<ListedItem> = Vec::new();
    for sp in Space::resolution_order() {
        if let Some(filter) = space
            && filter != sp
        {
            continue;
        }
        let dir = layout.item_dir(sp, kind);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(suffix) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !SUFFIXES.contains(&suffix) {
                continue;
            }
            let Ok(rel) = path.with_extension("").strip_prefix(&dir).map(Path::to_path_buf) else {
                continue;
            };
            let Ok(item_id) = ItemId::new(rel.to_string_lossy().replace('\\', "/")) else {
                continue;
            };
            if seen.iter().any(|s| s.item_id == item_id) {
                // Shadowed by a higher-precedence space.
                continue;
            }
            seen.push(ListedItem {
                item_id,
                kind,
                space: sp,
                path: path.to_path_buf(),
            });
        }
    }
    seen.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    seen
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        layout: SpaceLayout,
    }

    fn fixture() -> Fixture {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let layout = SpaceLayout {
            project: dirs[0].path().to_path_buf(),
            user: dirs[1].path().to_path_buf(),
            system: dirs[2].path().to_path_buf(),
        };
        Fixture {
            layout,
            _dirs: dirs,
        }
    }

    fn put(layout: &SpaceLayout, space: Space, kind: ItemKind, rel: &str, body: &str) {
        let path = layout.item_dir(space, kind).join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn resolves_from_single_space() {
        let f = fixture();
        put(&f.layout, Space::System, ItemKind::Tool, "core/fs/read.yaml", "x");
        let id = ItemId::new("core/fs/read").unwrap();
        let r = resolve(&f.layout, ItemKind::Tool, &id).unwrap();
        assert_eq!(r.space, Space::System);
        assert_eq!(r.suffix, "yaml");
    }

    #[test]
    fn project_shadows_user_and_system() {
        let f = fixture();
        for space in [Space::Project, Space::User, Space::System] {
            put(&f.layout, space, ItemKind::Directive, "ops/deploy.md", "x");
        }
        let id = ItemId::new("ops/deploy").unwrap();
        let r = resolve(&f.layout, ItemKind::Directive, &id).unwrap();
        assert_eq!(r.space, Space::Project);
    }

    #[test]
    fn user_shadows_system() {
        let f = fixture();
        put(&f.layout, Space::User, ItemKind::Knowledge, "rules.md", "x");
        put(&f.layout, Space::System, ItemKind::Knowledge, "rules.md", "x");
        let id = ItemId::new("rules").unwrap();
        let r = resolve(&f.layout, ItemKind::Knowledge, &id).unwrap();
        assert_eq!(r.space, Space::User);
    }

    #[test]
    fn missing_item_is_not_found() {
        let f = fixture();
        let id = ItemId::new("nope").unwrap();
        let err = resolve(&f.layout, ItemKind::Tool, &id).unwrap_err();
        assert_eq!(err.code, ErrorCode::ItemNotFound);
    }

    #[test]
    fn same_space_suffix_collision_is_ambiguous() {
        let f = fixture();
        put(&f.layout, Space::User, ItemKind::Tool, "fmt.py", "x");
        put(&f.layout, Space::User, ItemKind::Tool, "fmt.sh", "x");
        let id = ItemId::new("fmt").unwrap();
        let err = resolve(&f.layout, ItemKind::Tool, &id).unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousSuffix);
    }

    #[test]
    fn cross_space_suffix_difference_is_fine() {
        let f = fixture();
        put(&f.layout, Space::Project, ItemKind::Tool, "fmt.py", "x");
        put(&f.layout, Space::System, ItemKind::Tool, "fmt.sh", "x");
        let id = ItemId::new("fmt").unwrap();
        let r = resolve(&f.layout, ItemKind::Tool, &id).unwrap();
        assert_eq!(r.space, Space::Project);
        assert_eq!(r.suffix, "py");
    }

    #[test]
    fn suffix_probe_order_is_fixed() {
        assert_eq!(SUFFIXES, ["md", "py", "yaml", "yml", "js", "ts", "sh"]);
    }

    #[test]
    fn list_deduplicates_by_precedence() {
        let f = fixture();
        put(&f.layout, Space::Project, ItemKind::Tool, "a/x.yaml", "p");
        put(&f.layout, Space::System, ItemKind::Tool, "a/x.yaml", "s");
        put(&f.layout, Space::System, ItemKind::Tool, "b/y.yaml", "s");
        let items = list_items(&f.layout, ItemKind::Tool, None);
        assert_eq!(items.len(), 2);
        let x = items.iter().find(|i| i.item_id.as_str() == "a/x").unwrap();
        assert_eq!(x.space, Space::Project);
    }

    #[test]
    fn list_space_filter() {
        let f = fixture();
        put(&f.layout, Space::Project, ItemKind::Tool, "a.yaml", "p");
        put(&f.layout, Space::System, ItemKind::Tool, "b.yaml", "s");
        let items = list_items(&f.layout, ItemKind::Tool, Some(Space::System));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id.as_str(), "b");
    }

    #[test]
    fn lockfiles_never_land_in_system_space() {
        let f = fixture();
        assert_eq!(
            f.layout.lockfile_dir(Space::System),
            f.layout.user.join("lockfiles")
        );
        assert_eq!(
            f.layout.lockfile_dir(Space::Project),
            f.layout.project.join("lockfiles")
        );
    }

    #[test]
    fn thread_dir_is_under_project_space() {
        let f = fixture();
        let tid = ThreadId::from_raw("demo-1");
        assert!(f.layout.thread_dir(&tid).starts_with(&f.layout.project));
    }
}
