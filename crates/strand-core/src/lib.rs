// SPDX-License-Identifier: MIT OR Apache-2.0
//! strand-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Strand: addressable items, the three-space
//! namespace, thread state, limits, cost accounting, and the transcript
//! event vocabulary.
//!
//! If you only take one dependency, take this one.

/// Item metadata structs: directives, tools, knowledge.
pub mod meta;
/// Thread identity, status, and cost accounting.
pub mod thread;
/// Append-only transcript event vocabulary.
pub mod transcript;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub use meta::{
    AnchorConfig, AnchorMode, DirectiveMeta, EnvConfig, IoContract, KnowledgeMeta, Limits,
    ToolMeta,
};
pub use thread::{Cost, SuspendReason, ThreadId, ThreadState, ThreadStatus};
pub use transcript::{TranscriptEvent, TranscriptEventKind};

/// Name of the state directory relative to a space root.
pub const STATE_DIR: &str = ".strand";

/// Signature-line marker identifying the current signature version.
pub const SIGNATURE_MARKER: &str = "strand-sig-v1";

// ---------------------------------------------------------------------------
// ItemKind
// ---------------------------------------------------------------------------

/// The three addressable item kinds.
///
/// Kinds are distinguished by semantics, not storage: all three live as
/// signed files under a space root.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// An LLM-facing workflow description: metadata plus free-form prompt body.
    Directive,
    /// An executable unit whose invocation flows through the executor chain.
    Tool,
    /// A text artifact (rules, context, learnings) consumed by prompts.
    Knowledge,
}

impl ItemKind {
    /// Directory name for this kind under a space root.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Directive => "directives",
            Self::Tool => "tools",
            Self::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Directive => "directive",
            Self::Tool => "tool",
            Self::Knowledge => "knowledge",
        };
        f.write_str(s)
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directive" => Ok(Self::Directive),
            "tool" => Ok(Self::Tool),
            "knowledge" => Ok(Self::Knowledge),
            other => Err(format!("unknown item kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// A slash-separated item identifier, e.g. `core/fs/read`.
///
/// Segments are non-empty and drawn from `[a-z0-9_-]` (case-insensitive on
/// parse, stored lowercased). The dotted form (`core.fs.read`) is used in
/// capability paths and converts losslessly.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Parse and validate an item id.
    ///
    /// # Errors
    ///
    /// Returns an error message when the id is empty, has empty segments,
    /// or contains characters outside `[a-z0-9_-]`.
    pub fn new(id: impl AsRef<str>) -> Result<Self, String> {
        let id = id.as_ref().trim().to_ascii_lowercase();
        if id.is_empty() {
            return Err("item id must not be empty".into());
        }
        for segment in id.split('/') {
            if segment.is_empty() {
                return Err(format!("item id has an empty segment: {id:?}"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
            {
                return Err(format!("item id segment {segment:?} has invalid characters"));
            }
        }
        Ok(Self(id))
    }

    /// The raw slash-separated form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the id, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The final segment (the item's short name).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Dotted form used in capability paths (`core.fs.read`).
    #[must_use]
    pub fn dotted(&self) -> String {
        self.0.replace('/', ".")
    }

    /// Parse from the dotted capability form.
    ///
    /// # Errors
    ///
    /// Same validation as [`ItemId::new`].
    pub fn from_dotted(dotted: &str) -> Result<Self, String> {
        Self::new(dotted.replace('.', "/"))
    }

    /// Filesystem-safe slug with `/` replaced by `-`.
    #[must_use]
    pub fn slug(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl FromStr for ItemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Space
// ---------------------------------------------------------------------------

/// A namespace mount where items live.
///
/// Exactly three spaces exist, with fixed precedence
/// `project > user > system`. Resolution returns the highest-precedence
/// occurrence of an item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    /// Per-project items, highest precedence.
    Project,
    /// Per-user items.
    User,
    /// Machine-wide items shipped with the framework, lowest precedence.
    System,
}

impl Space {
    /// Numeric precedence; higher wins resolution.
    #[must_use]
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Project => 2,
            Self::User => 1,
            Self::System => 0,
        }
    }

    /// All spaces in resolution order (highest precedence first).
    #[must_use]
    pub fn resolution_order() -> [Space; 3] {
        [Self::Project, Self::User, Self::System]
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Project => "project",
            Self::User => "user",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

impl FromStr for Space {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            other => Err(format!("unknown space: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: keys are
/// sorted (serde_json's map preserves insertion through a `Value` round
/// trip with sorted keys) and numbers serialize consistently.
///
/// # Errors
///
/// Returns [`strand_error::StrandError`] with code `PARSING` if the value
/// cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> strand_error::Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Hash a serializable value via its canonical JSON form.
///
/// # Errors
///
/// Propagates serialization failures from [`canonical_json`].
pub fn canonical_json_hash<T: Serialize>(value: &T) -> strand_error::Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- ItemId -----------------------------------------------------------

    #[test]
    fn item_id_accepts_slashed_paths() {
        let id = ItemId::new("core/fs/read").unwrap();
        assert_eq!(id.as_str(), "core/fs/read");
        assert_eq!(id.name(), "read");
        assert_eq!(id.segments().count(), 3);
    }

    #[test]
    fn item_id_lowercases() {
        let id = ItemId::new("Core/FS/Read").unwrap();
        assert_eq!(id.as_str(), "core/fs/read");
    }

    #[test]
    fn item_id_rejects_empty() {
        assert!(ItemId::new("").is_err());
        assert!(ItemId::new("   ").is_err());
    }

    #[test]
    fn item_id_rejects_empty_segments() {
        assert!(ItemId::new("a//b").is_err());
        assert!(ItemId::new("/a/b").is_err());
        assert!(ItemId::new("a/b/").is_err());
    }

    #[test]
    fn item_id_rejects_bad_characters() {
        assert!(ItemId::new("a/b c").is_err());
        assert!(ItemId::new("a/b.c").is_err());
        assert!(ItemId::new("../escape").is_err());
    }

    #[test]
    fn item_id_dotted_roundtrip() {
        let id = ItemId::new("core/fs/read").unwrap();
        assert_eq!(id.dotted(), "core.fs.read");
        assert_eq!(ItemId::from_dotted("core.fs.read").unwrap(), id);
    }

    #[test]
    fn item_id_slug() {
        let id = ItemId::new("core/bash/bash").unwrap();
        assert_eq!(id.slug(), "core-bash-bash");
    }

    #[test]
    fn item_id_serde_is_transparent() {
        let id = ItemId::new("a/b").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a/b\"");
        let back: ItemId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn item_id_serde_rejects_invalid() {
        let bad: Result<ItemId, _> = serde_json::from_str("\"a//b\"");
        assert!(bad.is_err());
    }

    // ---- Space ------------------------------------------------------------

    #[test]
    fn space_precedence_ordering() {
        assert!(Space::Project.precedence() > Space::User.precedence());
        assert!(Space::User.precedence() > Space::System.precedence());
    }

    #[test]
    fn resolution_order_is_highest_first() {
        let order = Space::resolution_order();
        assert_eq!(order[0], Space::Project);
        assert_eq!(order[2], Space::System);
    }

    #[test]
    fn space_display_and_parse() {
        for space in Space::resolution_order() {
            let s = space.to_string();
            assert_eq!(s.parse::<Space>().unwrap(), space);
        }
    }

    // ---- ItemKind ---------------------------------------------------------

    #[test]
    fn kind_dir_names() {
        assert_eq!(ItemKind::Directive.dir_name(), "directives");
        assert_eq!(ItemKind::Tool.dir_name(), "tools");
        assert_eq!(ItemKind::Knowledge.dir_name(), "knowledge");
    }

    #[test]
    fn kind_display_parse_roundtrip() {
        for kind in [ItemKind::Directive, ItemKind::Tool, ItemKind::Knowledge] {
            assert_eq!(kind.to_string().parse::<ItemKind>().unwrap(), kind);
        }
    }

    // ---- hashing ----------------------------------------------------------

    #[test]
    fn sha256_hex_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn canonical_json_is_stable_across_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(
            canonical_json_hash(&a).unwrap(),
            canonical_json_hash(&b).unwrap()
        );
    }
}
