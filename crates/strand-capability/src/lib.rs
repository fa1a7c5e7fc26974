// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Capability tokens over dotted-glob paths.
//!
//! A capability is a dotted path naming an operation, e.g.
//! `strand.execute.tool.fs.read`. Patterns may use `*` as a segment: in a
//! trailing position it covers any deeper path (`strand.search.*` covers
//! `strand.search.knowledge.rules`), elsewhere it matches exactly one
//! segment.
//!
//! Tokens are immutable values. A holder can never widen a token — only
//! [`attenuate`] it against a narrower declaration. Checking is
//! fail-closed: an empty token rejects everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use strand_core::ThreadId;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Pattern validation and matching
// ---------------------------------------------------------------------------

/// Errors from capability pattern validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern was empty or had an empty segment.
    #[error("capability pattern {0:?} has an empty segment")]
    EmptySegment(String),
    /// A segment contains characters outside `[a-z0-9_-]` or a non-bare `*`.
    #[error("capability pattern {0:?} has an invalid segment {1:?}")]
    InvalidSegment(String, String),
}

/// Validate a dotted capability pattern.
///
/// # Errors
///
/// Returns a [`PatternError`] when the pattern is empty, has empty
/// segments, or mixes `*` with other characters inside a segment.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::EmptySegment(pattern.to_string()));
    }
    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }
        if segment == "*" {
            continue;
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(PatternError::InvalidSegment(
                pattern.to_string(),
                segment.to_string(),
            ));
        }
    }
    Ok(())
}

/// Does `pattern` cover the concrete dotted `path`?
///
/// A trailing `*` segment covers one or more remaining path segments; a
/// non-trailing `*` matches exactly one segment; other segments match
/// literally.
#[must_use]
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let segs: Vec<&str> = path.split('.').collect();

    for (i, p) in pat.iter().enumerate() {
        let trailing = i == pat.len() - 1;
        match segs.get(i) {
            None => return false,
            Some(s) => {
                if *p == "*" {
                    if trailing {
                        return true;
                    }
                } else if p != s {
                    return false;
                }
            }
        }
    }
    segs.len() == pat.len()
}

/// Does `parent` imply `child` — i.e. is every path `child` covers also
/// covered by `parent`?
///
/// Used by attenuation: a child may only declare patterns the parent
/// implies.
#[must_use]
pub fn pattern_implies(parent: &str, child: &str) -> bool {
    let par: Vec<&str> = parent.split('.').collect();
    let chi: Vec<&str> = child.split('.').collect();

    for (i, p) in par.iter().enumerate() {
        let parent_trailing = i == par.len() - 1;
        match chi.get(i) {
            // Child is shorter than parent: child covers a path the parent
            // cannot (matching ends early), unless the child already ended
            // exactly where a trailing-star parent begins — handled below.
            None => return false,
            Some(c) => {
                if *p == "*" && parent_trailing {
                    // Parent covers everything from here down.
                    return true;
                }
                if *p == "*" {
                    // Mid-path star matches any single segment, including a
                    // child's own mid-path star.
                    continue;
                }
                if *c == "*" {
                    // Child is broader than the parent at this position.
                    return false;
                }
                if p != c {
                    return false;
                }
            }
        }
    }
    // Parent exhausted. The child must be exactly as long — a longer child
    // would be narrower, but nothing in a star-free parent covers deeper
    // paths.
    chi.len() == par.len()
}

// ---------------------------------------------------------------------------
// CapabilityToken
// ---------------------------------------------------------------------------

/// An immutable set of capability patterns plus issuing metadata.
///
/// Tokens are values: cloned freely, passed by copy, never widened in
/// place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// The capability patterns this token grants.
    patterns: BTreeSet<String>,
    /// The thread that minted or attenuated this token.
    pub issuer: ThreadId,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
}

impl CapabilityToken {
    /// Mint a token from a directive's declared permission patterns.
    ///
    /// # Errors
    ///
    /// Returns the first [`PatternError`] encountered.
    pub fn mint(
        patterns: impl IntoIterator<Item = impl Into<String>>,
        issuer: ThreadId,
    ) -> Result<Self, PatternError> {
        let mut set = BTreeSet::new();
        for p in patterns {
            let p = p.into();
            validate_pattern(&p)?;
            set.insert(p);
        }
        Ok(Self {
            patterns: set,
            issuer,
            issued_at: Utc::now(),
        })
    }

    /// An empty token that rejects every check.
    #[must_use]
    pub fn empty(issuer: ThreadId) -> Self {
        Self {
            patterns: BTreeSet::new(),
            issuer,
            issued_at: Utc::now(),
        }
    }

    /// The granted patterns, sorted.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// Number of granted patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// `true` when the token grants nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Fail-closed check: does any granted pattern cover `required`?
    #[must_use]
    pub fn check(&self, required: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, required))
    }

    /// `true` when every pattern of `other` is implied by this token.
    #[must_use]
    pub fn covers(&self, other: &CapabilityToken) -> bool {
        other
            .patterns
            .iter()
            .all(|c| self.patterns.iter().any(|p| pattern_implies(p, c)))
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token[{}]", self.patterns.len())
    }
}

// ---------------------------------------------------------------------------
// Attenuation
// ---------------------------------------------------------------------------

/// Outcome of attenuating a parent token against a child's declaration.
#[derive(Debug, Clone)]
pub struct Attenuation {
    /// The child's effective token: the intersection of the declaration
    /// with the parent's grants.
    pub token: CapabilityToken,
    /// Declared patterns with no overlap in the parent's grants. Dropped
    /// with a warning — attenuation narrows, it never errors.
    pub dropped: Vec<String>,
}

/// Intersection of two patterns: the narrower one when either implies
/// the other, nothing when they are disjoint.
fn pattern_intersect<'a>(parent: &'a str, declared: &'a str) -> Option<&'a str> {
    if pattern_implies(parent, declared) {
        Some(declared)
    } else if pattern_implies(declared, parent) {
        Some(parent)
    } else {
        None
    }
}

/// Attenuate `parent` against the patterns a child directive declares.
///
/// The child's effective set is the intersection: for each declared
/// pattern, the narrower of it and any overlapping parent pattern. A
/// declaration broader than the parent's grant shrinks to the grant
/// (`fs.*` declared under a parent holding only `fs.read` yields
/// `fs.read`); a declaration with no overlap at all is dropped and
/// reported, not rejected.
///
/// # Errors
///
/// Returns a [`PatternError`] when a declared pattern is malformed.
pub fn attenuate(
    parent: &CapabilityToken,
    declared: impl IntoIterator<Item = impl Into<String>>,
    issuer: ThreadId,
) -> Result<Attenuation, PatternError> {
    let mut granted = BTreeSet::new();
    let mut dropped = Vec::new();

    for d in declared {
        let d = d.into();
        validate_pattern(&d)?;
        let mut any = false;
        for p in &parent.patterns {
            if let Some(narrow) = pattern_intersect(p, &d) {
                granted.insert(narrow.to_string());
                any = true;
            }
        }
        if !any {
            dropped.push(d);
        }
    }

    Ok(Attenuation {
        token: CapabilityToken {
            patterns: granted,
            issuer,
            issued_at: Utc::now(),
        },
        dropped,
    })
}
