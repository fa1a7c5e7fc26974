// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain construction.
//!
//! Starting at a root tool, follow `executor_id` references until a
//! primitive (null executor) terminates the chain. The result is ordered
//! `[tool, runtime…, primitive]`. A visited set catches exact cycles and
//! a depth cap catches pathological nesting.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use strand_core::{ItemId, ItemKind, ToolMeta, sha256_hex};
use strand_error::{ErrorCode, StrandError};
use strand_extract::ItemMeta;
use strand_integrity::{TrustStore, VerifyCache, verify_file};
use strand_resolve::{Resolved, SpaceLayout, resolve};

/// Maximum number of elements in a chain. Deeper nesting is a cycle or an
/// authoring mistake.
pub const MAX_CHAIN_DEPTH: usize = 10;

/// One resolved, verified element of a chain.
#[derive(Debug, Clone)]
pub struct ChainElement {
    /// The element's item id.
    pub item_id: ItemId,
    /// Parsed metadata.
    pub meta: ToolMeta,
    /// Where the element was found.
    pub resolved: Resolved,
    /// Normalized body (source or config).
    pub body: String,
    /// Hex SHA-256 of the normalized content.
    pub content_hash: String,
}

/// An ordered executor chain `[tool, …, primitive]`.
#[derive(Debug, Clone)]
pub struct Chain {
    /// The elements, root first.
    pub elements: Vec<ChainElement>,
    /// Hash over every element's content hash, in order.
    pub combined_hash: String,
}

impl Chain {
    /// The root (invoked) element.
    #[must_use]
    pub fn root(&self) -> &ChainElement {
        &self.elements[0]
    }

    /// The terminal primitive.
    #[must_use]
    pub fn primitive(&self) -> &ChainElement {
        self.elements.last().expect("chain is never empty")
    }

    fn combined_hash_of(elements: &[ChainElement]) -> String {
        let mut joined = String::new();
        for e in elements {
            joined.push_str(&e.content_hash);
            joined.push('\n');
        }
        sha256_hex(joined.as_bytes())
    }
}

/// Build and verify the chain rooted at `root`.
///
/// Every element is resolved, integrity-verified (fail-closed), and
/// metadata-extracted before its executor reference is followed.
///
/// # Errors
///
/// `EXECUTOR_NOT_FOUND` when a referenced executor does not resolve,
/// `CIRCULAR_DEPENDENCY` / `CHAIN_TOO_DEEP` on malformed nesting, plus
/// any integrity or parsing error from the element files.
pub fn build_chain(
    layout: &SpaceLayout,
    store: &TrustStore,
    cache: &VerifyCache,
    root: &ItemId,
) -> strand_error::Result<Chain> {
    let mut elements = Vec::new();
    let mut visited: HashSet<ItemId> = HashSet::new();
    let mut current = root.clone();

    loop {
        if !visited.insert(current.clone()) {
            return Err(StrandError::new(
                ErrorCode::CircularDependency,
                format!("executor chain revisits {current}"),
            )
            .with_detail("item_id", current.as_str())
            .with_detail("chain", chain_ids(&elements)));
        }
        if elements.len() >= MAX_CHAIN_DEPTH {
            return Err(StrandError::new(
                ErrorCode::ChainTooDeep,
                format!("executor chain exceeds {MAX_CHAIN_DEPTH} elements"),
            )
            .with_detail("chain", chain_ids(&elements)));
        }

        let element = load_element(layout, store, cache, &current, &elements)?;
        let next = element.meta.executor_id.clone();
        elements.push(element);

        match next {
            None => break,
            Some(executor) => current = executor,
        }
    }

    let combined_hash = Chain::combined_hash_of(&elements);
    Ok(Chain {
        elements,
        combined_hash,
    })
}

fn load_element(
    layout: &SpaceLayout,
    store: &TrustStore,
    cache: &VerifyCache,
    id: &ItemId,
    so_far: &[ChainElement],
) -> strand_error::Result<ChainElement> {
    let resolved = match resolve(layout, ItemKind::Tool, id) {
        Ok(r) => r,
        Err(e) if e.code == ErrorCode::ItemNotFound && !so_far.is_empty() => {
            // The root not existing is ItemNotFound; a *referenced*
            // executor not existing is a chain defect.
            return Err(StrandError::new(
                ErrorCode::ExecutorNotFound,
                format!(
                    "executor {id} referenced by {} does not resolve",
                    so_far.last().map_or("<root>", |e| e.item_id.as_str())
                ),
            )
            .with_detail("executor_id", id.as_str()));
        }
        Err(e) => return Err(e),
    };

    let verdict = verify_file(&resolved.path, store, cache)?;
    if let Some(err) = verdict.to_error(&resolved.path) {
        return Err(err);
    }

    let content = std::fs::read_to_string(&resolved.path)?;
    let ItemMeta::Tool { meta, body } =
        strand_extract::extract(ItemKind::Tool, &resolved.suffix, &content)?
    else {
        unreachable!("tool extraction returns tool metadata")
    };
    let content_hash = strand_integrity::content_hash(&content);

    Ok(ChainElement {
        item_id: id.clone(),
        meta,
        resolved,
        body,
        content_hash,
    })
}

fn chain_ids(elements: &[ChainElement]) -> Vec<String> {
    elements.iter().map(|e| e.item_id.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Chain cache
// ---------------------------------------------------------------------------

/// Process-wide chain cache handle, keyed by root item id.
///
/// A hit is validated by re-hashing the cached element files — far
/// cheaper than re-parsing and re-verifying. Any content change misses.
#[derive(Debug, Clone, Default)]
pub struct ChainCache {
    inner: Arc<RwLock<std::collections::HashMap<ItemId, Chain>>>,
}

impl ChainCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached chain for `root` if every element file still
    /// hashes the same.
    #[must_use]
    pub fn get_if_fresh(&self, root: &ItemId) -> Option<Chain> {
        let guard = self.inner.read().expect("chain cache lock poisoned");
        let chain = guard.get(root)?;
        for element in &chain.elements {
            let content = std::fs::read_to_string(&element.resolved.path).ok()?;
            if strand_integrity::content_hash(&content) != element.content_hash {
                return None;
            }
        }
        Some(chain.clone())
    }

    /// Store a freshly built chain.
    pub fn insert(&self, chain: Chain) {
        self.inner
            .write()
            .expect("chain cache lock poisoned")
            .insert(chain.root().item_id.clone(), chain);
    }
}
