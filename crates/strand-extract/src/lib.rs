// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Metadata extraction for Strand items.
//!
//! Four parsers, chosen by file suffix and item kind:
//!
//! 1. Markdown + XML metadata block → directives ([`directive`]).
//! 2. Markdown + YAML frontmatter → knowledge ([`knowledge`]).
//! 3. Source-code constant scan with regex fallback → tools authored as
//!    scripts ([`tool_source`]).
//! 4. YAML configs → tools, runtimes, and primitives ([`tool_yaml`]).
//!
//! All parsers take content whose signature has already been verified;
//! they strip the signature line themselves so callers can hand over raw
//! file contents.

/// Directive markdown parsing (XML metadata block + prompt body).
pub mod directive;
/// Knowledge markdown parsing (YAML frontmatter + body).
pub mod knowledge;
/// Tool source-code constant extraction with regex fallback.
pub mod tool_source;
/// YAML tool / runtime / primitive configs.
pub mod tool_yaml;

use strand_core::{DirectiveMeta, ItemKind, KnowledgeMeta, ToolMeta};
use strand_error::{ErrorCode, StrandError};

pub use directive::{DirectiveDoc, parse_directive};
pub use knowledge::{KnowledgeDoc, parse_knowledge};
pub use tool_source::{Extraction, extract_tool_source, validate_extraction};
pub use tool_yaml::parse_tool_yaml;

/// Parsed item metadata, one variant per kind.
#[derive(Debug, Clone)]
pub enum ItemMeta {
    /// A directive's metadata and prompt body.
    Directive(DirectiveDoc),
    /// A tool's metadata and raw body.
    Tool {
        /// Parsed metadata.
        meta: ToolMeta,
        /// Source or config body with the signature stripped.
        body: String,
    },
    /// A knowledge item's frontmatter and body.
    Knowledge(KnowledgeDoc),
}

/// Extract metadata from verified content, dispatching on kind and suffix.
///
/// # Errors
///
/// Returns a `PARSING` error when the selected parser rejects the content.
pub fn extract(kind: ItemKind, suffix: &str, content: &str) -> strand_error::Result<ItemMeta> {
    match kind {
        ItemKind::Directive => Ok(ItemMeta::Directive(parse_directive(content)?)),
        ItemKind::Knowledge => Ok(ItemMeta::Knowledge(parse_knowledge(content)?)),
        ItemKind::Tool => {
            let body = strand_integrity::normalize(content);
            let meta = match suffix {
                "yaml" | "yml" => parse_tool_yaml(&body)?,
                "py" | "js" | "ts" | "sh" => {
                    let extraction = extract_tool_source(&body, suffix);
                    validate_extraction(extraction)?
                }
                other => {
                    return Err(StrandError::new(
                        ErrorCode::Parsing,
                        format!("no tool extractor for suffix {other:?}"),
                    ));
                }
            };
            Ok(ItemMeta::Tool { meta, body })
        }
    }
}

/// Minimal fallback metadata for a kind, used when no schema or extractor
/// is installed. Keeps the core functional, at the cost of a warning.
#[must_use]
pub fn fallback_meta(kind: ItemKind) -> ItemMeta {
    tracing::warn!(
        target: "strand.extract",
        kind = %kind,
        "no extractor output available; using fallback metadata"
    );
    match kind {
        ItemKind::Directive => ItemMeta::Directive(DirectiveDoc {
            meta: DirectiveMeta::default(),
            prompt_body: String::new(),
        }),
        ItemKind::Tool => ItemMeta::Tool {
            meta: ToolMeta::default(),
            body: String::new(),
        },
        ItemKind::Knowledge => ItemMeta::Knowledge(KnowledgeDoc {
            meta: KnowledgeMeta::default(),
            body: String::new(),
        }),
    }
}
