// SPDX-License-Identifier: MIT OR Apache-2.0
//! Knowledge markdown parsing.
//!
//! Knowledge items are markdown with a YAML frontmatter fence:
//!
//! ```text
//! ---
//! id: review/rules
//! tags: [review, style]
//! ---
//! body…
//! ```

use strand_core::KnowledgeMeta;
use strand_error::{ErrorCode, StrandError};

/// A parsed knowledge item.
#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    /// Frontmatter fields.
    pub meta: KnowledgeMeta,
    /// Markdown body after the frontmatter.
    pub body: String,
}

/// Parse a knowledge file. Missing frontmatter yields default metadata
/// with the full content as body — knowledge is tolerant where tools are
/// strict.
///
/// # Errors
///
/// Returns a `PARSING` error when a frontmatter fence opens but its YAML
/// is malformed or the fence never closes.
pub fn parse_knowledge(content: &str) -> strand_error::Result<KnowledgeDoc> {
    let stripped = strand_integrity::normalize(content);

    let Some(rest) = stripped.strip_prefix("---\n") else {
        return Ok(KnowledgeDoc {
            meta: KnowledgeMeta::default(),
            body: stripped,
        });
    };

    let close = rest
        .find("\n---\n")
        .or_else(|| rest.strip_suffix("\n---").map(|head| head.len()))
        .ok_or_else(|| {
            StrandError::new(ErrorCode::Parsing, "unterminated knowledge frontmatter fence")
        })?;

    let yaml = &rest[..close];
    let body = rest
        .get(close + "\n---\n".len()..)
        .unwrap_or_default()
        .trim_start_matches('\n')
        .to_string();

    let meta: KnowledgeMeta = serde_yaml::from_str(yaml)
        .map_err(|e| StrandError::new(ErrorCode::Parsing, format!("knowledge frontmatter: {e}")))?;

    Ok(KnowledgeDoc { meta, body })
}
