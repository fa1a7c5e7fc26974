// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool source-code constant extraction.
//!
//! Tools authored as scripts declare their metadata as top-level constant
//! assignments with conventional names (`VERSION`, `TOOL_TYPE`,
//! `EXECUTOR_ID`, `CATEGORY`, `CONFIG_SCHEMA`). Two strategies run in
//! order:
//!
//! 1. A strict line-oriented scan that understands each language's
//!    assignment form, including brace-balanced multi-line
//!    `CONFIG_SCHEMA` literals.
//! 2. A regex fallback for files the strict scan cannot fully read.
//!    Fields recovered only by the fallback are reported as *inferred*.
//!
//! [`validate_extraction`] then decides whether what was found is enough.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use strand_core::{ItemId, ToolMeta};
use strand_error::{ErrorCode, StrandError};

/// Fields the strict validator requires.
const REQUIRED_FIELDS: [&str; 2] = ["version", "tool_type"];

/// Result of scanning a tool source file.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Best-effort metadata.
    pub meta: ToolMeta,
    /// Field names recovered only by the regex fallback.
    pub inferred: Vec<String>,
    /// Required field names found by neither strategy.
    pub missing: Vec<String>,
}

/// Scan `source` for conventional metadata constants.
#[must_use]
pub fn extract_tool_source(source: &str, suffix: &str) -> Extraction {
    let mut fields = strict_scan(source, suffix);
    let mut inferred = Vec::new();

    // Fallback pass fills anything the strict scan did not find.
    for (key, value) in fallback_scan(source) {
        if !fields.contains_key(&key) {
            inferred.push(key.clone());
            fields.insert(key, value);
        }
    }

    let missing = REQUIRED_FIELDS
        .iter()
        .filter(|f| !fields.contains_key(**f))
        .map(ToString::to_string)
        .collect();

    Extraction {
        meta: meta_from_fields(&fields),
        inferred,
        missing,
    }
}

/// Strict validation: every required field must be present.
///
/// # Errors
///
/// Returns a `PARSING` error listing the missing fields.
pub fn validate_extraction(extraction: Extraction) -> strand_error::Result<ToolMeta> {
    if !extraction.missing.is_empty() {
        return Err(StrandError::new(
            ErrorCode::Parsing,
            format!(
                "tool source is missing required metadata: {}",
                extraction.missing.join(", ")
            ),
        )
        .with_detail("missing", &extraction.missing)
        .with_detail("inferred", &extraction.inferred)
        .with_suggestion("declare the constants at the top level of the tool source"));
    }
    if !extraction.inferred.is_empty() {
        tracing::warn!(
            target: "strand.extract",
            inferred = ?extraction.inferred,
            "tool metadata partially recovered by fallback extractor"
        );
    }
    Ok(extraction.meta)
}

// ---------------------------------------------------------------------------
// Strict scan
// ---------------------------------------------------------------------------

fn strict_scan(source: &str, suffix: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let mut lines = source.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((key, raw)) = split_assignment(line, suffix) else {
            continue;
        };
        let mut value = raw.to_string();
        // Brace-balanced continuation for multi-line schema literals.
        if value.starts_with('{') {
            let mut depth = brace_delta(&value);
            while depth > 0 {
                let Some(next) = lines.next() else { break };
                value.push('\n');
                value.push_str(next);
                depth += brace_delta(next);
            }
        }
        fields.insert(key, clean_value(&value, suffix));
    }
    fields
}

fn split_assignment<'a>(line: &'a str, suffix: &str) -> Option<(String, &'a str)> {
    // Top-level only: no leading whitespace.
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    let stripped = match suffix {
        "js" | "ts" => line
            .strip_prefix("export const ")
            .or_else(|| line.strip_prefix("const "))?,
        _ => line,
    };
    let (key, value) = stripped.split_once('=')?;
    let key = key.trim();
    if !key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c == '_')
        || key.is_empty()
    {
        return None;
    }
    Some((canonical_field(key)?, value.trim()))
}

fn canonical_field(constant: &str) -> Option<String> {
    match constant {
        "NAME" => Some("name".into()),
        "VERSION" => Some("version".into()),
        "TOOL_TYPE" => Some("tool_type".into()),
        "EXECUTOR_ID" => Some("executor_id".into()),
        "EXECUTOR_VERSION" => Some("executor_version".into()),
        "CATEGORY" => Some("category".into()),
        "CONFIG_SCHEMA" => Some("config_schema".into()),
        _ => None,
    }
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    for c in line.chars() {
        match c {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn clean_value(value: &str, suffix: &str) -> String {
    let mut v = value.trim();
    if matches!(suffix, "js" | "ts") {
        v = v.trim_end_matches(';').trim_end();
    }
    v = v
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(v);
    v.to_string()
}

// ---------------------------------------------------------------------------
// Fallback scan
// ---------------------------------------------------------------------------

fn fallback_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*(?:export\s+)?(?:const\s+|let\s+|var\s+)?([A-Z_]{2,})\s*[:=]\s*(.+?)\s*;?\s*$"#)
            .expect("fallback regex compiles")
    })
}

fn fallback_scan(source: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for caps in fallback_regex().captures_iter(source) {
        let Some(field) = canonical_field(&caps[1]) else {
            continue;
        };
        out.push((field, clean_value(&caps[2], "js")));
    }
    out
}

// ---------------------------------------------------------------------------
// Field assembly
// ---------------------------------------------------------------------------

fn meta_from_fields(fields: &BTreeMap<String, String>) -> ToolMeta {
    let mut meta = ToolMeta {
        name: fields.get("name").cloned().unwrap_or_default(),
        version: fields.get("version").cloned().unwrap_or_default(),
        tool_type: fields.get("tool_type").cloned().unwrap_or_default(),
        category: fields.get("category").cloned().unwrap_or_default(),
        executor_version: fields.get("executor_version").cloned(),
        ..ToolMeta::default()
    };
    if let Some(raw) = fields.get("executor_id")
        && !raw.is_empty()
        && raw != "null"
        && raw != "None"
        && let Ok(id) = ItemId::new(raw)
    {
        meta.executor_id = Some(id);
    }
    if let Some(raw) = fields.get("config_schema")
        && let Ok(schema) = serde_json::from_str(raw)
    {
        meta.parameters = Some(schema);
    }
    meta
}
