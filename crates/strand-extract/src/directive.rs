// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directive markdown parsing.
//!
//! A directive file is markdown with one XML metadata block delimited by
//! `<directive …>` / `</directive>`. Everything outside the block (minus
//! the signature line) is the prompt body, handed verbatim to the model.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use strand_core::{DirectiveMeta, Limits};
use strand_error::{ErrorCode, StrandError};

/// A parsed directive: typed metadata plus the opaque prompt body.
#[derive(Debug, Clone)]
pub struct DirectiveDoc {
    /// The structured metadata block.
    pub meta: DirectiveMeta,
    /// The prompt body (content outside the metadata block).
    pub prompt_body: String,
}

/// Parse a directive file.
///
/// # Errors
///
/// Returns a `PARSING` error when the metadata block is missing or the
/// XML inside it is malformed.
pub fn parse_directive(content: &str) -> strand_error::Result<DirectiveDoc> {
    let stripped = strand_integrity::normalize(content);

    let open = stripped.find("<directive").ok_or_else(|| {
        StrandError::new(ErrorCode::Parsing, "directive has no <directive> metadata block")
            .with_suggestion("add a <directive name=… version=…> block")
    })?;
    let close_tag = "</directive>";
    let close = stripped[open..].find(close_tag).ok_or_else(|| {
        StrandError::new(ErrorCode::Parsing, "unterminated <directive> metadata block")
    })? + open
        + close_tag.len();

    let block = &stripped[open..close];
    let meta = parse_metadata_block(block)?;

    let mut prompt_body = String::with_capacity(stripped.len() - block.len());
    prompt_body.push_str(stripped[..open].trim_start());
    prompt_body.push_str(stripped[close..].trim_start_matches('\n'));

    Ok(DirectiveDoc { meta, prompt_body })
}

fn parse_metadata_block(block: &str) -> strand_error::Result<DirectiveMeta> {
    let mut reader = Reader::from_str(block);
    reader.config_mut().trim_text(true);

    let mut meta = DirectiveMeta::default();
    // Element path while descending; the interesting leaves are direct
    // children of <directive> plus <permissions>/<grant>.
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = tag_name(&e);
                if path.is_empty() && name == "directive" {
                    read_directive_attrs(&e, &mut meta)?;
                } else if path.len() == 1 && name == "limits" {
                    read_limit_attrs(&e, &mut meta.limits)?;
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = tag_name(&e);
                if path.len() == 1 && name == "limits" {
                    read_limit_attrs(&e, &mut meta.limits)?;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| StrandError::new(ErrorCode::Parsing, e.to_string()))?
                    .into_owned();
                apply_text(&path, &text, &mut meta)?;
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(StrandError::new(
                    ErrorCode::Parsing,
                    format!("directive metadata XML: {e}"),
                ));
            }
        }
    }

    if meta.name.is_empty() {
        return Err(StrandError::new(
            ErrorCode::Parsing,
            "directive metadata is missing the name attribute",
        ));
    }
    Ok(meta)
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn read_directive_attrs(e: &BytesStart<'_>, meta: &mut DirectiveMeta) -> strand_error::Result<()> {
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| StrandError::new(ErrorCode::Parsing, e.to_string()))?
            .into_owned();
        match key.as_str() {
            "name" => meta.name = value,
            "version" => meta.version = value,
            _ => {}
        }
    }
    Ok(())
}

fn read_limit_attrs(e: &BytesStart<'_>, limits: &mut Limits) -> strand_error::Result<()> {
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| StrandError::new(ErrorCode::Parsing, e.to_string()))?;
        let parse_err = |k: &str| {
            StrandError::new(
                ErrorCode::Parsing,
                format!("limits attribute {k} is not numeric"),
            )
        };
        match key.as_str() {
            "max_turns" => limits.max_turns = Some(value.parse().map_err(|_| parse_err(&key))?),
            "max_input_tokens" => {
                limits.max_input_tokens = Some(value.parse().map_err(|_| parse_err(&key))?);
            }
            "max_output_tokens" => {
                limits.max_output_tokens = Some(value.parse().map_err(|_| parse_err(&key))?);
            }
            "max_spend_usd" => {
                limits.max_spend_usd = Some(value.parse().map_err(|_| parse_err(&key))?);
            }
            "max_duration_secs" => {
                limits.max_duration_secs = Some(value.parse().map_err(|_| parse_err(&key))?);
            }
            "max_depth" => limits.max_depth = Some(value.parse().map_err(|_| parse_err(&key))?),
            "max_spawns" => limits.max_spawns = Some(value.parse().map_err(|_| parse_err(&key))?),
            _ => {}
        }
    }
    Ok(())
}

fn apply_text(path: &[String], text: &str, meta: &mut DirectiveMeta) -> strand_error::Result<()> {
    let leaf: Vec<&str> = path.iter().skip(1).map(String::as_str).collect();
    match leaf.as_slice() {
        ["description"] => meta.description = text.to_string(),
        ["model"] => meta.model = Some(text.to_string()),
        ["permissions", "grant"] => meta.permissions.push(text.to_string()),
        ["inputs"] => {
            meta.inputs = Some(serde_json::from_str(text).map_err(|e| {
                StrandError::new(ErrorCode::Parsing, format!("inputs schema: {e}"))
            })?);
        }
        ["outputs"] => {
            meta.outputs = Some(serde_json::from_str(text).map_err(|e| {
                StrandError::new(ErrorCode::Parsing, format!("outputs schema: {e}"))
            })?);
        }
        ["hooks"] => {
            meta.hooks = Some(serde_json::from_str(text).map_err(|e| {
                StrandError::new(ErrorCode::Parsing, format!("hooks block: {e}"))
            })?);
        }
        _ => {}
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"# Deploy planner

<directive name="plan-deploy" version="2.1.0">
  <description>Plan a deployment</description>
  <model>standard</model>
  <limits max_turns="12" max_spend_usd="2.5" max_spawns="4"/>
  <permissions>
    <grant>strand.execute.tool.fs.*</grant>
    <grant>strand.search.knowledge.*</grant>
  </permissions>
  <inputs>{"type":"object","required":["service"]}</inputs>
</directive>

Given {service}, produce a deployment plan.

Be concise.
"#;

    #[test]
    fn parses_full_metadata() {
        let doc = parse_directive(FULL).unwrap();
        assert_eq!(doc.meta.name, "plan-deploy");
        assert_eq!(doc.meta.version, "2.1.0");
        assert_eq!(doc.meta.description, "Plan a deployment");
        assert_eq!(doc.meta.model.as_deref(), Some("standard"));
        assert_eq!(doc.meta.limits.max_turns, Some(12));
        assert_eq!(doc.meta.limits.max_spend_usd, Some(2.5));
        assert_eq!(doc.meta.limits.max_spawns, Some(4));
        assert_eq!(doc.meta.permissions.len(), 2);
        assert!(doc.meta.inputs.is_some());
    }

    #[test]
    fn body_excludes_metadata_block() {
        let doc = parse_directive(FULL).unwrap();
        assert!(doc.prompt_body.contains("Given {service}"));
        assert!(doc.prompt_body.contains("# Deploy planner"));
        assert!(!doc.prompt_body.contains("<directive"));
        assert!(!doc.prompt_body.contains("</directive>"));
    }

    #[test]
    fn missing_block_is_rejected() {
        let err = parse_directive("just markdown\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[test]
    fn unterminated_block_is_rejected() {
        let err = parse_directive("<directive name=\"x\">\nbody\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[test]
    fn missing_name_is_rejected() {
        let err = parse_directive("<directive version=\"1\"></directive>\n").unwrap_err();
        assert!(err.message.contains("name"));
    }

    #[test]
    fn minimal_directive() {
        let doc =
            parse_directive("<directive name=\"mini\" version=\"0.1.0\"></directive>\nHi.\n")
                .unwrap();
        assert_eq!(doc.meta.name, "mini");
        assert!(doc.meta.permissions.is_empty());
        assert_eq!(doc.meta.limits, Limits::default());
        assert_eq!(doc.prompt_body.trim(), "Hi.");
    }

    #[test]
    fn bad_limit_value_is_rejected() {
        let err = parse_directive(
            "<directive name=\"x\" version=\"1\"><limits max_turns=\"lots\"/></directive>\n",
        )
        .unwrap_err();
        assert!(err.message.contains("max_turns"));
    }

    #[test]
    fn bad_inputs_json_is_rejected() {
        let err = parse_directive(
            "<directive name=\"x\" version=\"1\"><inputs>{nope}</inputs></directive>\n",
        )
        .unwrap_err();
        assert!(err.message.contains("inputs"));
    }

    #[test]
    fn signature_line_is_stripped_from_body() {
        let key = strand_integrity::KeyPair::generate();
        let signed = strand_integrity::sign_content(FULL, &key, "md");
        let doc = parse_directive(&signed).unwrap();
        assert!(!doc.prompt_body.contains("strand-sig-v1"));
    }
}
