// SPDX-License-Identifier: MIT OR Apache-2.0
//! YAML tool / runtime / primitive configs.
//!
//! Runtimes and primitives are usually authored as YAML rather than
//! source files. The shape maps directly onto [`ToolMeta`]; this module
//! adds required-field validation on top of serde.

use strand_core::ToolMeta;
use strand_error::{ErrorCode, StrandError};

/// Parse a YAML tool config and validate required fields.
///
/// # Errors
///
/// Returns a `PARSING` error for malformed YAML or a missing `tool_type`
/// / `version`.
pub fn parse_tool_yaml(content: &str) -> strand_error::Result<ToolMeta> {
    let meta: ToolMeta = serde_yaml::from_str(content)
        .map_err(|e| StrandError::new(ErrorCode::Parsing, format!("tool config: {e}")))?;

    let mut missing = Vec::new();
    if meta.tool_type.is_empty() {
        missing.push("tool_type");
    }
    if meta.version.is_empty() {
        missing.push("version");
    }
    if !missing.is_empty() {
        return Err(StrandError::new(
            ErrorCode::Parsing,
            format!("tool config is missing required fields: {}", missing.join(", ")),
        )
        .with_detail("missing", missing));
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNTIME: &str = r#"
name: python-runtime
version: 3.1.0
tool_type: runtime
executor_id: core/primitive/subprocess
category: runtime
io:
  requires: [command]
  provides: [source, params_json]
env:
  interpreter: /usr/bin/python3
  vars:
    PYTHONDONTWRITEBYTECODE: "1"
  lib_paths:
    - lib
config:
  command: "${INTERPRETER} {tool_path}"
"#;

    #[test]
    fn parses_runtime_config() {
        let meta = parse_tool_yaml(RUNTIME).unwrap();
        assert_eq!(meta.name, "python-runtime");
        assert_eq!(meta.tool_type, "runtime");
        assert_eq!(
            meta.executor_id.as_ref().unwrap().as_str(),
            "core/primitive/subprocess"
        );
        assert_eq!(meta.io.requires, vec!["command"]);
        assert_eq!(meta.env.interpreter.as_deref(), Some("/usr/bin/python3"));
        assert!(meta.config.contains_key("command"));
    }

    #[test]
    fn primitive_has_null_executor() {
        let meta = parse_tool_yaml("name: subprocess\nversion: 1.0.0\ntool_type: primitive\n")
            .unwrap();
        assert!(meta.is_primitive());
    }

    #[test]
    fn missing_tool_type_is_rejected() {
        let err = parse_tool_yaml("name: x\nversion: 1.0.0\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
        assert!(err.message.contains("tool_type"));
    }

    #[test]
    fn missing_version_is_rejected() {
        let err = parse_tool_yaml("name: x\ntool_type: config\n").unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = parse_tool_yaml("{{nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[test]
    fn anchor_block_parses() {
        let content = "name: multi\nversion: 1.0.0\ntool_type: script\nanchor:\n  mode: always\n  extensions: [py]\n  env_prepend: [PYTHONPATH]\n";
        let meta = parse_tool_yaml(content).unwrap();
        let anchor = meta.anchor.unwrap();
        assert_eq!(anchor.mode, strand_core::AnchorMode::Always);
        assert_eq!(anchor.extensions, vec!["py"]);
    }
}
