// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution-config assembly and templating.
//!
//! The config blocks of each chain element merge root-last (tool
//! overrides runtime), execution context is injected, and string values
//! go through two template passes: `${VAR}` resolves against the
//! resolved environment with shell-safe quoting, then `{param}` resolves
//! against the merged config and parameters. The second pass iterates to
//! a fixed point with a hard bound of three passes; anything still
//! unresolved after that — a reference cycle or a missing key — is a
//! `TEMPLATE_ERROR`.

use crate::chain::Chain;
use crate::env::{ResolvedEnv, substitute};
use std::collections::BTreeMap;
use strand_error::{ErrorCode, StrandError};

/// Bound on `{param}` resolution passes.
const MAX_TEMPLATE_PASSES: usize = 3;

/// Reserved parameter names injected by the runner, never accepted from
/// model-supplied inputs.
pub const RESERVED_PARAMS: [&str; 2] = ["parent_thread_id", "parent_token"];

/// Remove reserved parent-context keys from model-supplied parameters.
#[must_use]
pub fn strip_reserved(mut params: serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    for key in RESERVED_PARAMS {
        params.remove(key);
    }
    params
}

/// Execution context injected into every config.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Absolute path of the root tool file.
    pub tool_path: String,
    /// Project root path.
    pub project_path: String,
    /// Invocation parameters serialized as JSON.
    pub params_json: String,
    /// Activated anchor root, when present.
    pub anchor_path: Option<String>,
}

/// Merge chain configs, inject context, and run both template passes.
///
/// # Errors
///
/// `TEMPLATE_ERROR` naming the keys that failed to stabilize.
pub fn build_exec_config(
    chain: &Chain,
    env: &ResolvedEnv,
    context: &ExecContext,
    params: &serde_json::Map<String, serde_json::Value>,
) -> strand_error::Result<BTreeMap<String, serde_json::Value>> {
    // Primitive-upward merge: the root tool wins.
    let mut config: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for element in chain.elements.iter().rev() {
        for (key, value) in &element.meta.config {
            config.insert(key.clone(), value.clone());
        }
    }

    config.insert("tool_path".into(), context.tool_path.clone().into());
    config.insert("project_path".into(), context.project_path.clone().into());
    config.insert("params_json".into(), context.params_json.clone().into());
    if let Some(anchor) = &context.anchor_path {
        config.insert("anchor_path".into(), anchor.clone().into());
    }

    // Pass 1: ${VAR} against the resolved environment, shell-quoted.
    let env_lookup = |name: &str| env.vars.get(name).cloned().map(|v| shell_quote(&v));
    for value in config.values_mut() {
        if let serde_json::Value::String(s) = value {
            *s = substitute(s, &env_lookup);
        }
    }

    // Pass 2: {param} against parameters and the merged config, iterated
    // to a fixed point.
    let mut scope: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in params {
        scope.insert(key.clone(), scalar_string(value));
    }
    for (key, value) in &config {
        scope.entry(key.clone()).or_insert_with(|| scalar_string(value));
    }

    for _pass in 0..MAX_TEMPLATE_PASSES {
        let mut changed = false;
        for value in config.values_mut() {
            if let serde_json::Value::String(s) = value {
                let next = substitute_params(s, &scope);
                if &next != s {
                    *s = next;
                    changed = true;
                }
            }
        }
        // Keep the scope in sync so chained references resolve.
        for (key, value) in &config {
            scope.insert(key.clone(), scalar_string(value));
        }
        if !changed {
            break;
        }
    }

    let unresolved: Vec<String> = config
        .iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) if has_param_ref(s) => Some(key.clone()),
            _ => None,
        })
        .collect();
    if !unresolved.is_empty() {
        return Err(StrandError::new(
            ErrorCode::TemplateError,
            format!(
                "config did not stabilize after {MAX_TEMPLATE_PASSES} passes: {}",
                unresolved.join(", ")
            ),
        )
        .with_detail("unresolved", unresolved)
        .with_suggestion("break the parameter reference cycle or supply the missing parameter"));
    }

    Ok(config)
}

/// Single-quote a value for safe interpolation into a shell word.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_params(input: &str, scope: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('{') {
        // `${` belongs to pass 1 and passes through untouched.
        if start > 0 && rest.as_bytes()[start - 1] == b'$' {
            out.push_str(&rest[..=start]);
            rest = &rest[start + 1..];
            continue;
        }
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(rest);
            return out;
        };
        let name = &after[..end];
        let is_identifier = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        match (is_identifier, scope.get(name)) {
            (true, Some(value)) => {
                out.push_str(&rest[..start]);
                out.push_str(value);
                rest = &after[end + 1..];
            }
            _ => {
                // Not a resolvable reference; emit the brace literally.
                out.push_str(&rest[..=start]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn has_param_ref(input: &str) -> bool {
    let mut rest = input;
    while let Some(start) = rest.find('{') {
        if start > 0 && rest.as_bytes()[start - 1] == b'$' {
            rest = &rest[start + 1..];
            continue;
        }
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return false;
        };
        let name = &after[..end];
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return true;
        }
        rest = after;
    }
    false
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Workspace;
    use strand_core::ItemId;

    fn context() -> ExecContext {
        ExecContext {
            tool_path: "/tools/fmt.py".into(),
            project_path: "/project".into(),
            params_json: "{}".into(),
            anchor_path: None,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::String((*v).to_string())))
            .collect()
    }

    #[test]
    fn tool_config_overrides_runtime_config() {
        let ws = Workspace::new();
        ws.put_tool(
            "core/primitive/subprocess",
            "name: subprocess\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  timeout_ms: 1000\n  shell: /bin/sh\n",
        );
        ws.put_tool(
            "fmt",
            "name: fmt\nversion: 1.0.0\ntool_type: script\nexecutor_id: core/primitive/subprocess\nconfig:\n  timeout_ms: 5000\n",
        );
        let chain = ws.build(&ItemId::new("fmt").unwrap()).unwrap();
        let config =
            build_exec_config(&chain, &ResolvedEnv::default(), &context(), &params(&[])).unwrap();
        assert_eq!(config["timeout_ms"], 5000);
        assert_eq!(config["shell"], "/bin/sh");
    }

    #[test]
    fn context_fields_are_injected() {
        let ws = Workspace::new();
        ws.put_tool("solo", "name: solo\nversion: 1.0.0\ntool_type: primitive\n");
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let config =
            build_exec_config(&chain, &ResolvedEnv::default(), &context(), &params(&[])).unwrap();
        assert_eq!(config["tool_path"], "/tools/fmt.py");
        assert_eq!(config["project_path"], "/project");
    }

    #[test]
    fn env_pass_shell_quotes() {
        let ws = Workspace::new();
        ws.put_tool(
            "solo",
            "name: solo\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  command: \"${INTERP} {tool_path}\"\n",
        );
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let mut env = ResolvedEnv::default();
        env.vars
            .insert("INTERP".into(), "/usr/bin/env python3".into());
        let config = build_exec_config(&chain, &env, &context(), &params(&[])).unwrap();
        assert_eq!(config["command"], "'/usr/bin/env python3' /tools/fmt.py");
    }

    #[test]
    fn param_pass_resolves_chained_references() {
        let ws = Workspace::new();
        ws.put_tool(
            "solo",
            "name: solo\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  base: \"{target}\"\n  derived: \"{base}/out\"\n",
        );
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let config = build_exec_config(
            &chain,
            &ResolvedEnv::default(),
            &context(),
            &params(&[("target", "/data")]),
        )
        .unwrap();
        assert_eq!(config["base"], "/data");
        assert_eq!(config["derived"], "/data/out");
    }

    #[test]
    fn reference_cycle_is_template_error() {
        let ws = Workspace::new();
        ws.put_tool(
            "solo",
            "name: solo\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  a: \"{b}\"\n  b: \"{a}\"\n",
        );
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let err = build_exec_config(&chain, &ResolvedEnv::default(), &context(), &params(&[]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateError);
    }

    #[test]
    fn missing_param_is_template_error() {
        let ws = Workspace::new();
        ws.put_tool(
            "solo",
            "name: solo\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  command: \"run {nonexistent}\"\n",
        );
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let err = build_exec_config(&chain, &ResolvedEnv::default(), &context(), &params(&[]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateError);
        assert_eq!(err.details.unwrap()["unresolved"][0], "command");
    }

    #[test]
    fn json_braces_are_not_references() {
        let ws = Workspace::new();
        ws.put_tool(
            "solo",
            "name: solo\nversion: 1.0.0\ntool_type: primitive\nconfig:\n  payload: \"{\\\"k\\\": 1}\"\n",
        );
        let chain = ws.build(&ItemId::new("solo").unwrap()).unwrap();
        let config =
            build_exec_config(&chain, &ResolvedEnv::default(), &context(), &params(&[])).unwrap();
        assert_eq!(config["payload"], "{\"k\": 1}");
    }

    #[test]
    fn shell_quote_rules() {
        assert_eq!(shell_quote("plain-word_1.2/x:y"), "plain-word_1.2/x:y");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn strip_reserved_removes_parent_context() {
        let mut params = serde_json::Map::new();
        params.insert("path".into(), "x".into());
        params.insert("parent_thread_id".into(), "sneaky".into());
        params.insert("parent_token".into(), serde_json::json!({"patterns": ["*"]}));
        let cleaned = strip_reserved(params);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned.contains_key("path"));
    }
}
