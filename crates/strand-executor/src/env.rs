// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment resolution for a chain.
//!
//! Walks the chain from the primitive upward, merging each element's
//! declared environment (interpreter, static vars with `${VAR:-default}`
//! substitution, library paths), then layers anchor mutations on top.

use crate::anchor::AnchorContext;
use crate::chain::Chain;
use std::collections::BTreeMap;

/// The fully resolved execution environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedEnv {
    /// Interpreter chosen by the nearest element that declares one.
    pub interpreter: Option<String>,
    /// Merged environment variables.
    pub vars: BTreeMap<String, String>,
    /// Merged library paths, primitive-first.
    pub lib_paths: Vec<String>,
}

/// Resolve the environment for `chain`, optionally layering an activated
/// anchor's path mutations.
///
/// Merge direction is primitive-upward: elements closer to the root
/// override what their executors declared.
#[must_use]
pub fn resolve_env(
    chain: &Chain,
    anchor: Option<&AnchorContext>,
    process_env: &dyn Fn(&str) -> Option<String>,
) -> ResolvedEnv {
    let mut env = ResolvedEnv::default();

    for element in chain.elements.iter().rev() {
        let declared = &element.meta.env;
        if let Some(interp) = &declared.interpreter {
            env.interpreter = Some(substitute(interp, process_env));
        }
        for (key, value) in &declared.vars {
            env.vars.insert(key.clone(), substitute(value, process_env));
        }
        for path in &declared.lib_paths {
            let resolved = substitute(path, process_env);
            if !env.lib_paths.contains(&resolved) {
                env.lib_paths.push(resolved);
            }
        }
    }

    if let Some(anchor) = anchor {
        let root = anchor.root.to_string_lossy().into_owned();
        for var in &anchor.env_prepend {
            let existing = env.vars.get(var).cloned().or_else(|| process_env(var));
            let merged = match existing {
                Some(existing) if !existing.is_empty() => format!("{root}:{existing}"),
                _ => root.clone(),
            };
            env.vars.insert(var.clone(), merged);
        }
    }

    env
}

/// Substitute `${VAR}` and `${VAR:-default}` against the process
/// environment. Unknown variables without a default resolve to empty.
#[must_use]
pub fn substitute(input: &str, process_env: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference passes through literally.
            out.push_str(&rest[start..]);
            return out;
        };
        let inner = &after[..end];
        let (name, default) = match inner.split_once(":-") {
            Some((n, d)) => (n, Some(d)),
            None => (inner, None),
        };
        match process_env(name) {
            Some(value) if !value.is_empty() => out.push_str(&value),
            _ => out.push_str(default.unwrap_or("")),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
