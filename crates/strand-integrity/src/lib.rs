// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Integrity substrate for Strand.
//!
//! Items are signed with Ed25519 over the SHA-256 of their normalized
//! content. The signature is embedded as a single fixed-format line at the
//! end of the file; verification re-derives the hash from the stripped
//! content and checks the signature against a public key looked up in the
//! trust store by fingerprint.
//!
//! Policy is **fail-closed**: only [`Verdict::Trusted`] allows execution.
//! `unsigned` is rejected except for system items covered by an explicitly
//! registered bootstrap allowance.

/// Bundle manifest verification.
pub mod bundle;
/// Verification result cache keyed by `(realpath, content_hash)`.
pub mod cache;
/// Key generation, storage, and fingerprints.
pub mod keys;
/// Trust store: fingerprint → verifying key, with space precedence.
pub mod trust;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer as _, Verifier as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strand_core::{SIGNATURE_MARKER, sha256_hex};
use strand_error::{ErrorCode, StrandError};

pub use bundle::{BundleItem, BundleManifest, verify_bundle};
pub use cache::VerifyCache;
pub use keys::{KeyPair, fingerprint_of};
pub use trust::TrustStore;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of verifying a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Signature verifies and the fingerprint is in the trust store.
    Trusted {
        /// Fingerprint that signed the item.
        fingerprint: String,
    },
    /// No signature line present.
    Unsigned,
    /// Signature parses and the hash matches, but the fingerprint is not
    /// in the trust store.
    Untrusted {
        /// The unknown fingerprint.
        fingerprint: String,
    },
    /// Malformed signature line, hash mismatch, or bad signature.
    Tampered {
        /// Which check failed.
        reason: String,
    },
}

impl Verdict {
    /// Fail-closed execution gate: only `Trusted` passes.
    #[must_use]
    pub fn allows_execution(&self) -> bool {
        matches!(self, Self::Trusted { .. })
    }

    /// Map a non-trusted verdict to its public error.
    #[must_use]
    pub fn to_error(&self, path: &Path) -> Option<StrandError> {
        let path_str = path.display().to_string();
        match self {
            Self::Trusted { .. } => None,
            Self::Unsigned => Some(
                StrandError::new(ErrorCode::Unsigned, format!("{path_str} is not signed"))
                    .with_detail("path", &path_str)
                    .with_suggestion("sign the item before executing it"),
            ),
            Self::Untrusted { fingerprint } => Some(
                StrandError::new(
                    ErrorCode::Untrusted,
                    format!("{path_str} is signed by an unknown key"),
                )
                .with_detail("path", &path_str)
                .with_detail("fingerprint", fingerprint),
            ),
            Self::Tampered { reason } => Some(
                StrandError::new(
                    ErrorCode::Tampered,
                    format!("{path_str} failed verification: {reason}"),
                )
                .with_detail("path", &path_str)
                .with_detail("reason", reason),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Signature line
// ---------------------------------------------------------------------------

/// Parsed form of an embedded signature line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureLine {
    /// ISO-8601 UTC timestamp of signing.
    pub timestamp: String,
    /// Hex SHA-256 of the normalized content.
    pub content_hash: String,
    /// Base64 Ed25519 signature over the hash bytes.
    pub signature: String,
    /// Hex key fingerprint, optionally `|registry@{user}` suffixed.
    pub fingerprint: String,
}

impl SignatureLine {
    /// Render the line in its fixed column layout (without any comment
    /// prefix).
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{SIGNATURE_MARKER}:{}:{}:{}:{}",
            self.timestamp, self.content_hash, self.signature, self.fingerprint
        )
    }

    /// Parse a line previously produced by [`render`](Self::render).
    ///
    /// The timestamp itself contains colons, so the trailing three fields
    /// are split off from the right.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let rest = strip_comment_prefix(line).strip_prefix(SIGNATURE_MARKER)?;
        let rest = rest.strip_prefix(':')?;
        let mut parts = rest.rsplitn(4, ':');
        let fingerprint = parts.next()?.to_string();
        let signature = parts.next()?.to_string();
        let content_hash = parts.next()?.to_string();
        let timestamp = parts.next()?.to_string();
        if timestamp.is_empty() || content_hash.is_empty() || signature.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            content_hash,
            signature,
            fingerprint,
        })
    }

    /// Fingerprint parts: the base fingerprint plus any registry
    /// provenance parts appended by a re-signing authority.
    pub fn fingerprint_parts(&self) -> impl Iterator<Item = &str> {
        self.fingerprint.split('|')
    }
}

/// Strip a leading `# ` or `// ` comment marker, as used for signature
/// lines in YAML / script / source files.
fn strip_comment_prefix(line: &str) -> &str {
    let trimmed = line.trim_start();
    trimmed
        .strip_prefix("# ")
        .or_else(|| trimmed.strip_prefix("#"))
        .or_else(|| trimmed.strip_prefix("// "))
        .or_else(|| trimmed.strip_prefix("//"))
        .unwrap_or(trimmed)
        .trim_start()
}

/// Comment prefix for a signature line embedded in a file with the given
/// suffix. Markdown takes the line raw; YAML and scripts take `# `;
/// JS/TS take `// `.
#[must_use]
pub fn comment_prefix_for(suffix: &str) -> &'static str {
    match suffix {
        "yaml" | "yml" | "py" | "sh" => "# ",
        "js" | "ts" => "// ",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize content for hashing: drop any signature line, normalize CRLF
/// to LF, strip trailing whitespace per line, end with a single newline.
#[must_use]
pub fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.replace("\r\n", "\n").lines() {
        if SignatureLine::parse(line).is_some() {
            continue;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    // Collapse trailing blank lines to exactly one newline.
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

/// Locate an embedded signature line, searching from the end.
#[must_use]
pub fn find_signature(content: &str) -> Option<SignatureLine> {
    content.lines().rev().find_map(SignatureLine::parse)
}

/// Hash of the normalized content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    sha256_hex(normalize(content).as_bytes())
}

// ---------------------------------------------------------------------------
// Sign / verify
// ---------------------------------------------------------------------------

/// Sign `content`, returning the content with an embedded signature line.
///
/// Any existing signature line is replaced. `suffix` selects the comment
/// prefix the line is embedded behind.
#[must_use]
pub fn sign_content(content: &str, key: &KeyPair, suffix: &str) -> String {
    let normalized = normalize(content);
    let hash = sha256_hex(normalized.as_bytes());
    let signature = key.signing.sign(hash.as_bytes());
    let line = SignatureLine {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        content_hash: hash,
        signature: BASE64.encode(signature.to_bytes()),
        fingerprint: key.fingerprint.clone(),
    };
    format!("{normalized}{}{}\n", comment_prefix_for(suffix), line.render())
}

/// Sign a file in place.
///
/// # Errors
///
/// Returns a `FILE_SYSTEM` error when the file cannot be read or written.
pub fn sign_file(path: &Path, key: &KeyPair) -> strand_error::Result<SignatureLine> {
    let content = std::fs::read_to_string(path)?;
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let signed = sign_content(&content, key, suffix);
    let line = find_signature(&signed).ok_or_else(|| {
        StrandError::new(ErrorCode::Unknown, "signature line missing after signing")
    })?;
    std::fs::write(path, signed)?;
    Ok(line)
}

/// Verify in-memory content against the trust store.
///
/// Pure over `(content, store)`; never touches the filesystem.
#[must_use]
pub fn verify_content(content: &str, store: &TrustStore) -> Verdict {
    let Some(line) = find_signature(content) else {
        return Verdict::Unsigned;
    };

    let normalized = normalize(content);
    let actual_hash = sha256_hex(normalized.as_bytes());
    if actual_hash != line.content_hash {
        return Verdict::Tampered {
            reason: format!(
                "content hash mismatch: expected {}, computed {actual_hash}",
                line.content_hash
            ),
        };
    }

    let Ok(sig_bytes) = BASE64.decode(&line.signature) else {
        return Verdict::Tampered {
            reason: "signature is not valid base64".into(),
        };
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return Verdict::Tampered {
            reason: "signature has wrong length".into(),
        };
    };

    // Registry re-signing appends `|registry@{user}`; every part must
    // resolve in the trust store, and the first part is the signing key.
    let mut keys = Vec::new();
    for part in line.fingerprint_parts() {
        match store.lookup(part) {
            Some(key) => keys.push(key),
            None => {
                return Verdict::Untrusted {
                    fingerprint: part.to_string(),
                };
            }
        }
    }
    let Some(signing_key) = keys.first() else {
        return Verdict::Tampered {
            reason: "empty fingerprint".into(),
        };
    };

    match signing_key.verify(line.content_hash.as_bytes(), &signature) {
        Ok(()) => Verdict::Trusted {
            fingerprint: line.fingerprint.clone(),
        },
        Err(_) => Verdict::Tampered {
            reason: "signature does not verify".into(),
        },
    }
}

/// Verify a file on disk, consulting and populating `cache`.
///
/// The cache key is `(realpath, content_hash)`, so edits invalidate
/// naturally.
///
/// # Errors
///
/// Returns a `FILE_SYSTEM` error when the file cannot be read.
pub fn verify_file(
    path: &Path,
    store: &TrustStore,
    cache: &VerifyCache,
) -> strand_error::Result<Verdict> {
    let real = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let content = std::fs::read_to_string(&real)?;
    let hash = content_hash(&content);

    if let Some(hit) = cache.get(&real, &hash) {
        return Ok(hit);
    }

    let mut verdict = verify_content(&content, store);

    // Bootstrap allowance: unsigned system items under an explicitly
    // registered root are tolerated.
    if verdict == Verdict::Unsigned && store.unsigned_allowed(&real) {
        tracing::warn!(
            target: "strand.integrity",
            path = %real.display(),
            "allowing unsigned item under bootstrap root"
        );
        verdict = Verdict::Trusted {
            fingerprint: "bootstrap".into(),
        };
    }

    cache.insert(real, hash, verdict.clone());
    Ok(verdict)
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> KeyPair {
        KeyPair::generate()
    }

    fn store_with(key: &KeyPair) -> TrustStore {
        let mut store = TrustStore::new();
        store.insert(key.fingerprint.clone(), key.signing.verifying_key());
        store
    }

    // ---- normalization ----------------------------------------------------

    #[test]
    fn normalize_strips_trailing_whitespace_and_crlf() {
        let content = "line one   \r\nline two\t\r\n";
        assert_eq!(normalize(content), "line one\nline two\n");
    }

    #[test]
    fn normalize_drops_signature_lines() {
        let key = keypair();
        let signed = sign_content("body\n", &key, "md");
        assert_eq!(normalize(&signed), "body\n");
    }

    #[test]
    fn normalize_is_idempotent() {
        let content = "a  \n\nb\n\n\n";
        let once = normalize(content);
        assert_eq!(normalize(&once), once);
    }

    // ---- signature line codec ---------------------------------------------

    #[test]
    fn signature_line_roundtrip() {
        let line = SignatureLine {
            timestamp: "2026-08-01T10:00:00Z".into(),
            content_hash: "ab12".into(),
            signature: "c2ln".into(),
            fingerprint: "deadbeef".into(),
        };
        let rendered = line.render();
        assert!(rendered.starts_with("strand-sig-v1:2026-08-01T10:00:00Z:"));
        assert_eq!(SignatureLine::parse(&rendered).unwrap(), line);
    }

    #[test]
    fn signature_line_parses_behind_comment_prefixes() {
        let line = SignatureLine {
            timestamp: "2026-08-01T10:00:00Z".into(),
            content_hash: "ab".into(),
            signature: "cd".into(),
            fingerprint: "ef".into(),
        };
        for prefix in ["# ", "// ", ""] {
            let text = format!("{prefix}{}", line.render());
            assert_eq!(SignatureLine::parse(&text).unwrap(), line, "prefix {prefix:?}");
        }
    }

    #[test]
    fn compound_fingerprint_splits() {
        let line = SignatureLine {
            timestamp: "t".into(),
            content_hash: "h".into(),
            signature: "s".into(),
            fingerprint: "abcd|registry@alice".into(),
        };
        let parts: Vec<_> = line.fingerprint_parts().collect();
        assert_eq!(parts, vec!["abcd", "registry@alice"]);
    }

    #[test]
    fn malformed_lines_do_not_parse() {
        assert!(SignatureLine::parse("not a signature").is_none());
        assert!(SignatureLine::parse("strand-sig-v1:").is_none());
        assert!(SignatureLine::parse("strand-sig-v1:t:h").is_none());
    }

    // ---- sign / verify ----------------------------------------------------

    #[test]
    fn sign_then_verify_is_trusted() {
        let key = keypair();
        let store = store_with(&key);
        let signed = sign_content("# Directive\n\nbody text\n", &key, "md");
        let verdict = verify_content(&signed, &store);
        assert!(verdict.allows_execution(), "{verdict:?}");
    }

    #[test]
    fn verify_unsigned() {
        let store = TrustStore::new();
        assert_eq!(verify_content("plain body\n", &store), Verdict::Unsigned);
    }

    #[test]
    fn content_perturbation_is_tampered() {
        let key = keypair();
        let store = store_with(&key);
        let signed = sign_content("body text\n", &key, "md");
        let tampered = signed.replace("body", "bodY");
        assert!(matches!(
            verify_content(&tampered, &store),
            Verdict::Tampered { .. }
        ));
    }

    #[test]
    fn signature_perturbation_is_tampered() {
        let key = keypair();
        let store = store_with(&key);
        let signed = sign_content("body text\n", &key, "md");
        // Flip a character inside the base64 signature field.
        let line = find_signature(&signed).unwrap();
        let flipped = {
            let mut sig = line.signature.clone().into_bytes();
            sig[0] = if sig[0] == b'A' { b'B' } else { b'A' };
            String::from_utf8(sig).unwrap()
        };
        let tampered = signed.replace(&line.signature, &flipped);
        assert!(matches!(
            verify_content(&tampered, &store),
            Verdict::Tampered { .. }
        ));
    }

    #[test]
    fn unknown_fingerprint_is_untrusted() {
        let key = keypair();
        let empty_store = TrustStore::new();
        let signed = sign_content("body\n", &key, "md");
        assert!(matches!(
            verify_content(&signed, &empty_store),
            Verdict::Untrusted { .. }
        ));
    }

    #[test]
    fn stripping_signature_is_unsigned() {
        let key = keypair();
        let store = store_with(&key);
        let signed = sign_content("body\n", &key, "md");
        let stripped = normalize(&signed);
        assert_eq!(verify_content(&stripped, &store), Verdict::Unsigned);
    }

    #[test]
    fn re_signing_replaces_existing_line() {
        let key = keypair();
        let other = keypair();
        let store = store_with(&other);
        let signed_once = sign_content("body\n", &key, "md");
        let signed_twice = sign_content(&signed_once, &other, "md");
        assert_eq!(
            signed_twice.matches(SIGNATURE_MARKER).count(),
            1,
            "exactly one signature line"
        );
        assert!(verify_content(&signed_twice, &store).allows_execution());
    }

    #[test]
    fn yaml_signature_is_a_comment() {
        let key = keypair();
        let signed = sign_content("name: demo\n", &key, "yaml");
        let last = signed.lines().last().unwrap();
        assert!(last.starts_with("# strand-sig-v1:"));
        // The signed YAML must still parse.
        let parsed: serde_yaml::Value = serde_yaml::from_str(&signed).unwrap();
        assert_eq!(parsed["name"], serde_yaml::Value::from("demo"));
    }

    #[test]
    fn verification_is_idempotent() {
        let key = keypair();
        let store = store_with(&key);
        let signed = sign_content("body\n", &key, "md");
        let first = verify_content(&signed, &store);
        let second = verify_content(&signed, &store);
        assert_eq!(first, second);
    }

    // ---- file-level + cache -----------------------------------------------

    #[test]
    fn verify_file_caches_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("item.md");
        let key = keypair();
        std::fs::write(&path, "body\n").unwrap();
        sign_file(&path, &key).unwrap();

        let store = store_with(&key);
        let cache = VerifyCache::new();
        let v1 = verify_file(&path, &store, &cache).unwrap();
        assert!(v1.allows_execution());
        assert_eq!(cache.len(), 1);

        // Unchanged file: same verdict, still one entry.
        let v2 = verify_file(&path, &store, &cache).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(cache.len(), 1);

        // Edit without re-signing: new hash key, tampered verdict.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content = content.replace("body", "edited body");
        std::fs::write(&path, content).unwrap();
        let v3 = verify_file(&path, &store, &cache).unwrap();
        assert!(matches!(v3, Verdict::Tampered { .. }));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn bootstrap_root_allows_unsigned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system_tool.yaml");
        std::fs::write(&path, "tool_type: config\n").unwrap();

        let mut store = TrustStore::new();
        store.allow_unsigned_bootstrap(dir.path());
        let cache = VerifyCache::new();
        let verdict = verify_file(&path, &store, &cache).unwrap();
        assert!(verdict.allows_execution());
    }

    #[test]
    fn verdict_errors_carry_codes() {
        let path = Path::new("/tmp/item.md");
        let unsigned = Verdict::Unsigned.to_error(path).unwrap();
        assert_eq!(unsigned.code, ErrorCode::Unsigned);
        let tampered = Verdict::Tampered {
            reason: "hash mismatch".into(),
        }
        .to_error(path)
        .unwrap();
        assert_eq!(tampered.code, ErrorCode::Tampered);
        assert!(
            Verdict::Trusted {
                fingerprint: "fp".into()
            }
            .to_error(path)
            .is_none()
        );
    }
}
