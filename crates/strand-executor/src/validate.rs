// SPDX-License-Identifier: MIT OR Apache-2.0
//! Adjacent-pair chain validation.
//!
//! Three rules hold between every dependent element and its executor:
//! space precedence (a dependency must live in the same or
//! lower-precedence space — a project tool may run on a system runtime,
//! never the reverse), I/O contract compatibility (the dependent's
//! required inputs must be provided by the executor), and any declared
//! semver constraint on the executor's version.

use crate::chain::Chain;
use semver::{Version, VersionReq};
use strand_error::{ErrorCode, StrandError};

/// Validate every adjacent pair of `chain`.
///
/// # Errors
///
/// `SPACE_VIOLATION`, `IO_INCOMPATIBILITY`, or `VERSION_MISMATCH` naming
/// the offending pair; `PARSING` when a declared version or constraint is
/// not valid semver.
pub fn validate_chain(chain: &Chain) -> strand_error::Result<()> {
    for pair in chain.elements.windows(2) {
        let (dependent, executor) = (&pair[0], &pair[1]);

        if executor.resolved.space.precedence() > dependent.resolved.space.precedence() {
            return Err(StrandError::new(
                ErrorCode::SpaceViolation,
                format!(
                    "{} ({}) depends on {} ({}), which outranks it",
                    dependent.item_id,
                    dependent.resolved.space,
                    executor.item_id,
                    executor.resolved.space
                ),
            )
            .with_detail("dependent", dependent.item_id.as_str())
            .with_detail("dependent_space", dependent.resolved.space.to_string())
            .with_detail("executor", executor.item_id.as_str())
            .with_detail("executor_space", executor.resolved.space.to_string())
            .with_suggestion("move the dependency to the same or a lower-precedence space"));
        }

        let missing = dependent.meta.io.missing_from(&executor.meta.io);
        if !missing.is_empty() {
            return Err(StrandError::new(
                ErrorCode::IoIncompatibility,
                format!(
                    "{} requires inputs {} does not provide",
                    dependent.item_id, executor.item_id
                ),
            )
            .with_detail("dependent", dependent.item_id.as_str())
            .with_detail("executor", executor.item_id.as_str())
            .with_detail("missing", missing));
        }

        if let Some(constraint) = &dependent.meta.executor_version {
            let req = VersionReq::parse(constraint).map_err(|e| {
                StrandError::new(
                    ErrorCode::Parsing,
                    format!(
                        "{} declares executor_version {constraint:?}: {e}",
                        dependent.item_id
                    ),
                )
            })?;
            let version = Version::parse(&executor.meta.version).map_err(|e| {
                StrandError::new(
                    ErrorCode::Parsing,
                    format!(
                        "{} declares version {:?}: {e}",
                        executor.item_id, executor.meta.version
                    ),
                )
            })?;
            if !req.matches(&version) {
                return Err(StrandError::new(
                    ErrorCode::VersionMismatch,
                    format!(
                        "{} requires executor version {constraint}, {} is {}",
                        dependent.item_id, executor.item_id, executor.meta.version
                    ),
                )
                .with_detail("constraint", constraint)
                .with_detail("actual_version", &executor.meta.version));
            }
        }
    }
    Ok(())
}
