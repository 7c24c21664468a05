#![forbid(unsafe_code)]
//! Error types for the cinderfs extent engine.
//!
//! # Error Taxonomy
//!
//! The engine distinguishes four classes of failure:
//!
//! | Class | Type | Handling |
//! |-------|------|----------|
//! | Capacity exhaustion | `EngineError::NoSpace` | Returned to the caller after the remediation ladder is exhausted; user-visible |
//! | Lookup miss | `EngineError::NotFound` / `Option::None` | Expected control flow, never logged as an error |
//! | Structural invariant violation | [`structural_violation`] | Fatal; the engine aborts rather than continue with inconsistent accounting |
//! | Transient contention | (internal) | Retried/yielded inside the engine, never surfaced |
//!
//! Parse failures (`ParseError` in `cfs-types`) convert into
//! `EngineError::Parse` or `EngineError::Corruption` at crate boundaries;
//! this crate stays independent of `cfs-types` to avoid cycles.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`EngineError::to_errno`].
//! The match is exhaustive so adding a variant without an errno is a compile
//! error.

use thiserror::Error;

/// Unified error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No allocation headroom left after exhausting remediation.
    #[error("no space left on device")]
    NoSpace,

    /// A named record or range was not found.
    ///
    /// This is an expected control-flow signal (e.g. "no matching backref
    /// yet" before an insert), not a defect.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insertion collided with an existing record or range.
    #[error("already exists")]
    Exists,

    /// The target is read-only and a mutation was attempted.
    #[error("read-only")]
    ReadOnly,

    /// Persistent metadata is inconsistent at a known address.
    #[error("corrupt metadata at bytenr {bytenr}: {detail}")]
    Corruption { bytenr: u64, detail: String },

    /// A persisted record failed to decode.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configured or discovered geometry is numerically invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl EngineError {
    /// Convert this error into a POSIX errno for outer surfaces.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::Corruption { .. } => libc::EIO,
            Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Abort on a structural invariant violation.
///
/// Refcount underflow, a missing backref for an extent believed to exist, or
/// overlapping block groups mean the accounting is already inconsistent;
/// continuing risks double-allocating live data, so there is no recovery
/// path. Logs at `error!` before panicking so the violation reaches the
/// structured log even when the panic message is swallowed.
pub fn structural_violation(detail: &str) -> ! {
    tracing::error!(target: "cfs::invariant", detail, "structural_invariant_violation");
    panic!("structural invariant violation: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(EngineError, libc::c_int)> = vec![
            (EngineError::NoSpace, libc::ENOSPC),
            (EngineError::NotFound("extent 4096".into()), libc::ENOENT),
            (EngineError::Exists, libc::EEXIST),
            (EngineError::ReadOnly, libc::EROFS),
            (
                EngineError::Corruption {
                    bytenr: 4096,
                    detail: "refcount mismatch".into(),
                },
                libc::EIO,
            ),
            (EngineError::Parse("truncated extent item".into()), libc::EINVAL),
            (
                EngineError::InvalidGeometry("chunk_size=0".into()),
                libc::EINVAL,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let err = EngineError::Corruption {
            bytenr: 65536,
            detail: "backref count underflow".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at bytenr 65536: backref count underflow"
        );
        assert_eq!(EngineError::NoSpace.to_string(), "no space left on device");
    }

    #[test]
    #[should_panic(expected = "structural invariant violation")]
    fn structural_violation_panics() {
        structural_violation("test underflow");
    }
}
