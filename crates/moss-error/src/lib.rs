#![forbid(unsafe_code)]
//! Error types for mossfs.
//!
//! # Error taxonomy
//!
//! mossfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `moss-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FsError` | `moss-error` (this crate) | User-facing errors for every engine operation |
//!
//! `moss-error` is intentionally independent of `moss-types` to avoid cyclic
//! dependencies. `ParseError` is converted into `FsError::Corrupt` at the
//! crate boundary that knows the failing block (`moss-mdlog`, `moss-ctz`).
//!
//! Propagation policy: every operation returns the first error encountered
//! and leaves on-disk state exactly as it was before the operation's commit
//! point. Nothing is retried internally; retry is a caller concern. Callers
//! must treat any returned error as "the operation did not take effect",
//! except where documented otherwise (partial reads are not an error).

use thiserror::Error;

/// Unified error type for all mossfs operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Block device callback failure (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk corruption detected at a known block: a CRC mismatch, an
    /// unparseable metadata log, or an unreadable superblock during traversal.
    #[error("corrupt filesystem at block {block}: {detail}")]
    Corrupt { block: u32, detail: String },

    /// No free block exists anywhere on the device.
    #[error("no space left on device")]
    NoSpace,

    /// Path resolution miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create on an existing name.
    #[error("already exists: {0}")]
    Exists(String),

    /// Remove on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// A path component that must be a directory is not one.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Mount-time version or geometry mismatch: the on-disk format is newer
    /// than this build supports, or the caller's geometry does not match the
    /// formatted device.
    #[error("incompatible filesystem: {0}")]
    Incompatible(String),

    /// Malformed path or out-of-range parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A path segment exceeds the name length limit.
    #[error("name too long")]
    NameTooLong,
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Helper for device implementations reporting a simulated or real
    /// hardware fault without an underlying OS error.
    #[must_use]
    pub fn io(detail: &str) -> Self {
        Self::Io(std::io::Error::other(detail.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let corrupt = FsError::Corrupt {
            block: 42,
            detail: "commit crc mismatch".into(),
        };
        assert_eq!(
            corrupt.to_string(),
            "corrupt filesystem at block 42: commit crc mismatch"
        );

        assert_eq!(FsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            FsError::NotFound("/a/b".into()).to_string(),
            "not found: /a/b"
        );
        assert_eq!(FsError::NotEmpty.to_string(), "directory not empty");
        assert_eq!(
            FsError::Incompatible("on-disk version 2.0, supported 1.0".into()).to_string(),
            "incompatible filesystem: on-disk version 2.0, supported 1.0"
        );
    }

    #[test]
    fn io_helper_wraps_detail() {
        let err = FsError::io("simulated power loss");
        assert!(matches!(err, FsError::Io(_)));
        assert!(err.to_string().contains("simulated power loss"));
    }
}
