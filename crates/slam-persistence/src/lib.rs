//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Persistence abstractions and storage bindings."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Envelope format for persisted node state and staged file replacement.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing blobs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for CBOR encoding or decoding issues.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// The data does not start with the blob marker.
    #[error("not a state blob (bad magic)")]
    BadMagic,
    /// The data ends before the envelope is complete.
    #[error("state blob is truncated")]
    Truncated,
    /// The blob was written by an incompatible format revision.
    #[error("state blob version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version recorded in the blob.
        found: u16,
        /// Version this build reads and writes.
        expected: u16,
    },
    /// Reported when the payload fails integrity verification.
    #[error("state blob hash mismatch")]
    HashMismatch,
}

pub mod blob;
pub mod staging;

pub use blob::{read_blob, write_blob, BlobInfo, BLOB_MAGIC, BLOB_VERSION};
pub use staging::{replace_file, staging_path, StagedWriteError, STAGING_SUFFIX};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let err = PersistenceError::VersionMismatch {
            found: 7,
            expected: BLOB_VERSION,
        };
        assert_eq!(
            format!("{err}"),
            format!("state blob version 7 is not supported (expected {BLOB_VERSION})")
        );
    }
}
