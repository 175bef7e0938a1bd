use std::path::PathBuf;

use thiserror::Error;

/// Errors a [ChunkStore](crate::ChunkStore) operation can fail with.
///
/// Callers that need to react to a specific failure (a download engine
/// skipping missing LOBs, fsck deleting broken ones) match on the
/// variant; everything else just bubbles the error up as
/// `anyhow::Error` and recovers the variant with `downcast_ref` where
/// needed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The LOB, or one of its files, does not exist at the queried
    /// location.
    #[error("LOB {sha} not found - missing {path:?}")]
    NotFound { sha: String, path: PathBuf },

    /// A chunk file exists but holds the wrong number of bytes. The
    /// damage is limited to this one file.
    #[error("chunk file {path:?} has wrong size - expected {expected}, got {actual}")]
    WrongSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The stored files violate the metadata invariants: the record is
    /// malformed, or the chunk contents no longer hash to the declared
    /// hash.
    #[error("LOB {sha} failed integrity check - {reason}")]
    Integrity { sha: String, reason: String },

    #[error("store I/O error on {path:?} - {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            err,
        }
    }

    /// True for the variants that mean "the data on disk is bad", as
    /// opposed to merely absent.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::WrongSize { .. } | StoreError::Integrity { .. })
    }
}
