//! Job-level error taxonomy
//!
//! Recoverable per-file failures (unreadable images, failed embeddings) are
//! logged and suppressed inside the pipeline. The variants here are the
//! job-fatal classes that cross the API boundary. Callers that need to map
//! errors to exit codes can downcast an `anyhow::Error` to `CoreError`.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal error classes surfaced by index and search jobs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The embedding model could not be initialized or called.
    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    /// On-disk snapshot failed its shape check. The store is treated as
    /// empty; the files are preserved for post-mortem.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// The index directory does not exist or cannot be read.
    #[error("store not found: {}", .0.display())]
    StoreNotFound(PathBuf),

    /// Another writer holds the lock for this index directory.
    #[error("index is locked by another writer: {}", .0.display())]
    LockHeld(PathBuf),

    /// The requested ANN backend has no usable snapshot on disk.
    #[error("ann backend unavailable: {0}")]
    AnnUnavailable(String),

    /// A caller-supplied argument was out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The job observed the cancel signal and stopped at a batch boundary.
    #[error("operation cancelled")]
    Cancelled,
}

/// Exit codes for CLI adapters.
///
/// `0` success, `2` invalid argument, `3` store not found, `4` embedder
/// unavailable, `5` interrupted, `130` user SIGINT.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::InvalidArgument(_)) => 2,
        Some(CoreError::StoreNotFound(_)) => 3,
        Some(CoreError::IndexCorrupt(_)) => 3,
        Some(CoreError::EmbedderUnavailable(_)) => 4,
        Some(CoreError::Cancelled) => 5,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = anyhow::Error::new(CoreError::InvalidArgument("bad k".into()));
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::new(CoreError::StoreNotFound(PathBuf::from("/nope")));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::new(CoreError::EmbedderUnavailable("no weights".into()));
        assert_eq!(exit_code(&err), 4);

        let err = anyhow::Error::new(CoreError::Cancelled);
        assert_eq!(exit_code(&err), 5);

        let err = anyhow::anyhow!("some other failure");
        assert_eq!(exit_code(&err), 1);
    }
}
