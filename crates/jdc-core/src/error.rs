//! Error types for the transfer engine.
//!
//! Errors are grouped into the categories the retry envelope cares about:
//! transport and framing problems are retryable within a chunk, integrity
//! and validation failures are not.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::hash::HashAlgorithm;

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the transfer engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure (connect, read, write, accept)
    #[error("network error during {op}: {source}")]
    Network {
        /// Operation that failed
        op: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Local file failure (open, read, write, preallocate, state I/O)
    #[error("file system error during {op}: {source}")]
    Filesystem {
        /// Operation that failed
        op: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Malformed or unexpected frame content
    #[error("protocol error during {op}: {message}")]
    Protocol {
        /// Operation that failed
        op: &'static str,
        /// What was wrong with the frame
        message: String,
    },

    /// Error frame received from the peer
    #[error("peer reported error: {0}")]
    Remote(String),

    /// Deflate or inflate failure, including decompressed-size mismatch
    #[error("compression error during {op}: {message}")]
    Compression {
        /// Operation that failed
        op: &'static str,
        /// Failure detail
        message: String,
    },

    /// Configuration value out of range
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// Configuration field
        field: &'static str,
        /// Reason for invalidity
        message: String,
    },

    /// End-to-end digest mismatch; the transfer output was discarded
    #[error("hash mismatch ({algorithm})")]
    Integrity {
        /// Algorithm that was negotiated
        algorithm: HashAlgorithm,
    },

    /// Operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative shutdown; partial progress has been persisted
    #[error("transfer cancelled")]
    Cancelled,

    /// Transfer state file could not be serialized or parsed
    #[error("state error: {0}")]
    State(String),

    /// Uncategorized I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error may be retried within the per-chunk envelope.
    ///
    /// Integrity failures, validation failures, and cancellation are final;
    /// transport, framing, and compression failures may be transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Protocol { .. }
                | Self::Compression { .. }
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }

    /// Short category label for log fields.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Filesystem { .. } => "filesystem",
            Self::Protocol { .. } | Self::Remote(_) => "protocol",
            Self::Compression { .. } => "compression",
            Self::Validation { .. } => "validation",
            Self::Integrity { .. } => "integrity",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::State(_) => "state",
            Self::Io(_) => "io",
        }
    }

    /// Build a network error from an I/O failure.
    pub fn network(op: &'static str, source: io::Error) -> Self {
        Self::Network { op, source }
    }

    /// Build a filesystem error from an I/O failure.
    pub fn filesystem(op: &'static str, source: io::Error) -> Self {
        Self::Filesystem { op, source }
    }

    /// Build a protocol error with a description of the bad frame.
    pub fn protocol(op: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            op,
            message: message.into(),
        }
    }

    /// Build a compression error.
    pub fn compression(op: &'static str, message: impl Into<String>) -> Self {
        Self::Compression {
            op,
            message: message.into(),
        }
    }

    /// Build a validation error for a configuration field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::network("read", io::Error::other("boom")).is_retryable());
        assert!(Error::protocol("read_command", "unexpected command").is_retryable());
        assert!(Error::compression("inflate", "truncated stream").is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());

        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::validation("chunk_size", "must be positive").is_retryable());
        assert!(!Error::Integrity {
            algorithm: HashAlgorithm::Md5
        }
        .is_retryable());
    }

    #[test]
    fn test_integrity_display_has_no_digest() {
        let err = Error::Integrity {
            algorithm: HashAlgorithm::Blake2b,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("blake2b"));
        assert!(!rendered.contains('='), "digest values must stay out of display: {rendered}");
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(Error::Cancelled.category(), "cancelled");
        assert_eq!(
            Error::filesystem("write_chunk", io::Error::other("disk full")).category(),
            "filesystem"
        );
    }
}
