//! Error types for Cumulus
//!
//! Provides a unified error type for all Cumulus operations.

use thiserror::Error;

/// Result type alias for Cumulus operations
pub type Result<T> = std::result::Result<T, CumulusError>;

/// Unified error type for Cumulus
#[derive(Error, Debug)]
pub enum CumulusError {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shares: have {available}, need {required}")]
    InsufficientShares { available: usize, required: usize },

    #[error("Share size mismatch: expected {expected}, got {actual}")]
    ShareSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid segment number: {segment_num} (max: {max})")]
    InvalidSegmentNum { segment_num: u8, max: usize },

    #[error("Duplicate segment number: {0}")]
    DuplicateSegmentNum(u8),

    // ===== Integrity Errors =====
    #[error("Size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("MD5 mismatch: {0}")]
    Md5Mismatch(String),

    #[error("Adler32 mismatch: declared {declared}, actual {actual}")]
    Adler32Mismatch { declared: u32, actual: u32 },

    // ===== Segment State Errors =====
    #[error("Segment already active: {0}")]
    DuplicateSegment(String),

    #[error("Segment not active: {0}")]
    SegmentNotActive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    #[error("Halted")]
    Halted,

    // ===== Coordinator Errors =====
    #[error("Archive failed: {0}")]
    ArchiveFailed(String),

    #[error("Retrieve failed: {0}")]
    RetrieveFailed(String),

    #[error("Quorum not met: {achieved}/{required}")]
    QuorumNotMet { achieved: usize, required: usize },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CumulusError {
    /// Errors that describe bad data on ingest rather than a broken node.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CumulusError::SizeMismatch { .. }
                | CumulusError::Md5Mismatch(_)
                | CumulusError::Adler32Mismatch { .. }
        )
    }
}

impl From<reed_solomon_erasure::Error> for CumulusError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        CumulusError::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for CumulusError {
    fn from(err: bincode::Error) -> Self {
        CumulusError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CumulusError {
    fn from(err: serde_json::Error) -> Self {
        CumulusError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CumulusError::InsufficientShares {
            available: 7,
            required: 8,
        };
        assert_eq!(err.to_string(), "Insufficient shares: have 7, need 8");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CumulusError = io_err.into();
        assert!(matches!(err, CumulusError::Io(_)));
    }

    #[test]
    fn test_integrity_classification() {
        assert!(CumulusError::SizeMismatch {
            declared: 10,
            actual: 9
        }
        .is_integrity());
        assert!(!CumulusError::Halted.is_integrity());
    }
}
