//! Cumulus Core Library
//!
//! Core abstractions shared by every Cumulus storage node.
//! This crate provides:
//! - Reed-Solomon segmenter (8 of 10 shares reconstruct a block)
//! - Share and file checksums (Adler-32 + MD5)
//! - Catalog record types for segments, sequences, value files and conjoined uploads
//! - Common error handling

pub mod checksum;
pub mod error;
pub mod model;
pub mod segmenter;

pub use checksum::{FileChecksum, Md5Digest, ShareChecksum};
pub use error::{CumulusError, Result};
pub use model::{
    CollectionId, ConjoinedRow, SegmentKey, SegmentRow, SegmentSequence, SegmentStatus,
    UnifiedId, UnifiedIdFactory, ValueFileRow,
};
pub use segmenter::{split_blocks, Segmenter};

/// Default erasure coding configuration
/// - 8 shares are the minimum required to reconstruct (K)
/// - 10 shares are produced, one per node (N)
/// - any 2 nodes may be missing
pub const MIN_SEGMENTS: usize = 8;
pub const NUM_SEGMENTS: usize = 10;

/// Size of the unencoded blocks files are cut into
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Value files roll over once the next write would exceed this size
pub const DEFAULT_MAX_VALUE_FILE_SIZE: u64 = 1024 * 1024 * 1024;
