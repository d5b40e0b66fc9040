//! Catalog records shared by the write, read and handoff paths

use crate::checksum::Md5Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub type CollectionId = u32;
pub type UnifiedId = u64;

/// Identifies one node's share of one file version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub unified_id: UnifiedId,
    pub conjoined_part: u32,
    pub segment_num: u8,
}

impl SegmentKey {
    pub fn new(unified_id: UnifiedId, conjoined_part: u32, segment_num: u8) -> Self {
        Self {
            unified_id,
            conjoined_part,
            segment_num,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.unified_id, self.conjoined_part, self.segment_num
        )
    }
}

/// Segment lifecycle
///
/// `Active` moves to `Final` or `Cancelled`. `Tombstone` is written directly.
/// Every state but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentStatus {
    Active,
    Cancelled,
    Final,
    Tombstone,
}

impl SegmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SegmentStatus::Active)
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentStatus::Active => write!(f, "active"),
            SegmentStatus::Cancelled => write!(f, "cancelled"),
            SegmentStatus::Final => write!(f, "final"),
            SegmentStatus::Tombstone => write!(f, "tombstone"),
        }
    }
}

/// One row of the segment table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub id: u64,
    pub collection_id: CollectionId,
    pub key: String,
    pub status: SegmentStatus,
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    pub segment_num: u8,
    pub conjoined_part: u32,
    pub file_size: u64,
    pub file_adler32: Option<u32>,
    pub file_md5: Option<Md5Digest>,
    pub file_tombstone_unified_id: Option<UnifiedId>,
    pub source_node_name: String,
    pub handoff_node_name: Option<String>,
}

impl SegmentRow {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.unified_id, self.conjoined_part, self.segment_num)
    }
}

/// One contiguous run of a segment's share, as written to a value file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSequence {
    pub collection_id: CollectionId,
    pub segment_id: u64,
    pub sequence_num: u32,
    pub value_file_id: u64,
    pub value_file_offset: u64,
    pub size: u64,
    pub hash: Md5Digest,
    pub adler32: u32,
    pub zfec_padding_size: u32,
}

/// Catalog row for one append-only value file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFileRow {
    pub id: u64,
    pub creation_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub size: u64,
    pub hash: Option<Md5Digest>,
    pub sequence_count: u64,
    pub min_segment_id: Option<u64>,
    pub max_segment_id: Option<u64>,
    pub distinct_collection_count: u32,
    pub collection_ids: BTreeSet<CollectionId>,
    pub garbage_size_estimate: u64,
    pub fragmentation_estimate: u64,
    pub last_cleanup_check_time: Option<DateTime<Utc>>,
    pub last_integrity_check_time: Option<DateTime<Utc>>,
}

impl ValueFileRow {
    /// A freshly allocated, still-open value file
    pub fn open(id: u64, creation_time: DateTime<Utc>) -> Self {
        Self {
            id,
            creation_time,
            close_time: None,
            size: 0,
            hash: None,
            sequence_count: 0,
            min_segment_id: None,
            max_segment_id: None,
            distinct_collection_count: 0,
            collection_ids: BTreeSet::new(),
            garbage_size_estimate: 0,
            fragmentation_estimate: 0,
            last_cleanup_check_time: None,
            last_integrity_check_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.close_time.is_none()
    }
}

/// A multi-part upload grouping several segments under one unified id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConjoinedRow {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub create_timestamp: DateTime<Utc>,
    pub abort_timestamp: Option<DateTime<Utc>>,
    pub complete_timestamp: Option<DateTime<Utc>>,
    pub delete_timestamp: Option<DateTime<Utc>>,
    pub handoff_node_name: Option<String>,
}

impl ConjoinedRow {
    pub fn is_complete(&self) -> bool {
        self.complete_timestamp.is_some() && self.abort_timestamp.is_none()
    }
}

/// Milliseconds since 2011-08-24, the start of the id space
const ID_EPOCH_MILLIS: i64 = 1_314_220_021_721;
const MAX_SHARD_ID: u64 = 0b1_1111_1111_1111;

/// Generates cluster-unique unified ids
///
/// Layout: 41 bits of milliseconds, 13 bits of shard id, 10 bits of counter.
pub struct UnifiedIdFactory {
    shard_id: u64,
    counter: AtomicU64,
}

impl UnifiedIdFactory {
    pub fn new(shard_id: u64) -> crate::Result<Self> {
        if shard_id > MAX_SHARD_ID {
            return Err(crate::CumulusError::Configuration(format!(
                "shard_id {} exceeds {}",
                shard_id, MAX_SHARD_ID
            )));
        }
        Ok(Self {
            shard_id,
            counter: AtomicU64::new(0),
        })
    }

    pub fn next_id(&self) -> UnifiedId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) % 1024;
        let millis = (Utc::now().timestamp_millis() - ID_EPOCH_MILLIS).max(0) as u64;
        (millis << 23) | (self.shard_id << 10) | seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SegmentStatus::Active.is_terminal());
        assert!(SegmentStatus::Final.is_terminal());
        assert!(SegmentStatus::Cancelled.is_terminal());
        assert!(SegmentStatus::Tombstone.is_terminal());
    }

    #[test]
    fn test_unified_ids_increase() {
        let factory = UnifiedIdFactory::new(3).unwrap();
        let first = factory.next_id();
        let second = factory.next_id();
        assert_ne!(first, second);
        assert_eq!((first >> 10) & MAX_SHARD_ID, 3);
        assert!(UnifiedIdFactory::new(MAX_SHARD_ID + 1).is_err());
    }

    #[test]
    fn test_segment_key_display() {
        assert_eq!(SegmentKey::new(42, 0, 3).to_string(), "42/0/3");
    }
}
