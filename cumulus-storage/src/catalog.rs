//! Sled-backed node catalog
//!
//! Holds the segment, sequence, value-file and conjoined tables for one node.
//! Rows are bincode-encoded; keys are big-endian so prefix scans come back in
//! numeric order.

use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{
    CollectionId, ConjoinedRow, SegmentKey, SegmentRow, SegmentSequence, SegmentStatus, UnifiedId,
    ValueFileRow,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const VALUE_FILES: &str = "value_files";
const SEGMENTS: &str = "segments";
const SEGMENT_INDEX: &str = "segment_index";
const KEY_INDEX: &str = "key_index";
const SEQUENCES: &str = "segment_sequences";
const SEGMENT_META: &str = "segment_meta";
const CONJOINED: &str = "conjoined";

/// Node-local catalog
///
/// Cloning is cheap; clones share the same database.
#[derive(Clone)]
pub struct Catalog {
    db: sled::Db,
}

fn storage_err(e: sled::Error) -> CumulusError {
    CumulusError::Storage(e.to_string())
}

fn segment_index_prefix(unified_id: UnifiedId, conjoined_part: u32, segment_num: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.extend_from_slice(&unified_id.to_be_bytes());
    key.extend_from_slice(&conjoined_part.to_be_bytes());
    key.push(segment_num);
    key
}

fn key_index_prefix(collection_id: CollectionId, key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 5);
    prefix.extend_from_slice(&collection_id.to_be_bytes());
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(0);
    prefix
}

fn conjoined_key(unified_id: UnifiedId, handoff_node_name: Option<&str>) -> Vec<u8> {
    let mut key = unified_id.to_be_bytes().to_vec();
    if let Some(name) = handoff_node_name {
        key.extend_from_slice(name.as_bytes());
    }
    key
}

fn trailing_id(key: &[u8]) -> Result<u64> {
    let start = key
        .len()
        .checked_sub(8)
        .ok_or_else(|| CumulusError::Storage("index key too short".to_string()))?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[start..]);
    Ok(u64::from_be_bytes(id))
}

impl Catalog {
    /// Open or create a catalog
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening catalog");

        let db = sled::open(path.as_ref())
            .map_err(|e| CumulusError::Storage(format!("Failed to open catalog: {}", e)))?;

        Ok(Self { db })
    }

    /// Open an in-memory catalog (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| CumulusError::Storage(format!("Failed to open catalog: {}", e)))?;
        Ok(Self { db })
    }

    /// Flush all trees to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    /// Allocate a new row id; ids start at 1
    pub fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id().map_err(storage_err)? + 1)
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db.open_tree(name).map_err(storage_err)
    }

    fn put_value<K: AsRef<[u8]>, V: Serialize>(&self, tree: &sled::Tree, key: K, value: &V) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        tree.insert(key, encoded).map_err(storage_err)?;
        Ok(())
    }

    fn get_value<K: AsRef<[u8]>, V: DeserializeOwned>(&self, tree: &sled::Tree, key: K) -> Result<Option<V>> {
        match tree.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_values<V: DeserializeOwned>(&self, tree: &sled::Tree, prefix: &[u8]) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (_, value) = item.map_err(storage_err)?;
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    // ===== Value File Operations =====

    pub fn put_value_file(&self, row: &ValueFileRow) -> Result<()> {
        let tree = self.tree(VALUE_FILES)?;
        self.put_value(&tree, row.id.to_be_bytes(), row)
    }

    pub fn get_value_file(&self, id: u64) -> Result<Option<ValueFileRow>> {
        let tree = self.tree(VALUE_FILES)?;
        self.get_value(&tree, id.to_be_bytes())
    }

    pub fn remove_value_file(&self, id: u64) -> Result<bool> {
        let tree = self.tree(VALUE_FILES)?;
        Ok(tree.remove(id.to_be_bytes()).map_err(storage_err)?.is_some())
    }

    pub fn value_files(&self) -> Result<Vec<ValueFileRow>> {
        let tree = self.tree(VALUE_FILES)?;
        self.scan_values(&tree, &[])
    }

    // ===== Segment Operations =====

    /// Insert a new segment row and its indexes
    pub fn insert_segment(&self, row: &SegmentRow) -> Result<()> {
        let segments = self.tree(SEGMENTS)?;
        self.put_value(&segments, row.id.to_be_bytes(), row)?;

        let mut index_key = segment_index_prefix(row.unified_id, row.conjoined_part, row.segment_num);
        index_key.extend_from_slice(&row.id.to_be_bytes());
        self.tree(SEGMENT_INDEX)?
            .insert(index_key, Vec::<u8>::new())
            .map_err(storage_err)?;

        let mut key_key = key_index_prefix(row.collection_id, &row.key);
        key_key.extend_from_slice(&row.id.to_be_bytes());
        self.tree(KEY_INDEX)?
            .insert(key_key, Vec::<u8>::new())
            .map_err(storage_err)?;

        debug!(segment_id = row.id, key = %row.segment_key(), status = %row.status, "Inserted segment row");
        Ok(())
    }

    /// Rewrite an existing segment row; key fields never change
    pub fn update_segment(&self, row: &SegmentRow) -> Result<()> {
        let segments = self.tree(SEGMENTS)?;
        self.put_value(&segments, row.id.to_be_bytes(), row)
    }

    pub fn get_segment(&self, id: u64) -> Result<Option<SegmentRow>> {
        let tree = self.tree(SEGMENTS)?;
        self.get_value(&tree, id.to_be_bytes())
    }

    fn segments_by_ids<I: IntoIterator<Item = u64>>(&self, ids: I) -> Result<Vec<SegmentRow>> {
        let mut rows = Vec::new();
        for id in ids {
            if let Some(row) = self.get_segment(id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn index_ids(&self, tree_name: &str, prefix: &[u8]) -> Result<Vec<u64>> {
        let tree = self.tree(tree_name)?;
        let mut ids = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (key, _) = item.map_err(storage_err)?;
            ids.push(trailing_id(&key)?);
        }
        Ok(ids)
    }

    /// Every row stored under one segment key, oldest first
    pub fn find_segments(&self, key: &SegmentKey) -> Result<Vec<SegmentRow>> {
        let prefix = segment_index_prefix(key.unified_id, key.conjoined_part, key.segment_num);
        let ids = self.index_ids(SEGMENT_INDEX, &prefix)?;
        self.segments_by_ids(ids)
    }

    /// Every row for one unified id, any part or segment number
    pub fn segments_for_unified_id(&self, unified_id: UnifiedId) -> Result<Vec<SegmentRow>> {
        let ids = self.index_ids(SEGMENT_INDEX, &unified_id.to_be_bytes())?;
        self.segments_by_ids(ids)
    }

    /// Every row stored for a collection key, oldest first
    pub fn segments_for_key(&self, collection_id: CollectionId, key: &str) -> Result<Vec<SegmentRow>> {
        let ids = self.index_ids(KEY_INDEX, &key_index_prefix(collection_id, key))?;
        self.segments_by_ids(ids)
    }

    fn scan_segments<F: Fn(&SegmentRow) -> bool>(&self, filter: F) -> Result<Vec<SegmentRow>> {
        let tree = self.tree(SEGMENTS)?;
        let mut rows = Vec::new();
        for item in tree.iter() {
            let (_, value) = item.map_err(storage_err)?;
            let row: SegmentRow = bincode::deserialize(&value)?;
            if filter(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Finished segments this node holds on behalf of `node_name`
    pub fn handoff_segments_for(&self, node_name: &str) -> Result<Vec<SegmentRow>> {
        self.scan_segments(|row| {
            row.handoff_node_name.as_deref() == Some(node_name)
                && matches!(row.status, SegmentStatus::Final | SegmentStatus::Tombstone)
        })
    }

    /// Active rows written by `source_node_name` before `before`
    pub fn active_segments_from(&self, source_node_name: &str, before: DateTime<Utc>) -> Result<Vec<SegmentRow>> {
        self.scan_segments(|row| {
            row.status == SegmentStatus::Active
                && row.source_node_name == source_node_name
                && row.timestamp < before
        })
    }

    /// Delete a segment with its indexes, sequences and metadata
    pub fn delete_segment(&self, row: &SegmentRow) -> Result<()> {
        let id_bytes = row.id.to_be_bytes();
        self.tree(SEGMENTS)?.remove(id_bytes).map_err(storage_err)?;

        let mut index_key = segment_index_prefix(row.unified_id, row.conjoined_part, row.segment_num);
        index_key.extend_from_slice(&id_bytes);
        self.tree(SEGMENT_INDEX)?.remove(index_key).map_err(storage_err)?;

        let mut key_key = key_index_prefix(row.collection_id, &row.key);
        key_key.extend_from_slice(&id_bytes);
        self.tree(KEY_INDEX)?.remove(key_key).map_err(storage_err)?;

        let sequences = self.tree(SEQUENCES)?;
        for item in sequences.scan_prefix(id_bytes) {
            let (key, _) = item.map_err(storage_err)?;
            sequences.remove(key).map_err(storage_err)?;
        }
        self.tree(SEGMENT_META)?.remove(id_bytes).map_err(storage_err)?;

        debug!(segment_id = row.id, key = %row.segment_key(), "Deleted segment row");
        Ok(())
    }

    // ===== Sequence Operations =====

    pub fn insert_sequence(&self, sequence: &SegmentSequence) -> Result<()> {
        let mut key = sequence.segment_id.to_be_bytes().to_vec();
        key.extend_from_slice(&sequence.sequence_num.to_be_bytes());
        let tree = self.tree(SEQUENCES)?;
        self.put_value(&tree, key, sequence)
    }

    /// A segment's sequences ordered by sequence number
    pub fn sequences_for_segment(&self, segment_id: u64) -> Result<Vec<SegmentSequence>> {
        let tree = self.tree(SEQUENCES)?;
        self.scan_values(&tree, &segment_id.to_be_bytes())
    }

    // ===== Segment Metadata =====

    pub fn put_segment_meta(&self, segment_id: u64, meta: &BTreeMap<String, String>) -> Result<()> {
        let tree = self.tree(SEGMENT_META)?;
        self.put_value(&tree, segment_id.to_be_bytes(), meta)
    }

    pub fn get_segment_meta(&self, segment_id: u64) -> Result<BTreeMap<String, String>> {
        let tree = self.tree(SEGMENT_META)?;
        Ok(self.get_value(&tree, segment_id.to_be_bytes())?.unwrap_or_default())
    }

    // ===== Conjoined Operations =====

    pub fn put_conjoined(&self, row: &ConjoinedRow) -> Result<()> {
        let tree = self.tree(CONJOINED)?;
        self.put_value(&tree, conjoined_key(row.unified_id, row.handoff_node_name.as_deref()), row)
    }

    pub fn get_conjoined(&self, unified_id: UnifiedId, handoff_node_name: Option<&str>) -> Result<Option<ConjoinedRow>> {
        let tree = self.tree(CONJOINED)?;
        self.get_value(&tree, conjoined_key(unified_id, handoff_node_name))
    }

    pub fn delete_conjoined(&self, unified_id: UnifiedId, handoff_node_name: Option<&str>) -> Result<bool> {
        let tree = self.tree(CONJOINED)?;
        Ok(tree
            .remove(conjoined_key(unified_id, handoff_node_name))
            .map_err(storage_err)?
            .is_some())
    }

    /// Conjoined rows this node holds on behalf of `node_name`
    pub fn handoff_conjoined_for(&self, node_name: &str) -> Result<Vec<ConjoinedRow>> {
        let tree = self.tree(CONJOINED)?;
        let rows: Vec<ConjoinedRow> = self.scan_values(&tree, &[])?;
        Ok(rows
            .into_iter()
            .filter(|row| row.handoff_node_name.as_deref() == Some(node_name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::Md5Digest;

    fn segment(id: u64, unified_id: UnifiedId, segment_num: u8) -> SegmentRow {
        SegmentRow {
            id,
            collection_id: 7,
            key: "photos/cat.jpg".to_string(),
            status: SegmentStatus::Active,
            unified_id,
            timestamp: Utc::now(),
            segment_num,
            conjoined_part: 0,
            file_size: 0,
            file_adler32: None,
            file_md5: None,
            file_tombstone_unified_id: None,
            source_node_name: "node-01".to_string(),
            handoff_node_name: None,
        }
    }

    #[test]
    fn test_segment_indexes() {
        let catalog = Catalog::temporary().unwrap();
        catalog.insert_segment(&segment(1, 100, 3)).unwrap();
        catalog.insert_segment(&segment(2, 100, 4)).unwrap();
        catalog.insert_segment(&segment(3, 101, 3)).unwrap();

        let found = catalog.find_segments(&SegmentKey::new(100, 0, 3)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);

        assert_eq!(catalog.segments_for_unified_id(100).unwrap().len(), 2);
        assert_eq!(catalog.segments_for_key(7, "photos/cat.jpg").unwrap().len(), 3);
        assert!(catalog.segments_for_key(7, "photos/cat").unwrap().is_empty());
    }

    #[test]
    fn test_sequences_ordered_and_deleted_with_segment() {
        let catalog = Catalog::temporary().unwrap();
        let row = segment(9, 500, 1);
        catalog.insert_segment(&row).unwrap();

        for sequence_num in [2u32, 0, 1] {
            catalog
                .insert_sequence(&SegmentSequence {
                    collection_id: 7,
                    segment_id: 9,
                    sequence_num,
                    value_file_id: 1,
                    value_file_offset: 0,
                    size: 4,
                    hash: Md5Digest::compute(b"abcd"),
                    adler32: 0,
                    zfec_padding_size: 0,
                })
                .unwrap();
        }

        let nums: Vec<u32> = catalog
            .sequences_for_segment(9)
            .unwrap()
            .iter()
            .map(|s| s.sequence_num)
            .collect();
        assert_eq!(nums, vec![0, 1, 2]);

        catalog.delete_segment(&row).unwrap();
        assert!(catalog.get_segment(9).unwrap().is_none());
        assert!(catalog.sequences_for_segment(9).unwrap().is_empty());
        assert!(catalog.find_segments(&row.segment_key()).unwrap().is_empty());
    }

    #[test]
    fn test_handoff_and_active_scans() {
        let catalog = Catalog::temporary().unwrap();
        let mut held = segment(1, 100, 5);
        held.status = SegmentStatus::Final;
        held.handoff_node_name = Some("node-05".to_string());
        catalog.insert_segment(&held).unwrap();
        catalog.insert_segment(&segment(2, 101, 1)).unwrap();

        assert_eq!(catalog.handoff_segments_for("node-05").unwrap().len(), 1);
        assert!(catalog.handoff_segments_for("node-06").unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(1);
        let active = catalog.active_segments_from("node-01", later).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 2);
    }

    #[test]
    fn test_ids_start_at_one() {
        let catalog = Catalog::temporary().unwrap();
        let first = catalog.next_id().unwrap();
        assert!(first >= 1);
        assert!(catalog.next_id().unwrap() > first);
    }
}
