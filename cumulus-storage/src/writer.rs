//! Segment write path
//!
//! The `Writer` owns the node's open value file and its table of active
//! segments. Only the flow that inserted a key into the active table may
//! store sequences into it, finish it or cancel it.

use crate::catalog::Catalog;
use crate::value_file::{OutputValueFile, ValueFileStore};
use chrono::{DateTime, Utc};
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{
    CollectionId, ConjoinedRow, SegmentKey, SegmentRow, SegmentSequence, SegmentStatus, UnifiedId,
};
use cumulus_core::{Md5Digest, ShareChecksum};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Identity of a segment being created
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    pub conjoined_part: u32,
    pub segment_num: u8,
    pub source_node_name: String,
    pub handoff_node_name: Option<String>,
}

impl NewSegment {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.unified_id, self.conjoined_part, self.segment_num)
    }
}

/// One share run as received, with its declared checksum
#[derive(Debug, Clone, Copy)]
pub struct SequenceWrite<'a> {
    pub sequence_num: u32,
    pub zfec_padding_size: u32,
    pub checksum: ShareChecksum,
    pub data: &'a [u8],
}

/// File-level values recorded when a segment becomes final
#[derive(Debug, Clone, Default)]
pub struct FileFinal {
    pub file_size: u64,
    pub file_adler32: u32,
    pub file_md5: Md5Digest,
    pub meta: BTreeMap<String, String>,
}

/// A conjoined-archive lifecycle request
#[derive(Debug, Clone)]
pub struct ConjoinedUpdate {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    pub handoff_node_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSegment {
    segment_id: u64,
    collection_id: CollectionId,
    next_sequence: u32,
}

/// Writer configuration
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Roll over once the next sequence would push the open file past this size
    pub max_value_file_size: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_value_file_size: cumulus_core::DEFAULT_MAX_VALUE_FILE_SIZE,
        }
    }
}

/// Node-side segment writer
pub struct Writer {
    catalog: Catalog,
    store: ValueFileStore,
    config: WriterConfig,
    current: Option<OutputValueFile>,
    active_segments: HashMap<SegmentKey, ActiveSegment>,
}

impl Writer {
    pub fn new(catalog: Catalog, store: ValueFileStore, config: WriterConfig) -> Self {
        Self {
            catalog,
            store,
            config,
            current: None,
            active_segments: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_active(&self, key: &SegmentKey) -> bool {
        self.active_segments.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.active_segments.len()
    }

    /// Id of the value file currently open for writing, if any
    pub fn current_value_file_id(&self) -> Option<u64> {
        self.current.as_ref().map(|f| f.id())
    }

    /// Insert an active segment row; a key already in flight is rejected
    pub fn start_new_segment(&mut self, segment: &NewSegment) -> Result<u64> {
        let key = segment.segment_key();
        if self.active_segments.contains_key(&key) {
            return Err(CumulusError::DuplicateSegment(key.to_string()));
        }

        let id = self.catalog.next_id()?;
        self.catalog.insert_segment(&SegmentRow {
            id,
            collection_id: segment.collection_id,
            key: segment.key.clone(),
            status: SegmentStatus::Active,
            unified_id: segment.unified_id,
            timestamp: segment.timestamp,
            segment_num: segment.segment_num,
            conjoined_part: segment.conjoined_part,
            file_size: 0,
            file_adler32: None,
            file_md5: None,
            file_tombstone_unified_id: None,
            source_node_name: segment.source_node_name.clone(),
            handoff_node_name: segment.handoff_node_name.clone(),
        })?;

        self.active_segments.insert(
            key,
            ActiveSegment {
                segment_id: id,
                collection_id: segment.collection_id,
                next_sequence: 0,
            },
        );
        debug!(segment_id = id, key = %key, "Started segment");
        Ok(id)
    }

    /// Verify and append one sequence of an active segment
    pub fn store_sequence(&mut self, key: &SegmentKey, sequence: SequenceWrite<'_>) -> Result<()> {
        let active = *self
            .active_segments
            .get(key)
            .ok_or_else(|| CumulusError::SegmentNotActive(key.to_string()))?;

        if sequence.sequence_num != active.next_sequence {
            return Err(CumulusError::Storage(format!(
                "segment {} expected sequence {}, got {}",
                key, active.next_sequence, sequence.sequence_num
            )));
        }
        sequence.checksum.verify(sequence.data)?;

        let output = self.output_for(sequence.data.len() as u64)?;
        let offset = output.write_sequence(active.collection_id, active.segment_id, sequence.data)?;
        let value_file_id = output.id();

        self.catalog.insert_sequence(&SegmentSequence {
            collection_id: active.collection_id,
            segment_id: active.segment_id,
            sequence_num: sequence.sequence_num,
            value_file_id,
            value_file_offset: offset,
            size: sequence.checksum.size,
            hash: sequence.checksum.md5,
            adler32: sequence.checksum.adler32,
            zfec_padding_size: sequence.zfec_padding_size,
        })?;

        if let Some(entry) = self.active_segments.get_mut(key) {
            entry.next_sequence += 1;
        }
        Ok(())
    }

    /// Flip an active segment to final and record file-level values
    pub fn finish_new_segment(&mut self, key: &SegmentKey, file: FileFinal) -> Result<()> {
        let active = self
            .active_segments
            .remove(key)
            .ok_or_else(|| CumulusError::SegmentNotActive(key.to_string()))?;

        let mut row = self
            .catalog
            .get_segment(active.segment_id)?
            .ok_or_else(|| CumulusError::NotFound(format!("segment row {}", active.segment_id)))?;
        row.status = SegmentStatus::Final;
        row.file_size = file.file_size;
        row.file_adler32 = Some(file.file_adler32);
        row.file_md5 = Some(file.file_md5);
        self.catalog.update_segment(&row)?;

        if !file.meta.is_empty() {
            self.catalog.put_segment_meta(row.id, &file.meta)?;
        }

        debug!(segment_id = row.id, key = %key, file_size = file.file_size, "Finished segment");
        Ok(())
    }

    /// Cancel an archive in progress
    ///
    /// A key that is no longer active is ignored: a cancel can race the
    /// final message for the same archive.
    pub fn cancel_active_archive(&mut self, key: &SegmentKey) -> Result<bool> {
        let Some(active) = self.active_segments.remove(key) else {
            debug!(key = %key, "Cancel for inactive segment ignored");
            return Ok(false);
        };
        self.cancel_row(active.segment_id)?;
        info!(segment_id = active.segment_id, key = %key, "Cancelled active archive");
        Ok(true)
    }

    fn cancel_row(&self, segment_id: u64) -> Result<()> {
        if let Some(mut row) = self.catalog.get_segment(segment_id)? {
            if row.status == SegmentStatus::Active {
                row.status = SegmentStatus::Cancelled;
                self.catalog.update_segment(&row)?;
            }
        }
        Ok(())
    }

    /// Cancel every active segment from `source_node_name` older than `before`
    ///
    /// Run when a write path restarts; whatever it had in flight is gone.
    pub fn cancel_active_archives_from_node(&mut self, source_node_name: &str, before: DateTime<Utc>) -> Result<usize> {
        let rows = self.catalog.active_segments_from(source_node_name, before)?;
        for row in &rows {
            self.cancel_row(row.id)?;
            self.active_segments.remove(&row.segment_key());
        }
        if !rows.is_empty() {
            warn!(source = source_node_name, cancelled = rows.len(), "Cancelled orphaned active segments");
        }
        Ok(rows.len())
    }

    /// Record deletion of `unified_id_to_delete` (or of every earlier version)
    pub fn set_tombstone(&mut self, tombstone: &NewSegment, unified_id_to_delete: Option<UnifiedId>) -> Result<u64> {
        let id = self.catalog.next_id()?;
        self.catalog.insert_segment(&SegmentRow {
            id,
            collection_id: tombstone.collection_id,
            key: tombstone.key.clone(),
            status: SegmentStatus::Tombstone,
            unified_id: tombstone.unified_id,
            timestamp: tombstone.timestamp,
            segment_num: tombstone.segment_num,
            conjoined_part: 0,
            file_size: 0,
            file_adler32: None,
            file_md5: None,
            file_tombstone_unified_id: unified_id_to_delete,
            source_node_name: tombstone.source_node_name.clone(),
            handoff_node_name: tombstone.handoff_node_name.clone(),
        })?;
        info!(
            segment_id = id,
            key = %tombstone.key,
            unified_id = tombstone.unified_id,
            "Stored tombstone"
        );
        Ok(id)
    }

    /// Delete the backup copies of one conjoined part held for
    /// `handoff_node_name`
    pub fn purge_handoff_segment(
        &mut self,
        collection_id: CollectionId,
        unified_id: UnifiedId,
        conjoined_part: u32,
        handoff_node_name: &str,
    ) -> Result<usize> {
        let rows: Vec<SegmentRow> = self
            .catalog
            .segments_for_unified_id(unified_id)?
            .into_iter()
            .filter(|row| {
                row.collection_id == collection_id
                    && row.conjoined_part == conjoined_part
                    && row.handoff_node_name.as_deref() == Some(handoff_node_name)
            })
            .collect();
        for row in &rows {
            self.catalog.delete_segment(row)?;
        }
        info!(
            unified_id,
            conjoined_part,
            handoff_node = handoff_node_name,
            purged = rows.len(),
            "Purged handoff segments"
        );
        Ok(rows.len())
    }

    pub fn purge_handoff_conjoined(&mut self, unified_id: UnifiedId, handoff_node_name: &str) -> Result<bool> {
        self.catalog.delete_conjoined(unified_id, Some(handoff_node_name))
    }

    pub fn start_conjoined_archive(&mut self, update: &ConjoinedUpdate) -> Result<()> {
        self.catalog.put_conjoined(&ConjoinedRow {
            collection_id: update.collection_id,
            key: update.key.clone(),
            unified_id: update.unified_id,
            create_timestamp: update.timestamp,
            abort_timestamp: None,
            complete_timestamp: None,
            delete_timestamp: None,
            handoff_node_name: update.handoff_node_name.clone(),
        })
    }

    pub fn abort_conjoined_archive(&mut self, update: &ConjoinedUpdate) -> Result<()> {
        let mut row = self.conjoined_row(update)?;
        row.abort_timestamp = Some(update.timestamp);
        self.catalog.put_conjoined(&row)
    }

    pub fn finish_conjoined_archive(&mut self, update: &ConjoinedUpdate) -> Result<()> {
        let mut row = self.conjoined_row(update)?;
        row.complete_timestamp = Some(update.timestamp);
        self.catalog.put_conjoined(&row)
    }

    /// The row an abort or finish applies to
    ///
    /// A backup may not have been picked for the start of an archive it is
    /// asked to close, so handoff rows are created on demand.
    fn conjoined_row(&self, update: &ConjoinedUpdate) -> Result<ConjoinedRow> {
        let existing = self
            .catalog
            .get_conjoined(update.unified_id, update.handoff_node_name.as_deref())?;
        match (existing, &update.handoff_node_name) {
            (Some(row), _) => Ok(row),
            (None, Some(_)) => Ok(ConjoinedRow {
                collection_id: update.collection_id,
                key: update.key.clone(),
                unified_id: update.unified_id,
                create_timestamp: update.timestamp,
                abort_timestamp: None,
                complete_timestamp: None,
                delete_timestamp: None,
                handoff_node_name: update.handoff_node_name.clone(),
            }),
            (None, None) => Err(CumulusError::NotFound(format!("conjoined archive {}", update.unified_id))),
        }
    }

    /// Sync the open value file, if any
    pub fn sync(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some(output) => output.sync(),
            None => Ok(()),
        }
    }

    /// Close the open value file and flush the catalog
    pub fn close(&mut self) -> Result<()> {
        if let Some(output) = self.current.take() {
            output.close()?;
        }
        if !self.active_segments.is_empty() {
            warn!(active = self.active_segments.len(), "Closing writer with active segments");
        }
        self.catalog.flush()
    }

    fn output_for(&mut self, incoming: u64) -> Result<&mut OutputValueFile> {
        let roll = match &self.current {
            Some(output) => {
                output.sequence_count() > 0
                    && output.size() + incoming > self.config.max_value_file_size
            }
            None => false,
        };
        if roll {
            if let Some(output) = self.current.take() {
                debug!(value_file_id = output.id(), size = output.size(), "Rolling over value file");
                output.close()?;
            }
        }
        if self.current.is_none() {
            self.current = Some(self.store.open_for_write()?);
        }
        self.current
            .as_mut()
            .ok_or_else(|| CumulusError::Internal("no open value file".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_file::value_file_path;
    use tempfile::TempDir;

    fn writer(max_value_file_size: u64) -> (TempDir, Writer) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::temporary().unwrap();
        let store = ValueFileStore::new(dir.path(), catalog.clone());
        let writer = Writer::new(catalog, store, WriterConfig { max_value_file_size });
        (dir, writer)
    }

    fn new_segment(unified_id: UnifiedId, segment_num: u8) -> NewSegment {
        NewSegment {
            collection_id: 1,
            key: "docs/report.pdf".to_string(),
            unified_id,
            timestamp: Utc::now(),
            conjoined_part: 0,
            segment_num,
            source_node_name: "node-01".to_string(),
            handoff_node_name: None,
        }
    }

    fn sequence(sequence_num: u32, data: &[u8]) -> SequenceWrite<'_> {
        SequenceWrite {
            sequence_num,
            zfec_padding_size: 0,
            checksum: ShareChecksum::of(data),
            data,
        }
    }

    #[test]
    fn test_full_segment_lifecycle() {
        let (_dir, mut writer) = writer(1024);
        let segment = new_segment(10, 1);
        let key = segment.segment_key();
        let id = writer.start_new_segment(&segment).unwrap();

        writer.store_sequence(&key, sequence(0, b"first")).unwrap();
        writer.store_sequence(&key, sequence(1, b"second")).unwrap();
        writer
            .finish_new_segment(&key, FileFinal { file_size: 11, ..Default::default() })
            .unwrap();

        let row = writer.catalog().get_segment(id).unwrap().unwrap();
        assert_eq!(row.status, SegmentStatus::Final);
        assert_eq!(row.file_size, 11);
        assert_eq!(writer.catalog().sequences_for_segment(id).unwrap().len(), 2);
        assert!(!writer.is_active(&key));
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let (_dir, mut writer) = writer(1024);
        let segment = new_segment(10, 1);
        writer.start_new_segment(&segment).unwrap();
        assert!(matches!(
            writer.start_new_segment(&segment),
            Err(CumulusError::DuplicateSegment(_))
        ));
    }

    #[test]
    fn test_terminal_segments_reject_writes() {
        let (_dir, mut writer) = writer(1024);

        let finished = new_segment(20, 1);
        let finished_key = finished.segment_key();
        writer.start_new_segment(&finished).unwrap();
        writer.finish_new_segment(&finished_key, FileFinal::default()).unwrap();
        assert!(matches!(
            writer.store_sequence(&finished_key, sequence(0, b"late")),
            Err(CumulusError::SegmentNotActive(_))
        ));
        assert!(matches!(
            writer.finish_new_segment(&finished_key, FileFinal::default()),
            Err(CumulusError::SegmentNotActive(_))
        ));

        let cancelled = new_segment(21, 1);
        let cancelled_key = cancelled.segment_key();
        let id = writer.start_new_segment(&cancelled).unwrap();
        assert!(writer.cancel_active_archive(&cancelled_key).unwrap());
        assert!(writer.store_sequence(&cancelled_key, sequence(0, b"late")).is_err());
        assert_eq!(
            writer.catalog().get_segment(id).unwrap().unwrap().status,
            SegmentStatus::Cancelled
        );

        // A second cancel races nothing and is ignored.
        assert!(!writer.cancel_active_archive(&cancelled_key).unwrap());
    }

    #[test]
    fn test_checksum_and_order_enforced() {
        let (_dir, mut writer) = writer(1024);
        let segment = new_segment(30, 2);
        let key = segment.segment_key();
        writer.start_new_segment(&segment).unwrap();

        let mut bad = sequence(0, b"payload");
        bad.checksum = ShareChecksum::of(b"payloaf");
        assert!(writer.store_sequence(&key, bad).unwrap_err().is_integrity());

        assert!(writer.store_sequence(&key, sequence(1, b"skipped")).is_err());
        writer.store_sequence(&key, sequence(0, b"payload")).unwrap();
    }

    #[test]
    fn test_rollover_spans_segment_across_files() {
        let (dir, mut writer) = writer(10);
        let segment = new_segment(40, 1);
        let key = segment.segment_key();
        let id = writer.start_new_segment(&segment).unwrap();

        writer.store_sequence(&key, sequence(0, b"12345678")).unwrap();
        let first_file = writer.current_value_file_id().unwrap();
        writer.store_sequence(&key, sequence(1, b"abcdefgh")).unwrap();
        let second_file = writer.current_value_file_id().unwrap();
        assert_ne!(first_file, second_file);

        let closed = writer.catalog().get_value_file(first_file).unwrap().unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.size, 8);
        assert!(closed.hash.is_some());

        let files: Vec<u64> = writer
            .catalog()
            .sequences_for_segment(id)
            .unwrap()
            .iter()
            .map(|s| s.value_file_id)
            .collect();
        assert_eq!(files, vec![first_file, second_file]);

        writer.close().unwrap();
        assert!(value_file_path(dir.path(), second_file).exists());
    }

    #[test]
    fn test_cancel_from_node_sweep() {
        let (_dir, mut writer) = writer(1024);
        let stale = new_segment(50, 1);
        let stale_key = stale.segment_key();
        let stale_id = writer.start_new_segment(&stale).unwrap();

        let mut other = new_segment(51, 1);
        other.source_node_name = "node-02".to_string();
        writer.start_new_segment(&other).unwrap();

        let restart = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(writer.cancel_active_archives_from_node("node-01", restart).unwrap(), 1);
        assert!(!writer.is_active(&stale_key));
        assert_eq!(
            writer.catalog().get_segment(stale_id).unwrap().unwrap().status,
            SegmentStatus::Cancelled
        );
        assert_eq!(writer.active_count(), 1);
    }

    #[test]
    fn test_purge_handoff_only_removes_backup_rows() {
        let (_dir, mut writer) = writer(1024);
        let own = new_segment(60, 1);
        let mut held = new_segment(60, 5);
        held.handoff_node_name = Some("node-05".to_string());

        for segment in [&own, &held] {
            let key = segment.segment_key();
            writer.start_new_segment(segment).unwrap();
            writer.store_sequence(&key, sequence(0, b"data")).unwrap();
            writer.finish_new_segment(&key, FileFinal::default()).unwrap();
        }

        assert_eq!(writer.purge_handoff_segment(1, 60, 0, "node-05").unwrap(), 1);
        let remaining = writer.catalog().segments_for_unified_id(60).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].segment_num, 1);
    }

    #[test]
    fn test_purge_handoff_keeps_other_conjoined_parts() {
        let (_dir, mut writer) = writer(1024);
        for part in [1, 2] {
            let mut held = new_segment(90, 10);
            held.conjoined_part = part;
            held.handoff_node_name = Some("node-10".to_string());
            let key = held.segment_key();
            writer.start_new_segment(&held).unwrap();
            writer.store_sequence(&key, sequence(0, b"part")).unwrap();
            writer.finish_new_segment(&key, FileFinal::default()).unwrap();
        }

        assert_eq!(writer.purge_handoff_segment(1, 90, 1, "node-10").unwrap(), 1);
        let remaining = writer.catalog().handoff_segments_for("node-10").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].conjoined_part, 2);
        assert_eq!(writer.catalog().sequences_for_segment(remaining[0].id).unwrap().len(), 1);
    }

    #[test]
    fn test_conjoined_lifecycle() {
        let (_dir, mut writer) = writer(1024);
        let update = ConjoinedUpdate {
            collection_id: 1,
            key: "big/upload".to_string(),
            unified_id: 70,
            timestamp: Utc::now(),
            handoff_node_name: None,
        };
        assert!(writer.finish_conjoined_archive(&update).is_err());

        writer.start_conjoined_archive(&update).unwrap();
        writer.finish_conjoined_archive(&update).unwrap();
        let row = writer.catalog().get_conjoined(70, None).unwrap().unwrap();
        assert!(row.is_complete());
    }

    #[test]
    fn test_backup_finishes_conjoined_it_never_started() {
        let (_dir, mut writer) = writer(1024);
        let update = ConjoinedUpdate {
            collection_id: 1,
            key: "big/upload".to_string(),
            unified_id: 71,
            timestamp: Utc::now(),
            handoff_node_name: Some("node-10".to_string()),
        };
        writer.finish_conjoined_archive(&update).unwrap();

        let row = writer.catalog().get_conjoined(71, Some("node-10")).unwrap().unwrap();
        assert!(row.is_complete());
        assert!(writer.catalog().get_conjoined(71, None).unwrap().is_none());
        assert_eq!(writer.catalog().handoff_conjoined_for("node-10").unwrap().len(), 1);
    }
}
