//! Segment read path

use crate::catalog::Catalog;
use crate::value_file::ValueFileStore;
use bytes::Bytes;
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{CollectionId, SegmentKey, SegmentRow, SegmentSequence, SegmentStatus};
use cumulus_core::Md5Digest;

/// Looks up finished segments and reads their sequence data back
#[derive(Clone)]
pub struct Reader {
    catalog: Catalog,
    store: ValueFileStore,
}

impl Reader {
    pub fn new(catalog: Catalog, store: ValueFileStore) -> Self {
        Self { catalog, store }
    }

    /// Every row this node holds for a key, in any status
    pub fn get_all_segment_rows_for_key(&self, collection_id: CollectionId, key: &str) -> Result<Vec<SegmentRow>> {
        self.catalog.segments_for_key(collection_id, key)
    }

    /// The newest final row for a segment key
    ///
    /// `handoff_node_name` selects a backup copy held for that node instead
    /// of this node's own share.
    pub fn final_segment(&self, key: &SegmentKey, handoff_node_name: Option<&str>) -> Result<Option<SegmentRow>> {
        Ok(self
            .catalog
            .find_segments(key)?
            .into_iter()
            .filter(|row| {
                row.status == SegmentStatus::Final
                    && row.handoff_node_name.as_deref() == handoff_node_name
            })
            .max_by_key(|row| row.id))
    }

    pub fn sequences_for(&self, segment: &SegmentRow) -> Result<Vec<SegmentSequence>> {
        self.catalog.sequences_for_segment(segment.id)
    }

    /// Sequences of the newest final row for a segment key; empty if none
    pub fn final_sequences(&self, key: &SegmentKey, handoff_node_name: Option<&str>) -> Result<Vec<SegmentSequence>> {
        match self.final_segment(key, handoff_node_name)? {
            Some(row) => self.sequences_for(&row),
            None => Ok(Vec::new()),
        }
    }

    /// Read one sequence and check it against its recorded digest
    pub fn read_sequence(&self, sequence: &SegmentSequence) -> Result<Bytes> {
        let data = self
            .store
            .read(sequence.value_file_id, sequence.value_file_offset, sequence.size)?;
        let actual = Md5Digest::compute(&data);
        if actual != sequence.hash {
            return Err(CumulusError::Md5Mismatch(format!(
                "segment {} sequence {}: expected {}, read {}",
                sequence.segment_id, sequence.sequence_num, sequence.hash, actual
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{FileFinal, NewSegment, SequenceWrite, Writer, WriterConfig};
    use chrono::Utc;
    use cumulus_core::ShareChecksum;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Writer, Reader) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::temporary().unwrap();
        let store = ValueFileStore::new(dir.path(), catalog.clone());
        let writer = Writer::new(catalog.clone(), store.clone(), WriterConfig::default());
        (dir, writer, Reader::new(catalog, store))
    }

    fn archive(writer: &mut Writer, unified_id: u64, finish: bool, payload: &[u8]) -> SegmentKey {
        let segment = NewSegment {
            collection_id: 3,
            key: "a/b".to_string(),
            unified_id,
            timestamp: Utc::now(),
            conjoined_part: 0,
            segment_num: 4,
            source_node_name: "node-01".to_string(),
            handoff_node_name: None,
        };
        let key = segment.segment_key();
        writer.start_new_segment(&segment).unwrap();
        writer
            .store_sequence(
                &key,
                SequenceWrite {
                    sequence_num: 0,
                    zfec_padding_size: 0,
                    checksum: ShareChecksum::of(payload),
                    data: payload,
                },
            )
            .unwrap();
        if finish {
            writer.finish_new_segment(&key, FileFinal::default()).unwrap();
        } else {
            writer.cancel_active_archive(&key).unwrap();
        }
        writer.sync().unwrap();
        key
    }

    #[test]
    fn test_only_final_segments_are_readable() {
        let (_dir, mut writer, reader) = setup();
        let cancelled = archive(&mut writer, 1, false, b"never mind");
        let finished = archive(&mut writer, 2, true, b"keep me");

        assert!(reader.final_segment(&cancelled, None).unwrap().is_none());
        assert!(reader.final_sequences(&cancelled, None).unwrap().is_empty());
        assert!(reader.final_sequences(&finished, Some("node-07")).unwrap().is_empty());

        let row = reader.final_segment(&finished, None).unwrap().unwrap();
        let sequences = reader.sequences_for(&row).unwrap();
        assert_eq!(sequences.len(), 1);
        assert_eq!(reader.read_sequence(&sequences[0]).unwrap().as_ref(), b"keep me");

        assert_eq!(reader.get_all_segment_rows_for_key(3, "a/b").unwrap().len(), 2);
    }

    #[test]
    fn test_corruption_on_disk_is_detected() {
        let (dir, mut writer, reader) = setup();
        let key = archive(&mut writer, 5, true, b"pristine");
        let row = reader.final_segment(&key, None).unwrap().unwrap();
        let sequence = reader.sequences_for(&row).unwrap().remove(0);

        let path = crate::value_file::value_file_path(dir.path(), sequence.value_file_id);
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(sequence.value_file_offset)).unwrap();
        file.write_all(b"X").unwrap();
        file.sync_all().unwrap();

        assert!(matches!(
            reader.read_sequence(&sequence),
            Err(CumulusError::Md5Mismatch(_))
        ));
    }
}
