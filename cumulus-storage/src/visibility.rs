//! Version visibility
//!
//! Answers "which version of this key is current and available". The
//! retriever treats this as a black box; `CatalogVisibility` answers from the
//! local catalog.

use crate::catalog::Catalog;
use chrono::{DateTime, Utc};
use cumulus_core::error::Result;
use cumulus_core::model::{CollectionId, SegmentStatus, UnifiedId};
use cumulus_core::Md5Digest;
use std::collections::BTreeMap;

/// One conjoined part of the current version of a key
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleSegment {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub conjoined_part: u32,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    pub file_adler32: Option<u32>,
    pub file_md5: Option<Md5Digest>,
}

pub trait VersionVisibility: Send + Sync {
    /// Parts of the current version (or of `version`), ordered by part.
    /// Empty when nothing is available.
    fn current_version(
        &self,
        collection_id: CollectionId,
        key: &str,
        version: Option<UnifiedId>,
    ) -> Result<Vec<VisibleSegment>>;
}

/// Visibility computed from this node's own catalog
#[derive(Clone)]
pub struct CatalogVisibility {
    catalog: Catalog,
}

impl CatalogVisibility {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

impl VersionVisibility for CatalogVisibility {
    fn current_version(
        &self,
        collection_id: CollectionId,
        key: &str,
        version: Option<UnifiedId>,
    ) -> Result<Vec<VisibleSegment>> {
        let rows: Vec<_> = self
            .catalog
            .segments_for_key(collection_id, key)?
            .into_iter()
            .filter(|row| matches!(row.status, SegmentStatus::Final | SegmentStatus::Tombstone))
            .collect();

        let target = match version {
            Some(unified_id) => {
                let deleted = rows.iter().any(|row| {
                    row.status == SegmentStatus::Tombstone
                        && match row.file_tombstone_unified_id {
                            Some(doomed) => doomed == unified_id,
                            None => row.unified_id > unified_id,
                        }
                });
                if deleted {
                    return Ok(Vec::new());
                }
                unified_id
            }
            None => match rows.iter().max_by_key(|row| row.unified_id) {
                Some(newest) if newest.status == SegmentStatus::Final => newest.unified_id,
                _ => return Ok(Vec::new()),
            },
        };

        let mut parts: BTreeMap<u32, VisibleSegment> = BTreeMap::new();
        for row in rows
            .iter()
            .filter(|row| row.unified_id == target && row.status == SegmentStatus::Final)
        {
            parts.entry(row.conjoined_part).or_insert_with(|| VisibleSegment {
                collection_id: row.collection_id,
                key: row.key.clone(),
                unified_id: row.unified_id,
                conjoined_part: row.conjoined_part,
                timestamp: row.timestamp,
                file_size: row.file_size,
                file_adler32: row.file_adler32,
                file_md5: row.file_md5,
            });
        }

        if parts.keys().any(|part| *part > 0) {
            let complete = self
                .catalog
                .get_conjoined(target, None)?
                .map(|row| row.is_complete())
                .unwrap_or(false);
            if !complete {
                return Ok(Vec::new());
            }
        }

        Ok(parts.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_file::ValueFileStore;
    use crate::writer::{ConjoinedUpdate, FileFinal, NewSegment, Writer, WriterConfig};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Writer, CatalogVisibility) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::temporary().unwrap();
        let store = ValueFileStore::new(dir.path(), catalog.clone());
        let writer = Writer::new(catalog.clone(), store, WriterConfig::default());
        (dir, writer, CatalogVisibility::new(catalog))
    }

    fn segment(unified_id: UnifiedId, conjoined_part: u32) -> NewSegment {
        NewSegment {
            collection_id: 1,
            key: "k".to_string(),
            unified_id,
            timestamp: Utc::now(),
            conjoined_part,
            segment_num: 1,
            source_node_name: "node-01".to_string(),
            handoff_node_name: None,
        }
    }

    fn finish(writer: &mut Writer, unified_id: UnifiedId, conjoined_part: u32, file_size: u64) {
        let new = segment(unified_id, conjoined_part);
        writer.start_new_segment(&new).unwrap();
        writer
            .finish_new_segment(&new.segment_key(), FileFinal { file_size, ..Default::default() })
            .unwrap();
    }

    #[test]
    fn test_newest_final_wins() {
        let (_dir, mut writer, visibility) = setup();
        finish(&mut writer, 10, 0, 5);
        finish(&mut writer, 20, 0, 7);

        let current = visibility.current_version(1, "k", None).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].unified_id, 20);
        assert_eq!(current[0].file_size, 7);

        let older = visibility.current_version(1, "k", Some(10)).unwrap();
        assert_eq!(older[0].file_size, 5);
    }

    #[test]
    fn test_tombstone_hides_key() {
        let (_dir, mut writer, visibility) = setup();
        finish(&mut writer, 10, 0, 5);
        writer.set_tombstone(&segment(11, 0), Some(10)).unwrap();

        assert!(visibility.current_version(1, "k", None).unwrap().is_empty());
        assert!(visibility.current_version(1, "k", Some(10)).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_only_is_not_found() {
        let (_dir, mut writer, visibility) = setup();
        let new = segment(10, 0);
        writer.start_new_segment(&new).unwrap();
        writer.cancel_active_archive(&new.segment_key()).unwrap();
        assert!(visibility.current_version(1, "k", None).unwrap().is_empty());
    }

    #[test]
    fn test_conjoined_parts_need_completion() {
        let (_dir, mut writer, visibility) = setup();
        let update = ConjoinedUpdate {
            collection_id: 1,
            key: "k".to_string(),
            unified_id: 30,
            timestamp: Utc::now(),
            handoff_node_name: None,
        };
        writer.start_conjoined_archive(&update).unwrap();
        finish(&mut writer, 30, 1, 100);
        finish(&mut writer, 30, 2, 50);
        assert!(visibility.current_version(1, "k", None).unwrap().is_empty());

        writer.finish_conjoined_archive(&update).unwrap();
        let parts: Vec<u32> = visibility
            .current_version(1, "k", None)
            .unwrap()
            .iter()
            .map(|p| p.conjoined_part)
            .collect();
        assert_eq!(parts, vec![1, 2]);
    }
}
