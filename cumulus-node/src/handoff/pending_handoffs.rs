//! Queue of handoffs waiting to be forwarded, oldest unified id first

use cumulus_core::model::{SegmentRow, UnifiedId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Sources recorded per handoff; a node's share is held on two backups
const MAX_SOURCES: usize = 2;

/// One segment to forward, with the nodes holding copies of it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHandoff {
    pub segment: SegmentRow,
    pub sources: Vec<String>,
}

#[derive(Default)]
pub struct PendingHandoffs {
    order: BinaryHeap<Reverse<(UnifiedId, u32)>>,
    entries: HashMap<(UnifiedId, u32), PendingHandoff>,
    duplicates: usize,
}

impl PendingHandoffs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source` holds `segment`; repeated reports add sources
    pub fn push(&mut self, segment: SegmentRow, source: &str) {
        let key = (segment.unified_id, segment.conjoined_part);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                self.duplicates += 1;
                if entry.sources.len() < MAX_SOURCES && !entry.sources.iter().any(|s| s == source) {
                    entry.sources.push(source.to_string());
                }
            }
            None => {
                self.order.push(Reverse(key));
                self.entries.insert(
                    key,
                    PendingHandoff {
                        segment,
                        sources: vec![source.to_string()],
                    },
                );
            }
        }
    }

    /// The pending handoff with the lowest unified id
    pub fn pop(&mut self) -> Option<PendingHandoff> {
        while let Some(Reverse(key)) = self.order.pop() {
            if let Some(entry) = self.entries.remove(&key) {
                return Some(entry);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reports of a handoff already queued
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cumulus_core::SegmentStatus;

    fn row(unified_id: UnifiedId) -> SegmentRow {
        SegmentRow {
            id: unified_id,
            collection_id: 1,
            key: format!("key-{}", unified_id),
            status: SegmentStatus::Final,
            unified_id,
            timestamp: Utc::now(),
            segment_num: 9,
            conjoined_part: 0,
            file_size: 10,
            file_adler32: None,
            file_md5: None,
            file_tombstone_unified_id: None,
            source_node_name: "node-01".to_string(),
            handoff_node_name: Some("node-09".to_string()),
        }
    }

    #[test]
    fn test_pops_oldest_first() {
        let mut pending = PendingHandoffs::new();
        pending.push(row(30), "node-02");
        pending.push(row(10), "node-03");
        pending.push(row(20), "node-04");

        let order: Vec<UnifiedId> = std::iter::from_fn(|| pending.pop())
            .map(|p| p.segment.unified_id)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_sources_are_merged_and_capped() {
        let mut pending = PendingHandoffs::new();
        pending.push(row(10), "node-02");
        pending.push(row(10), "node-02");
        pending.push(row(10), "node-05");
        pending.push(row(10), "node-06");

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.duplicates(), 3);
        let entry = pending.pop().unwrap();
        assert_eq!(entry.sources, vec!["node-02", "node-05"]);
        assert!(pending.pop().is_none());
    }
}
