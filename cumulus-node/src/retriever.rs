//! Read coordinator
//!
//! Resolves the current version of a key, then pulls shares from every
//! reachable data reader one sequence at a time. The first K verified
//! shares of each round are decoded; slower nodes keep receiving requests
//! so they stay in step for later rounds.

use crate::metrics;
use bytes::{Bytes, BytesMut};
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{CollectionId, UnifiedId};
use cumulus_core::{FileChecksum, Segmenter};
use cumulus_network::{Message, MessageKind, ResilientClient, RetrieveReply, RetrieveRequest};
use cumulus_storage::{VersionVisibility, VisibleSegment};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Client for one node's data reader
#[derive(Clone)]
pub struct DataReader {
    client: ResilientClient,
    segment_num: u8,
}

impl DataReader {
    pub fn new(client: ResilientClient, segment_num: u8) -> Self {
        Self { client, segment_num }
    }

    pub fn node_name(&self) -> &str {
        self.client.server_name()
    }

    pub fn segment_num(&self) -> u8 {
        self.segment_num
    }

    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }
}

struct Inner {
    readers: Vec<DataReader>,
    segmenter: Arc<Segmenter>,
    visibility: Arc<dyn VersionVisibility>,
    block_size: usize,
    timeout: Duration,
}

#[derive(Clone)]
pub struct Retriever {
    inner: Arc<Inner>,
}

/// Byte range of one conjoined part to pull
#[derive(Debug, Clone)]
struct PartPlan {
    segment: VisibleSegment,
    block_offset: u32,
    block_count: Option<u32>,
    /// Decoded bytes to drop from the front of the first block
    trim_front: usize,
    /// Decoded bytes to return; `None` for the rest of the part
    length: Option<u64>,
}

impl Retriever {
    pub fn new(
        readers: Vec<DataReader>,
        segmenter: Arc<Segmenter>,
        visibility: Arc<dyn VersionVisibility>,
        block_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                readers,
                segmenter,
                visibility,
                block_size: block_size.max(1),
                timeout,
            }),
        }
    }

    pub fn readers(&self) -> &[DataReader] {
        &self.inner.readers
    }

    fn visible(&self, collection_id: CollectionId, key: &str, version: Option<UnifiedId>) -> Result<Vec<VisibleSegment>> {
        let parts = self.inner.visibility.current_version(collection_id, key, version)?;
        if parts.is_empty() {
            metrics::record_retrieve_failure();
            return Err(CumulusError::RetrieveFailed(format!("not found: {}", key)));
        }
        Ok(parts)
    }

    /// Stream the whole current version of a key
    pub fn retrieve(&self, collection_id: CollectionId, key: &str, version: Option<UnifiedId>) -> Result<Retrieval> {
        let parts = self
            .visible(collection_id, key, version)?
            .into_iter()
            .map(|segment| PartPlan {
                segment,
                block_offset: 0,
                block_count: None,
                trim_front: 0,
                length: None,
            })
            .collect();
        Ok(Retrieval::new(self.clone(), parts, true))
    }

    /// Stream `length` bytes starting at `offset`
    ///
    /// Parts of a conjoined archive are laid end to end; only the blocks
    /// covering the range are fetched.
    pub fn retrieve_range(
        &self,
        collection_id: CollectionId,
        key: &str,
        version: Option<UnifiedId>,
        offset: u64,
        length: u64,
    ) -> Result<Retrieval> {
        let block_size = self.inner.block_size as u64;
        let end = offset.saturating_add(length);
        let mut parts = Vec::new();
        let mut part_start = 0u64;
        for segment in self.visible(collection_id, key, version)? {
            let part_end = part_start + segment.file_size;
            let from = offset.max(part_start);
            let to = end.min(part_end);
            if from < to {
                let local_from = from - part_start;
                let local_to = to - part_start;
                let first_block = local_from / block_size;
                let last_block = local_to.div_ceil(block_size);
                parts.push(PartPlan {
                    segment,
                    block_offset: first_block as u32,
                    block_count: Some((last_block - first_block) as u32),
                    trim_front: (local_from - first_block * block_size) as usize,
                    length: Some(local_to - local_from),
                });
            }
            part_start = part_end;
        }
        Ok(Retrieval::new(self.clone(), parts, false))
    }

    /// Retrieve the whole current version into one buffer
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn retrieve_all(&self, collection_id: CollectionId, key: &str, version: Option<UnifiedId>) -> Result<Bytes> {
        self.retrieve(collection_id, key, version)?.collect().await
    }

    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn retrieve_bytes(
        &self,
        collection_id: CollectionId,
        key: &str,
        version: Option<UnifiedId>,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.retrieve_range(collection_id, key, version, offset, length)?
            .collect()
            .await
    }
}

/// Per-part progress
struct PartRetrieval {
    plan: PartPlan,
    retrieve_id: Uuid,
    /// Indexes into the reader list still taking part
    live: Vec<usize>,
    started: bool,
    trim_front: usize,
    remaining: Option<u64>,
    checksum: FileChecksum,
}

/// A retrieve in progress; yields decoded data in order
pub struct Retrieval {
    retriever: Retriever,
    parts: VecDeque<PartPlan>,
    current: Option<PartRetrieval>,
    verify_whole: bool,
    delivered: u64,
}

impl Retrieval {
    fn new(retriever: Retriever, parts: Vec<PartPlan>, verify_whole: bool) -> Self {
        Self {
            retriever,
            parts: parts.into(),
            current: None,
            verify_whole,
            delivered: 0,
        }
    }

    /// Next decoded chunk, or `None` when everything has been returned
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.advance().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                metrics::record_retrieve(self.delivered);
                Ok(None)
            }
            Err(e) => {
                metrics::record_retrieve_failure();
                self.current = None;
                self.parts.clear();
                Err(e)
            }
        }
    }

    /// Drain into one buffer
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    async fn advance(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.current.is_none() {
                let Some(plan) = self.parts.pop_front() else {
                    return Ok(None);
                };
                if plan.segment.file_size == 0 || plan.block_count == Some(0) {
                    continue;
                }
                let live = self
                    .retriever
                    .inner
                    .readers
                    .iter()
                    .enumerate()
                    .filter(|(_, reader)| reader.connected())
                    .map(|(index, _)| index)
                    .collect();
                self.current = Some(PartRetrieval {
                    trim_front: plan.trim_front,
                    remaining: plan.length,
                    plan,
                    retrieve_id: Uuid::new_v4(),
                    live,
                    started: false,
                    checksum: FileChecksum::new(),
                });
            }

            let Some(part) = self.current.as_mut() else {
                continue;
            };
            let (mut data, completed) = self.retriever.round(part).await?;

            if part.trim_front > 0 {
                let trim = part.trim_front.min(data.len());
                data = data.slice(trim..);
                part.trim_front -= trim;
            }
            if let Some(remaining) = part.remaining.as_mut() {
                let keep = (*remaining).min(data.len() as u64);
                data.truncate(keep as usize);
                *remaining -= keep;
            }
            if self.verify_whole {
                part.checksum.update(&data);
            }

            if completed {
                if self.verify_whole {
                    verify_part(part)?;
                }
                self.current = None;
            }
            self.delivered += data.len() as u64;
            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }
}

fn verify_part(part: &mut PartRetrieval) -> Result<()> {
    let actual = std::mem::take(&mut part.checksum).finish();
    let expected = &part.plan.segment;
    if actual.size != expected.file_size {
        return Err(CumulusError::RetrieveFailed(format!(
            "decoded {} bytes, expected {}",
            actual.size, expected.file_size
        )));
    }
    if let Some(md5) = expected.file_md5 {
        if md5 != actual.md5 {
            return Err(CumulusError::RetrieveFailed(format!(
                "decoded md5 {}, expected {}",
                actual.md5, md5
            )));
        }
    }
    Ok(())
}

impl Retriever {
    /// One sequence from every live reader; decodes the first K good shares
    async fn round(&self, part: &mut PartRetrieval) -> Result<(Bytes, bool)> {
        let inner = &self.inner;
        let min_segments = inner.segmenter.min_segments();
        if part.live.len() < min_segments {
            return Err(CumulusError::RetrieveFailed(format!(
                "only {} readers available, need {}",
                part.live.len(),
                min_segments
            )));
        }

        let request = |segment_num: u8| RetrieveRequest {
            retrieve_id: part.retrieve_id,
            collection_id: part.plan.segment.collection_id,
            key: part.plan.segment.key.clone(),
            unified_id: part.plan.segment.unified_id,
            conjoined_part: part.plan.segment.conjoined_part,
            segment_num,
            handoff_node_name: None,
            block_offset: part.plan.block_offset,
            block_count: part.plan.block_count,
        };
        let started = part.started;
        let mut pending: FuturesUnordered<_> = part
            .live
            .iter()
            .map(|&index| {
                let reader = &inner.readers[index];
                let retrieve = request(reader.segment_num());
                let kind = if started {
                    MessageKind::RetrieveKeyNext(retrieve)
                } else {
                    MessageKind::RetrieveKeyStart(retrieve)
                };
                async move { (index, reader.client.request(kind, vec![], inner.timeout).await) }
            })
            .collect();
        part.started = true;

        let mut shares: Vec<(u8, Bytes)> = Vec::with_capacity(min_segments);
        let mut agreed: Option<(bool, u32)> = None;
        let mut dropped = Vec::new();
        let collect = async {
            while let Some((index, outcome)) = pending.next().await {
                let reader = &inner.readers[index];
                match accept_reply(reader, outcome) {
                    Ok((reply, share)) => {
                        let this = (reply.completed, reply.zfec_padding_size);
                        match agreed {
                            None => agreed = Some(this),
                            Some(seen) if seen != this => {
                                return Err(CumulusError::RetrieveFailed(format!(
                                    "{} disagrees on completion: {:?} vs {:?}",
                                    reader.node_name(),
                                    this,
                                    seen
                                )));
                            }
                            Some(_) => {}
                        }
                        shares.push((reader.segment_num(), share));
                        if shares.len() >= min_segments {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(node = reader.node_name(), error = %e, "Dropping reader from retrieve");
                        dropped.push(index);
                    }
                }
            }
            Err(CumulusError::RetrieveFailed(format!(
                "{} valid shares, need {}",
                shares.len(),
                min_segments
            )))
        };
        match tokio::time::timeout(inner.timeout, collect).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(CumulusError::RetrieveFailed(format!(
                    "timed out after {:?} waiting for {} shares",
                    inner.timeout, min_segments
                )))
            }
        }
        part.live.retain(|index| !dropped.contains(index));

        let (completed, padding) = agreed.unwrap_or((true, 0));
        let data = self.decode(&shares, padding as usize)?;
        debug!(
            unified_id = part.plan.segment.unified_id,
            conjoined_part = part.plan.segment.conjoined_part,
            bytes = data.len(),
            completed,
            "Decoded sequence"
        );
        Ok((data, completed))
    }

    fn decode(&self, shares: &[(u8, Bytes)], padding: usize) -> Result<Bytes> {
        let encoded_block_size = self.inner.segmenter.encoded_block_size(self.inner.block_size);
        let segments: Vec<(u8, Vec<Bytes>)> = shares
            .iter()
            .map(|(segment_num, share)| (*segment_num, split_share(share, encoded_block_size)))
            .collect();
        let blocks = self
            .inner
            .segmenter
            .decode(&segments, padding)
            .map_err(|e| CumulusError::RetrieveFailed(e.to_string()))?;
        if blocks.len() == 1 {
            return Ok(blocks[0].clone());
        }
        let mut data = BytesMut::with_capacity(blocks.iter().map(|b| b.len()).sum());
        for block in &blocks {
            data.extend_from_slice(block);
        }
        Ok(data.freeze())
    }
}

/// A verified share, or why the reader is dropped
fn accept_reply(reader: &DataReader, outcome: Result<Message>) -> Result<(RetrieveReply, Bytes)> {
    let message = outcome?;
    let share = message.joined_body();
    let name = message.kind.name();
    let MessageKind::RetrieveKeyReply(reply) = message.kind else {
        return Err(CumulusError::Network(format!(
            "{} sent {} to a retrieve",
            reader.node_name(),
            name
        )));
    };
    if !reply.result.is_success() {
        return Err(CumulusError::Network(format!(
            "{} replied {}: {}",
            reader.node_name(),
            reply.result,
            reply.error_message.as_deref().unwrap_or("no detail")
        )));
    }
    let checksum = reply
        .segment
        .ok_or_else(|| CumulusError::Network(format!("{} sent a share without checksum", reader.node_name())))?;
    checksum.verify(&share)?;
    Ok((reply, share))
}

/// Cut one node's share of a sequence back into per-block shares
fn split_share(share: &Bytes, encoded_block_size: usize) -> Vec<Bytes> {
    if share.is_empty() {
        return vec![Bytes::new()];
    }
    let step = encoded_block_size.max(1);
    (0..share.len())
        .step_by(step)
        .map(|start| share.slice(start..(start + step).min(share.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_share() {
        let share = Bytes::from_static(b"aaaabbbbcc");
        let blocks = split_share(&share, 4);
        assert_eq!(blocks, vec![
            Bytes::from_static(b"aaaa"),
            Bytes::from_static(b"bbbb"),
            Bytes::from_static(b"cc"),
        ]);
        assert_eq!(split_share(&Bytes::new(), 4), vec![Bytes::new()]);
    }

    #[test]
    fn test_decode_trims_last_block_only() {
        let segmenter = Segmenter::new(8, 10).unwrap();
        // Two full 64-byte blocks and a 20-byte tail.
        let data: Vec<u8> = (0..148u32).map(|i| (i % 251) as u8).collect();
        let blocks = cumulus_core::split_blocks(&data, 64);
        let padding = segmenter.padding_size(20);
        let encoded = segmenter.encode(&blocks).unwrap();

        let shares: Vec<(u8, Bytes)> = encoded
            .iter()
            .enumerate()
            .skip(2)
            .map(|(i, blocks)| {
                let mut joined = Vec::new();
                for block in blocks {
                    joined.extend_from_slice(block);
                }
                (i as u8 + 1, Bytes::from(joined))
            })
            .collect();

        let retriever = Retriever::new(
            Vec::new(),
            Arc::new(segmenter),
            Arc::new(NoVisibility),
            64,
            Duration::from_secs(1),
        );
        let decoded = retriever.decode(&shares, padding).unwrap();
        assert_eq!(decoded.as_ref(), data.as_slice());
    }

    struct NoVisibility;

    impl VersionVisibility for NoVisibility {
        fn current_version(&self, _: CollectionId, _: &str, _: Option<UnifiedId>) -> Result<Vec<VisibleSegment>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_missing_key_is_retrieve_failed() {
        let retriever = Retriever::new(
            Vec::new(),
            Arc::new(Segmenter::default()),
            Arc::new(NoVisibility),
            32 * 1024,
            Duration::from_secs(1),
        );
        let err = retriever.retrieve(1, "absent", None).err().unwrap();
        assert!(matches!(err, CumulusError::RetrieveFailed(_)));
        assert!(err.to_string().contains("not found"));
    }
}
