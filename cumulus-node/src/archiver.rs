//! Write coordinator
//!
//! Cuts incoming data into blocks, erasure-codes every block into one share
//! per node and sends the shares out as numbered sequences. Any failure
//! cancels the archive on every node and fails the whole upload.
//!
//! ```text
//! write() ──► buffer ──► whole blocks ──► Segmenter ──► share i ──► link i
//!                                                                  (direct or handoff)
//! finish() ─► last block + padding ──────────────────► final / entire
//! ```

use crate::links::{ClusterWriters, WriterLink};
use crate::metrics;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{CollectionId, UnifiedId};
use cumulus_core::{split_blocks, FileChecksum, Segmenter, ShareChecksum, UnifiedIdFactory};
use cumulus_network::{
    ArchiveRequest, ConjoinedRequest, DestroyRequest, FileSummary, MessageKind, SegmentRef,
};
use cumulus_storage::VersionVisibility;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// What is being archived
#[derive(Debug, Clone, Default)]
pub struct ArchiveSpec {
    pub collection_id: CollectionId,
    pub key: String,
    pub conjoined_part: u32,
    /// Set for parts of a conjoined archive; a fresh id is assigned otherwise
    pub unified_id: Option<UnifiedId>,
    pub meta: BTreeMap<String, String>,
}

impl ArchiveSpec {
    pub fn new(collection_id: CollectionId, key: impl Into<String>) -> Self {
        Self {
            collection_id,
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Result of a completed archive
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOutcome {
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    /// Size and checksums of the unencoded data
    pub checksum: ShareChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveState {
    Start,
    Streaming,
    Done,
    Failed,
}

/// One archive in progress
pub struct ArchiveSession {
    links: Vec<Arc<dyn WriterLink>>,
    segmenter: Arc<Segmenter>,
    spec: ArchiveSpec,
    unified_id: UnifiedId,
    timestamp: DateTime<Utc>,
    source_node_name: String,
    block_size: usize,
    timeout: Duration,
    state: ArchiveState,
    sequence_num: u32,
    buffer: Vec<u8>,
    checksum: FileChecksum,
    started: Instant,
}

impl ArchiveSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        links: Vec<Arc<dyn WriterLink>>,
        segmenter: Arc<Segmenter>,
        spec: ArchiveSpec,
        unified_id: UnifiedId,
        source_node_name: String,
        block_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            links,
            segmenter,
            spec,
            unified_id,
            timestamp: Utc::now(),
            source_node_name,
            block_size: block_size.max(1),
            timeout,
            state: ArchiveState::Start,
            sequence_num: 0,
            buffer: Vec::new(),
            checksum: FileChecksum::new(),
            started: Instant::now(),
        }
    }

    pub fn unified_id(&self) -> UnifiedId {
        self.unified_id
    }

    /// Bytes accepted so far
    pub fn size(&self) -> u64 {
        self.checksum.size()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ArchiveState::Start | ArchiveState::Streaming => Ok(()),
            ArchiveState::Done => Err(CumulusError::ArchiveFailed("archive already finished".to_string())),
            ArchiveState::Failed => Err(CumulusError::ArchiveFailed("archive was cancelled".to_string())),
        }
    }

    /// Accept more data; whole blocks go out as soon as they are known not
    /// to be the last one
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.checksum.update(data);
        self.buffer.extend_from_slice(data);

        if self.buffer.len() <= self.block_size {
            return Ok(());
        }
        // Keep at least one byte back for the final sequence.
        let ready = (self.buffer.len() - 1) / self.block_size * self.block_size;
        let chunk: Vec<u8> = self.buffer.drain(..ready).collect();
        self.send_sequence(&chunk, None).await
    }

    /// Send the remaining data with the file's checksums
    ///
    /// `declared` is what the uploader claims the data to be; a mismatch
    /// cancels the archive.
    pub async fn finish(mut self, declared: Option<ShareChecksum>) -> Result<ArchiveOutcome> {
        self.ensure_open()?;
        let actual = std::mem::take(&mut self.checksum).finish();

        if let Some(declared) = declared {
            let mismatch = if declared.size != actual.size {
                Some(format!("size declared {}, actual {}", declared.size, actual.size))
            } else if declared.adler32 != actual.adler32 {
                Some(format!("adler32 declared {}, actual {}", declared.adler32, actual.adler32))
            } else if declared.md5 != actual.md5 {
                Some(format!("md5 declared {}, actual {}", declared.md5, actual.md5))
            } else {
                None
            };
            if let Some(reason) = mismatch {
                return Err(self.fail(reason).await);
            }
        }

        let remaining = std::mem::take(&mut self.buffer);
        let file = FileSummary {
            file_size: actual.size,
            file_adler32: actual.adler32,
            file_md5: actual.md5,
            meta: self.spec.meta.clone(),
        };
        self.send_sequence(&remaining, Some(file)).await?;

        self.state = ArchiveState::Done;
        metrics::record_archive(actual.size, self.started.elapsed());
        info!(
            key = %self.spec.key,
            unified_id = self.unified_id,
            conjoined_part = self.spec.conjoined_part,
            size = actual.size,
            sequences = self.sequence_num,
            "Archive complete"
        );
        Ok(ArchiveOutcome {
            unified_id: self.unified_id,
            timestamp: self.timestamp,
            checksum: actual,
        })
    }

    /// Abandon the archive on every node
    pub async fn cancel(mut self) {
        if self.ensure_open().is_ok() {
            self.fail("cancelled by caller".to_string()).await;
        }
    }

    async fn send_sequence(&mut self, data: &[u8], file: Option<FileSummary>) -> Result<()> {
        let blocks = split_blocks(data, self.block_size);
        let padding = match (&file, blocks.last()) {
            (Some(_), Some(last)) => self.segmenter.padding_size(last.len()) as u32,
            _ => 0,
        };
        let encoded = match self.segmenter.encode(&blocks) {
            Ok(encoded) => encoded,
            Err(e) => return Err(self.fail(e.to_string()).await),
        };

        let first = self.state == ArchiveState::Start;
        let mut requests = Vec::with_capacity(self.links.len());
        let mut missing = None;
        for link in &self.links {
            let shares = (link.segment_num() as usize)
                .checked_sub(1)
                .and_then(|index| encoded.get(index));
            let Some(shares) = shares else {
                missing = Some(link.segment_num());
                break;
            };
            let share = join_shares(shares);
            let request = ArchiveRequest {
                collection_id: self.spec.collection_id,
                key: self.spec.key.clone(),
                unified_id: self.unified_id,
                timestamp: self.timestamp,
                conjoined_part: self.spec.conjoined_part,
                segment_num: link.segment_num(),
                sequence_num: self.sequence_num,
                zfec_padding_size: padding,
                segment: ShareChecksum::of(&share),
                source_node_name: self.source_node_name.clone(),
                handoff_node_name: None,
                file: file.clone(),
            };
            let kind = match (first, file.is_some()) {
                (true, true) => MessageKind::ArchiveKeyEntire(request),
                (true, false) => MessageKind::ArchiveKeyStart(request),
                (false, true) => MessageKind::ArchiveKeyFinal(request),
                (false, false) => MessageKind::ArchiveKeyNext(request),
            };
            requests.push((link.clone(), kind, vec![share]));
        }
        if let Some(segment_num) = missing {
            return Err(self.fail(format!("no share for segment {}", segment_num)).await);
        }

        debug!(
            key = %self.spec.key,
            unified_id = self.unified_id,
            sequence_num = self.sequence_num,
            blocks = blocks.len(),
            "Sending sequence"
        );
        if let Err(reason) = self.send_to_all(requests).await {
            return Err(self.fail(reason).await);
        }
        self.state = ArchiveState::Streaming;
        self.sequence_num += 1;
        Ok(())
    }

    async fn send_to_all(&self, requests: Vec<(Arc<dyn WriterLink>, MessageKind, Vec<Bytes>)>) -> std::result::Result<(), String> {
        let timeout = self.timeout;
        let sends = requests.into_iter().map(|(link, kind, body)| async move {
            let name = kind.name();
            link.request(kind, body, timeout)
                .await
                .map_err(|e| format!("{} {}: {}", link.node_name(), name, e))
        });
        match tokio::time::timeout(timeout, join_all(sends)).await {
            Ok(results) => results.into_iter().collect::<std::result::Result<Vec<_>, _>>().map(|_| ()),
            Err(_) => Err(format!("no complete set of replies within {:?}", timeout)),
        }
    }

    /// Cancel on every node and produce the caller's error
    async fn fail(&mut self, reason: String) -> CumulusError {
        warn!(key = %self.spec.key, unified_id = self.unified_id, reason = %reason, "Archive failed");
        self.state = ArchiveState::Failed;
        metrics::record_archive_failure();
        broadcast_cancel(&self.links, self.segment_ref_base(), self.timeout).await;
        CumulusError::ArchiveFailed(reason)
    }

    fn segment_ref_base(&self) -> (UnifiedId, u32) {
        (self.unified_id, self.spec.conjoined_part)
    }
}

impl Drop for ArchiveSession {
    fn drop(&mut self) {
        if !matches!(self.state, ArchiveState::Start | ArchiveState::Streaming) || self.sequence_num == 0 {
            return;
        }
        // Dropped mid-stream; nodes would otherwise keep the segment active.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let links = std::mem::take(&mut self.links);
            let base = self.segment_ref_base();
            let timeout = self.timeout;
            handle.spawn(async move { broadcast_cancel(&links, base, timeout).await });
        }
    }
}

fn join_shares(shares: &[Bytes]) -> Bytes {
    if shares.len() == 1 {
        return shares[0].clone();
    }
    let mut joined = Vec::with_capacity(shares.iter().map(|s| s.len()).sum());
    for share in shares {
        joined.extend_from_slice(share);
    }
    Bytes::from(joined)
}

async fn broadcast_cancel(links: &[Arc<dyn WriterLink>], (unified_id, conjoined_part): (UnifiedId, u32), timeout: Duration) {
    let cancels = links.iter().map(|link| {
        let kind = MessageKind::ArchiveKeyCancel(SegmentRef {
            unified_id,
            conjoined_part,
            segment_num: link.segment_num(),
        });
        async move {
            if let Err(e) = link.request(kind, vec![], timeout).await {
                debug!(node = link.node_name(), error = %e, "Cancel not delivered");
            }
        }
    });
    join_all(cancels).await;
}

/// Entry point for archives, deletes and conjoined uploads
#[derive(Clone)]
pub struct Archiver {
    node_name: String,
    writers: ClusterWriters,
    segmenter: Arc<Segmenter>,
    ids: Arc<UnifiedIdFactory>,
    visibility: Arc<dyn VersionVisibility>,
    block_size: usize,
    timeout: Duration,
}

impl Archiver {
    pub fn new(
        node_name: impl Into<String>,
        writers: ClusterWriters,
        segmenter: Arc<Segmenter>,
        ids: Arc<UnifiedIdFactory>,
        visibility: Arc<dyn VersionVisibility>,
        block_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            writers,
            segmenter,
            ids,
            visibility,
            block_size,
            timeout,
        }
    }

    pub fn writers(&self) -> &ClusterWriters {
        &self.writers
    }

    /// Open an archive; fails fast when too few writers are reachable
    pub fn begin(&self, spec: ArchiveSpec) -> Result<ArchiveSession> {
        // Parts of a conjoined archive share its backups.
        let (links, unified_id) = match spec.unified_id {
            Some(unified_id) => (self.writers.select_for(unified_id)?, unified_id),
            None => (self.writers.select()?, self.ids.next_id()),
        };
        let handoffs = links.iter().filter(|link| link.is_handoff()).count();
        debug!(key = %spec.key, unified_id, handoffs, "Archive started");
        Ok(ArchiveSession::new(
            links,
            self.segmenter.clone(),
            spec,
            unified_id,
            self.node_name.clone(),
            self.block_size,
            self.timeout,
        ))
    }

    /// Archive a complete buffer
    #[instrument(skip(self, spec, data), fields(key = %spec.key, size = data.len()))]
    pub async fn archive_entire(&self, spec: ArchiveSpec, data: &[u8]) -> Result<ArchiveOutcome> {
        let mut session = self.begin(spec)?;
        session.write(data).await?;
        session.finish(None).await
    }

    /// Write a tombstone for the current version of a key, or for
    /// `unified_id_to_delete` when given
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn destroy(
        &self,
        collection_id: CollectionId,
        key: &str,
        unified_id_to_delete: Option<UnifiedId>,
    ) -> Result<UnifiedId> {
        let visible = self
            .visibility
            .current_version(collection_id, key, unified_id_to_delete)?;
        if visible.is_empty() {
            return Err(CumulusError::NotFound(format!("{} in collection {}", key, collection_id)));
        }

        let links = self.writers.select()?;
        let unified_id = self.ids.next_id();
        let timestamp = Utc::now();
        let requests = links.iter().map(|link| {
            let kind = MessageKind::DestroyKey(DestroyRequest {
                collection_id,
                key: key.to_string(),
                unified_id,
                unified_id_to_delete,
                timestamp,
                segment_num: link.segment_num(),
                source_node_name: self.node_name.clone(),
                handoff_node_name: None,
            });
            (link.clone(), kind)
        });
        self.broadcast(requests.collect()).await?;
        info!(unified_id, "Key destroyed");
        Ok(unified_id)
    }

    /// Open a multi-part upload; parts are archived under the returned id
    pub async fn start_conjoined(&self, collection_id: CollectionId, key: &str) -> Result<UnifiedId> {
        let unified_id = self.ids.next_id();
        self.conjoined(collection_id, key, unified_id, MessageKind::StartConjoinedArchive)
            .await?;
        Ok(unified_id)
    }

    pub async fn abort_conjoined(&self, collection_id: CollectionId, key: &str, unified_id: UnifiedId) -> Result<()> {
        self.conjoined(collection_id, key, unified_id, MessageKind::AbortConjoinedArchive)
            .await
    }

    pub async fn finish_conjoined(&self, collection_id: CollectionId, key: &str, unified_id: UnifiedId) -> Result<()> {
        self.conjoined(collection_id, key, unified_id, MessageKind::FinishConjoinedArchive)
            .await
    }

    async fn conjoined(
        &self,
        collection_id: CollectionId,
        key: &str,
        unified_id: UnifiedId,
        make: fn(ConjoinedRequest) -> MessageKind,
    ) -> Result<()> {
        let links = self.writers.select_for(unified_id)?;
        let request = ConjoinedRequest {
            collection_id,
            key: key.to_string(),
            unified_id,
            timestamp: Utc::now(),
            handoff_node_name: None,
        };
        let requests = links
            .iter()
            .map(|link| (link.clone(), make(request.clone())))
            .collect();
        self.broadcast(requests).await
    }

    async fn broadcast(&self, requests: Vec<(Arc<dyn WriterLink>, MessageKind)>) -> Result<()> {
        let timeout = self.timeout;
        let sends = requests
            .into_iter()
            .map(|(link, kind)| async move { link.request(kind, vec![], timeout).await });
        let results = tokio::time::timeout(timeout, join_all(sends))
            .await
            .map_err(|_| CumulusError::Timeout {
                what: "writer replies".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            })?;
        results.into_iter().try_for_each(|r| r.map(|_| ()))
    }
}
