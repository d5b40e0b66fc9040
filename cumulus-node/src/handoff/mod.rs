//! Handoff subsystem
//!
//! While a node is unreachable its shares are written to backup nodes,
//! tagged with its name. Once it is back, the node asks every peer for the
//! shares held on its behalf, copies each one into local storage and tells
//! the holders to purge their copies.

pub mod forwarder;
pub mod pending_handoffs;

pub use forwarder::{ForwardOutcome, Forwarder};
pub use pending_handoffs::{PendingHandoff, PendingHandoffs};

use crate::links::{DataWriter, WriterLink};
use crate::metrics;
use crate::retriever::DataReader;
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{ConjoinedRow, SegmentKey, SegmentStatus};
use cumulus_network::{ConjoinedRequest, MessageKind, PurgeRequest, RequestHandoffs};
use cumulus_storage::Catalog;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Pause between discovery rounds
    pub polling_interval: Duration,
    /// Handoffs remembered as already forwarded
    pub cache_size: usize,
    pub request_timeout: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(60),
            cache_size: 10_000,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// What one discovery round found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub peers_asked: usize,
    pub peers_answered: usize,
    pub segments: usize,
    pub conjoined: usize,
}

struct HandoffState {
    pending: PendingHandoffs,
    recent: LruCache<SegmentKey, ()>,
}

pub struct HandoffClient {
    node_name: String,
    /// Every node's writer; the local one receives forwarded shares
    writers: Vec<DataWriter>,
    readers: Vec<DataReader>,
    catalog: Catalog,
    config: HandoffConfig,
    state: Mutex<HandoffState>,
    /// Forwards run one at a time
    forwarding: tokio::sync::Mutex<()>,
}

impl HandoffClient {
    pub fn new(
        node_name: impl Into<String>,
        writers: Vec<DataWriter>,
        readers: Vec<DataReader>,
        catalog: Catalog,
        config: HandoffConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            node_name: node_name.into(),
            writers,
            readers,
            catalog,
            config,
            state: Mutex::new(HandoffState {
                pending: PendingHandoffs::new(),
                recent: LruCache::new(capacity),
            }),
            forwarding: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn local_writer(&self) -> Result<&DataWriter> {
        self.writers
            .iter()
            .find(|w| w.node_name() == self.node_name)
            .ok_or_else(|| CumulusError::Configuration(format!("no writer for local node {}", self.node_name)))
    }

    fn writer_for(&self, node_name: &str) -> Option<&DataWriter> {
        self.writers.iter().find(|w| w.node_name() == node_name)
    }

    fn reader_for(&self, node_name: &str) -> Option<&DataReader> {
        self.readers.iter().find(|r| r.node_name() == node_name)
    }

    /// Ask every reachable peer what it holds for this node
    pub async fn discover_once(&self) -> Result<DiscoveryReport> {
        let peers: Vec<&DataWriter> = self
            .writers
            .iter()
            .filter(|w| w.node_name() != self.node_name && w.connected())
            .collect();
        let mut report = DiscoveryReport {
            peers_asked: peers.len(),
            ..Default::default()
        };

        let timeout = self.config.request_timeout;
        let replies = join_all(peers.iter().map(|peer| {
            let kind = MessageKind::RequestHandoffs(RequestHandoffs {
                node_name: self.node_name.clone(),
            });
            async move { (peer.node_name(), peer.request(kind, vec![], timeout).await) }
        }))
        .await;

        let mut conjoined: Vec<(ConjoinedRow, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            for (peer, reply) in replies {
                let reply = match reply.map(|m| m.kind) {
                    Ok(MessageKind::RequestHandoffsReply(reply)) => reply,
                    Ok(other) => {
                        warn!(peer, message_type = other.name(), "Unexpected handoff reply");
                        continue;
                    }
                    Err(e) => {
                        warn!(peer, error = %e, "Handoff discovery failed");
                        continue;
                    }
                };
                report.peers_answered += 1;
                report.segments += reply.segments.len();
                report.conjoined += reply.conjoined.len();
                for segment in reply.segments {
                    state.pending.push(segment, &reply.node_name);
                }
                conjoined.extend(reply.conjoined.into_iter().map(|row| (row, reply.node_name.clone())));
            }
            metrics::set_pending_handoffs(state.pending.len());
        }

        for (row, source) in conjoined {
            if let Err(e) = self.replay_conjoined(&row, &source).await {
                warn!(unified_id = row.unified_id, source = %source, error = %e, "Conjoined handoff failed");
            }
        }

        if report.segments > 0 || report.conjoined > 0 {
            info!(
                node = %self.node_name,
                segments = report.segments,
                conjoined = report.conjoined,
                peers = report.peers_answered,
                "Discovered handoffs"
            );
        }
        Ok(report)
    }

    /// Apply a conjoined archive's lifecycle locally, then purge the source
    async fn replay_conjoined(&self, row: &ConjoinedRow, source: &str) -> Result<()> {
        let writer = self.local_writer()?;
        let timeout = self.config.request_timeout;
        let request = |timestamp| ConjoinedRequest {
            collection_id: row.collection_id,
            key: row.key.clone(),
            unified_id: row.unified_id,
            timestamp,
            handoff_node_name: None,
        };

        writer
            .request(MessageKind::StartConjoinedArchive(request(row.create_timestamp)), vec![], timeout)
            .await?;
        if let Some(aborted) = row.abort_timestamp {
            writer
                .request(MessageKind::AbortConjoinedArchive(request(aborted)), vec![], timeout)
                .await?;
        }
        if let Some(completed) = row.complete_timestamp {
            writer
                .request(MessageKind::FinishConjoinedArchive(request(completed)), vec![], timeout)
                .await?;
        }

        let purge = MessageKind::PurgeHandoffConjoined(PurgeRequest {
            collection_id: row.collection_id,
            unified_id: row.unified_id,
            conjoined_part: 0,
            handoff_node_name: self.node_name.clone(),
        });
        self.purge(&[source.to_string()], purge).await;
        Ok(())
    }

    /// Already in local storage, by the recent cache or the catalog
    fn already_processed(&self, key: &SegmentKey) -> Result<bool> {
        if self.state.lock().recent.get(key).is_some() {
            return Ok(true);
        }
        let stored = self.catalog.find_segments(key)?.iter().any(|row| {
            row.handoff_node_name.is_none()
                && matches!(row.status, SegmentStatus::Final | SegmentStatus::Tombstone)
        });
        if stored {
            self.state.lock().recent.put(*key, ());
        }
        Ok(stored)
    }

    /// Forward the oldest pending handoff; `None` when nothing is queued
    pub async fn forward_next(&self) -> Result<Option<ForwardOutcome>> {
        let _guard = self.forwarding.lock().await;
        let next = {
            let mut state = self.state.lock();
            let next = state.pending.pop();
            metrics::set_pending_handoffs(state.pending.len());
            next
        };
        let Some(handoff) = next else {
            return Ok(None);
        };
        let key = handoff.segment.segment_key();

        let outcome = if self.already_processed(&key)? {
            debug!(key = %key, "Handoff already stored; purging sources");
            ForwardOutcome::AlreadyPurged
        } else {
            match self.forward(&handoff).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    metrics::record_handoff(false);
                    return Err(e);
                }
            }
        };
        metrics::record_handoff(true);
        self.state.lock().recent.put(key, ());

        let purge = MessageKind::PurgeHandoffSegment(PurgeRequest {
            collection_id: handoff.segment.collection_id,
            unified_id: handoff.segment.unified_id,
            conjoined_part: handoff.segment.conjoined_part,
            handoff_node_name: self.node_name.clone(),
        });
        self.purge(&handoff.sources, purge).await;
        Ok(Some(outcome))
    }

    /// Try each source in turn until one copy succeeds
    async fn forward(&self, handoff: &PendingHandoff) -> Result<ForwardOutcome> {
        let writer = self.local_writer()?;
        let mut last_error = None;
        for source in &handoff.sources {
            let Some(reader) = self.reader_for(source) else {
                warn!(source = %source, "Unknown handoff source");
                continue;
            };
            let forwarder = Forwarder::new(
                &handoff.segment,
                reader,
                writer,
                &self.node_name,
                self.config.request_timeout,
            );
            match forwarder.run().await {
                Ok(outcome) => {
                    info!(
                        unified_id = handoff.segment.unified_id,
                        conjoined_part = handoff.segment.conjoined_part,
                        source = %source,
                        outcome = ?outcome,
                        "Handoff forwarded"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(unified_id = handoff.segment.unified_id, source = %source, error = %e, "Handoff from source failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CumulusError::NotFound(format!("no usable source for handoff {}", handoff.segment.unified_id))
        }))
    }

    async fn purge(&self, sources: &[String], kind: MessageKind) {
        let timeout = self.config.request_timeout;
        let purges = sources.iter().map(|source| {
            let kind = kind.clone();
            async move {
                let Some(writer) = self.writer_for(source) else {
                    warn!(source = %source, "Unknown purge target");
                    return;
                };
                match writer.request(kind, vec![], timeout).await {
                    Ok(_) => metrics::record_handoff_purge(),
                    Err(e) => warn!(source = %source, error = %e, "Purge failed"),
                }
            }
        });
        join_all(purges).await;
    }

    /// Discover and forward until halted
    pub async fn run(&self, halt: CancellationToken) {
        info!(node = %self.node_name, "Handoff client started");
        loop {
            if let Err(e) = self.discover_once().await {
                warn!(error = %e, "Handoff discovery round failed");
            }
            while !halt.is_cancelled() {
                match self.forward_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "Handoff forward failed"),
                }
            }
            tokio::select! {
                _ = halt.cancelled() => break,
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
        info!(node = %self.node_name, "Handoff client stopped");
    }
}

