//! Links from the write coordinator to the cluster's data writers
//!
//! Each segment number maps to one link. A reachable node gets a direct
//! link; an unreachable one gets a handoff link that sends the same
//! requests, tagged with the missing node's name, to two backup nodes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::UnifiedId;
use cumulus_network::{CancelActiveArchives, Message, MessageKind, ResilientClient};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait WriterLink: Send + Sync {
    /// Node whose share this link carries
    fn node_name(&self) -> &str;

    fn segment_num(&self) -> u8;

    /// True when the share goes to backup nodes instead of its owner
    fn is_handoff(&self) -> bool {
        false
    }

    /// Send a request and wait for a successful reply
    async fn request(&self, kind: MessageKind, body: Vec<Bytes>, timeout: Duration) -> Result<Message>;
}

/// Turn a reply with a failure result into an error
pub fn check_reply(node_name: &str, reply: Message) -> Result<Message> {
    match reply.kind.reply_result() {
        Some((result, _)) if result.is_success() => Ok(reply),
        Some((result, error_message)) => Err(CumulusError::Network(format!(
            "{} replied {} to {}: {}",
            node_name,
            result,
            reply.kind.name(),
            error_message.unwrap_or("no detail")
        ))),
        None => Err(CumulusError::Network(format!(
            "{} sent unexpected {}",
            node_name,
            reply.kind.name()
        ))),
    }
}

/// Direct link to one node's data writer
#[derive(Clone)]
pub struct DataWriter {
    client: ResilientClient,
    segment_num: u8,
}

impl DataWriter {
    pub fn new(client: ResilientClient, segment_num: u8) -> Self {
        Self { client, segment_num }
    }

    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }
}

#[async_trait]
impl WriterLink for DataWriter {
    fn node_name(&self) -> &str {
        self.client.server_name()
    }

    fn segment_num(&self) -> u8 {
        self.segment_num
    }

    async fn request(&self, kind: MessageKind, body: Vec<Bytes>, timeout: Duration) -> Result<Message> {
        let reply = self.client.request(kind, body, timeout).await?;
        check_reply(self.node_name(), reply)
    }
}

/// Mark a request as held on behalf of `node_name`
fn with_handoff(kind: MessageKind, node_name: &str) -> MessageKind {
    let handoff = Some(node_name.to_string());
    match kind {
        MessageKind::ArchiveKeyStart(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::ArchiveKeyStart(r)
        }
        MessageKind::ArchiveKeyNext(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::ArchiveKeyNext(r)
        }
        MessageKind::ArchiveKeyFinal(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::ArchiveKeyFinal(r)
        }
        MessageKind::ArchiveKeyEntire(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::ArchiveKeyEntire(r)
        }
        MessageKind::DestroyKey(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::DestroyKey(r)
        }
        MessageKind::StartConjoinedArchive(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::StartConjoinedArchive(r)
        }
        MessageKind::AbortConjoinedArchive(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::AbortConjoinedArchive(r)
        }
        MessageKind::FinishConjoinedArchive(mut r) => {
            r.handoff_node_name = handoff;
            MessageKind::FinishConjoinedArchive(r)
        }
        other => other,
    }
}

/// Stores a missing node's share on two backup nodes
pub struct HandoffWriter {
    node_name: String,
    segment_num: u8,
    backups: Vec<DataWriter>,
}

impl HandoffWriter {
    pub fn new(node_name: impl Into<String>, segment_num: u8, backups: Vec<DataWriter>) -> Self {
        Self {
            node_name: node_name.into(),
            segment_num,
            backups,
        }
    }

    pub fn backup_names(&self) -> Vec<&str> {
        self.backups.iter().map(|b| b.node_name()).collect()
    }
}

#[async_trait]
impl WriterLink for HandoffWriter {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    fn segment_num(&self) -> u8 {
        self.segment_num
    }

    fn is_handoff(&self) -> bool {
        true
    }

    /// Succeeds only when every backup stored the request
    async fn request(&self, kind: MessageKind, body: Vec<Bytes>, timeout: Duration) -> Result<Message> {
        let kind = with_handoff(kind, &self.node_name);
        let replies = join_all(
            self.backups
                .iter()
                .map(|backup| backup.request(kind.clone(), body.clone(), timeout)),
        )
        .await;

        let mut last = None;
        for reply in replies {
            last = Some(reply?);
        }
        last.ok_or_else(|| CumulusError::Internal(format!("no backups for {}", self.node_name)))
    }
}

/// Every data writer in the cluster, in segment-number order
#[derive(Clone)]
pub struct ClusterWriters {
    local_node: String,
    min_connected: usize,
    writers: Vec<DataWriter>,
}

impl ClusterWriters {
    pub fn new(local_node: impl Into<String>, min_connected: usize, writers: Vec<DataWriter>) -> Self {
        Self {
            local_node: local_node.into(),
            min_connected,
            writers,
        }
    }

    pub fn writers(&self) -> &[DataWriter] {
        &self.writers
    }

    pub fn connected_count(&self) -> usize {
        self.writers.iter().filter(|w| w.connected()).count()
    }

    /// One link per segment number for a new archive
    ///
    /// Unreachable nodes are covered by handoff links to two reachable
    /// nodes picked at random.
    pub fn select(&self) -> Result<Vec<Arc<dyn WriterLink>>> {
        self.select_with(&mut rand::thread_rng())
    }

    /// Like [`ClusterWriters::select`], but every call for the same unified
    /// id picks the same backups while the set of reachable nodes is
    /// unchanged. Conjoined archives use this so their start, parts and
    /// finish land on one pair of backups.
    pub fn select_for(&self, unified_id: UnifiedId) -> Result<Vec<Arc<dyn WriterLink>>> {
        self.select_with(&mut StdRng::seed_from_u64(unified_id))
    }

    fn select_with<R: Rng>(&self, rng: &mut R) -> Result<Vec<Arc<dyn WriterLink>>> {
        let connected: Vec<&DataWriter> = self.writers.iter().filter(|w| w.connected()).collect();
        crate::metrics::set_connected_writers(connected.len());
        if connected.len() < self.min_connected || connected.len() < 2 {
            return Err(CumulusError::QuorumNotMet {
                achieved: connected.len(),
                required: self.min_connected,
            });
        }

        let links = self
            .writers
            .iter()
            .map(|writer| -> Arc<dyn WriterLink> {
                if writer.connected() {
                    return Arc::new(writer.clone());
                }
                let backups: Vec<DataWriter> = connected
                    .choose_multiple(&mut *rng, 2)
                    .map(|w| (*w).clone())
                    .collect();
                let handoff = HandoffWriter::new(writer.node_name(), writer.segment_num(), backups);
                debug!(
                    node = writer.node_name(),
                    backups = ?handoff.backup_names(),
                    "Using handoff for unreachable writer"
                );
                Arc::new(handoff)
            })
            .collect();
        Ok(links)
    }

    /// Tell every data writer to drop archives this node had in flight
    /// before `started_at`
    pub fn announce_startup(&self, started_at: DateTime<Utc>, timeout: Duration) {
        for writer in &self.writers {
            let writer = writer.clone();
            let kind = MessageKind::CancelActiveArchives(CancelActiveArchives {
                source_node_name: self.local_node.clone(),
                timestamp: started_at,
            });
            tokio::spawn(async move {
                match writer.request(kind, vec![], timeout).await {
                    Ok(_) => info!(node = writer.node_name(), "Startup announced"),
                    Err(e) => warn!(node = writer.node_name(), error = %e, "Startup announcement failed"),
                }
            });
        }
    }
}
