//! Data reader service
//!
//! Streams a node's share of one segment back to a retriever, one stored
//! sequence per reply. A retrieve is opened by `retrieve-key-start` and
//! advanced by `retrieve-key-next` under the same retrieve id. A retrieve
//! nobody advances before its deadline is dropped.

use crate::metrics;
use bytes::Bytes;
use cumulus_core::model::SegmentSequence;
use cumulus_core::ShareChecksum;
use cumulus_network::{Message, MessageKind, ResilientServer, ResultCode, RetrieveReply, RetrieveRequest};
use cumulus_storage::Reader;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time a retrieve may sit between requests
pub const DEFAULT_RETRIEVE_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Longest pause between sweeps of abandoned retrieves
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Progress of one open retrieve
struct ActiveRetrieve {
    sequences: VecDeque<SegmentSequence>,
    skip_blocks: u64,
    remaining_blocks: Option<u64>,
    deadline: Instant,
}

pub struct DataReaderService {
    node_name: String,
    reader: Reader,
    server: ResilientServer,
    encoded_block_size: usize,
    idle_timeout: Duration,
    active: HashMap<Uuid, ActiveRetrieve>,
}

impl DataReaderService {
    pub fn new(
        node_name: impl Into<String>,
        reader: Reader,
        server: ResilientServer,
        encoded_block_size: usize,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            reader,
            server,
            encoded_block_size: encoded_block_size.max(1),
            idle_timeout: DEFAULT_RETRIEVE_IDLE_TIMEOUT,
            active: HashMap::new(),
        }
    }

    /// How long an open retrieve may wait for its next request
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn run(mut self, mut requests: mpsc::Receiver<Message>, halt: CancellationToken) {
        info!(node = %self.node_name, "Data reader started");
        let mut sweep = tokio::time::interval(self.idle_timeout.clamp(Duration::from_secs(1), SWEEP_INTERVAL));
        loop {
            let request = tokio::select! {
                _ = halt.cancelled() => break,
                _ = sweep.tick() => {
                    self.expire_abandoned();
                    continue;
                }
                next = requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            metrics::record_reader_request(request.kind.name());
            let Some((reply, body)) = self.handle(&request) else {
                continue;
            };
            if let Err(e) = self.server.send_reply(&request, reply, body).await {
                warn!(
                    node = %self.node_name,
                    client = %request.client_tag,
                    error = %e,
                    "Failed to send retrieve reply"
                );
            }
        }
        info!(node = %self.node_name, open = self.active.len(), "Data reader stopped");
    }

    /// Number of retrieves waiting for a `retrieve-key-next`
    pub fn open_retrieves(&self) -> usize {
        self.active.len()
    }

    /// Drop retrieves whose deadline has passed; returns how many
    pub fn expire_abandoned(&mut self) -> usize {
        let now = Instant::now();
        let before = self.active.len();
        self.active.retain(|_, state| state.deadline > now);
        let expired = before - self.active.len();
        if expired > 0 {
            info!(node = %self.node_name, expired, open = self.active.len(), "Dropped abandoned retrieves");
        }
        expired
    }

    pub fn handle(&mut self, request: &Message) -> Option<(MessageKind, Vec<Bytes>)> {
        self.expire_abandoned();
        let reply = match &request.kind {
            MessageKind::RetrieveKeyStart(retrieve) => self.start(retrieve),
            MessageKind::RetrieveKeyNext(retrieve) => self.next(retrieve),
            other => {
                warn!(node = %self.node_name, message_type = other.name(), "Unexpected message for data reader");
                return None;
            }
        };
        let (reply, body) = match reply {
            Ok((reply, data)) => (reply, vec![data]),
            Err(reply) => (reply, vec![]),
        };
        Some((MessageKind::RetrieveKeyReply(reply), body))
    }

    fn start(&mut self, request: &RetrieveRequest) -> Result<(RetrieveReply, Bytes), RetrieveReply> {
        if self.active.contains_key(&request.retrieve_id) {
            return Err(RetrieveReply::failure(
                ResultCode::InvalidDuplicate,
                format!("retrieve {} already open", request.retrieve_id),
            ));
        }

        let key = cumulus_core::SegmentKey::new(request.unified_id, request.conjoined_part, request.segment_num);
        let sequences = self
            .reader
            .final_sequences(&key, request.handoff_node_name.as_deref())
            .map_err(|e| RetrieveReply::failure(ResultCode::from_error(&e), e.to_string()))?;
        if sequences.is_empty() {
            debug!(node = %self.node_name, segment = %key, "No sequences to retrieve");
            return Err(RetrieveReply::failure(
                ResultCode::NoSequenceRows,
                format!("no final sequences for {}", key),
            ));
        }

        let state = ActiveRetrieve {
            sequences: sequences.into(),
            skip_blocks: request.block_offset as u64,
            remaining_blocks: request.block_count.map(u64::from),
            deadline: Instant::now() + self.idle_timeout,
        };
        self.active.insert(request.retrieve_id, state);
        self.advance(request.retrieve_id)
    }

    fn next(&mut self, request: &RetrieveRequest) -> Result<(RetrieveReply, Bytes), RetrieveReply> {
        if !self.active.contains_key(&request.retrieve_id) {
            return Err(RetrieveReply::failure(
                ResultCode::UnknownRequest,
                format!("retrieve {} is not open", request.retrieve_id),
            ));
        }
        self.advance(request.retrieve_id)
    }

    /// Produce the next reply of an open retrieve, closing it when done
    fn advance(&mut self, retrieve_id: Uuid) -> Result<(RetrieveReply, Bytes), RetrieveReply> {
        let outcome = self.next_slice(retrieve_id);
        let done = match &outcome {
            Ok((reply, _)) => reply.completed,
            Err(_) => true,
        };
        if done {
            self.active.remove(&retrieve_id);
        } else if let Some(state) = self.active.get_mut(&retrieve_id) {
            state.deadline = Instant::now() + self.idle_timeout;
        }
        outcome
    }

    fn next_slice(&mut self, retrieve_id: Uuid) -> Result<(RetrieveReply, Bytes), RetrieveReply> {
        let block_size = self.encoded_block_size as u64;
        let Some(state) = self.active.get_mut(&retrieve_id) else {
            return Err(RetrieveReply::failure(ResultCode::UnknownRequest, "retrieve closed"));
        };

        while let Some(sequence) = state.sequences.pop_front() {
            let is_last_sequence = state.sequences.is_empty();
            let blocks = sequence.size.div_ceil(block_size);

            if state.skip_blocks >= blocks && !is_last_sequence {
                state.skip_blocks -= blocks;
                continue;
            }

            let data = self
                .reader
                .read_sequence(&sequence)
                .map_err(|e| RetrieveReply::failure(ResultCode::from_error(&e), e.to_string()))?;

            let skip = state.skip_blocks.min(blocks);
            state.skip_blocks -= skip;
            let mut take = blocks - skip;
            if let Some(remaining) = state.remaining_blocks.as_mut() {
                take = take.min(*remaining);
                *remaining -= take;
            }

            let len = data.len() as u64;
            let start = (skip * block_size).min(len);
            let end = (start + take * block_size).min(len);
            let includes_last = is_last_sequence && end == len;
            let completed = is_last_sequence || state.remaining_blocks == Some(0);

            let slice = data.slice(start as usize..end as usize);
            let reply = RetrieveReply {
                result: ResultCode::Success,
                error_message: None,
                completed,
                segment: Some(ShareChecksum::of(&slice)),
                zfec_padding_size: if includes_last { sequence.zfec_padding_size } else { 0 },
            };
            debug!(
                node = %self.node_name,
                retrieve_id = %retrieve_id,
                sequence_num = sequence.sequence_num,
                bytes = slice.len(),
                completed,
                "Retrieve reply"
            );
            return Ok((reply, slice));
        }

        Err(RetrieveReply::failure(ResultCode::UnknownRequest, "retrieve already complete"))
    }
}
