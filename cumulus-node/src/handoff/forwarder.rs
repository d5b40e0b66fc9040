//! Replays one handed-off segment into local storage
//!
//! The source node's share is pulled one sequence at a time and each
//! sequence is re-archived locally before the next is requested.
//!
//! ```text
//! RetrieveStart ─► AwaitRetrieveReply ─► ArchiveSend ─► AwaitArchiveReply ─┐
//!                        ▲                                                 │
//!                        └──────────────── not completed ◄─────────────────┤
//!                                                                          ▼
//!                                                                        Done
//! ```

use crate::links::{DataWriter, WriterLink};
use crate::retriever::DataReader;
use bytes::Bytes;
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{SegmentRow, SegmentStatus};
use cumulus_network::{
    ArchiveRequest, DestroyRequest, FileSummary, MessageKind, ResultCode, RetrieveReply,
    RetrieveRequest, SegmentRef,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The share was copied in this many sequences
    Forwarded { sequences: u32 },
    /// The tombstone was recorded locally
    Destroyed,
    /// The source no longer holds the share; a previous run finished it
    AlreadyPurged,
}

enum ForwarderState {
    RetrieveStart,
    AwaitRetrieveReply(MessageKind),
    ArchiveSend { reply: RetrieveReply, share: Bytes },
    AwaitArchiveReply { kind: MessageKind, body: Vec<Bytes>, completed: bool },
    Done(ForwardOutcome),
}

pub struct Forwarder<'a> {
    segment: &'a SegmentRow,
    source: &'a DataReader,
    writer: &'a DataWriter,
    node_name: &'a str,
    timeout: Duration,
    retrieve_id: Uuid,
    sequence_num: u32,
    state: ForwarderState,
}

impl<'a> Forwarder<'a> {
    pub fn new(
        segment: &'a SegmentRow,
        source: &'a DataReader,
        writer: &'a DataWriter,
        node_name: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            segment,
            source,
            writer,
            node_name,
            timeout,
            retrieve_id: Uuid::new_v4(),
            sequence_num: 0,
            state: ForwarderState::RetrieveStart,
        }
    }

    pub async fn run(mut self) -> Result<ForwardOutcome> {
        loop {
            let state = std::mem::replace(&mut self.state, ForwarderState::Done(ForwardOutcome::AlreadyPurged));
            self.state = match state {
                ForwarderState::Done(outcome) => return Ok(outcome),
                ForwarderState::RetrieveStart => self.start(),
                ForwarderState::AwaitRetrieveReply(kind) => self.await_retrieve(kind).await?,
                ForwarderState::ArchiveSend { reply, share } => self.archive_send(reply, share),
                ForwarderState::AwaitArchiveReply { kind, body, completed } => {
                    match self.writer.request(kind, body, self.timeout).await {
                        Ok(_) if completed => ForwarderState::Done(self.finished_outcome()),
                        Ok(_) => ForwarderState::AwaitRetrieveReply(self.retrieve_kind(false)),
                        Err(e) => {
                            self.cancel_local().await;
                            return Err(e);
                        }
                    }
                }
            };
        }
    }

    fn finished_outcome(&self) -> ForwardOutcome {
        if self.segment.status == SegmentStatus::Tombstone {
            ForwardOutcome::Destroyed
        } else {
            ForwardOutcome::Forwarded {
                sequences: self.sequence_num,
            }
        }
    }

    fn start(&self) -> ForwarderState {
        let row = self.segment;
        if row.status == SegmentStatus::Tombstone {
            let kind = MessageKind::DestroyKey(DestroyRequest {
                collection_id: row.collection_id,
                key: row.key.clone(),
                unified_id: row.unified_id,
                unified_id_to_delete: row.file_tombstone_unified_id,
                timestamp: row.timestamp,
                segment_num: row.segment_num,
                source_node_name: row.source_node_name.clone(),
                handoff_node_name: None,
            });
            return ForwarderState::AwaitArchiveReply {
                kind,
                body: vec![],
                completed: true,
            };
        }
        ForwarderState::AwaitRetrieveReply(self.retrieve_kind(true))
    }

    fn retrieve_kind(&self, first: bool) -> MessageKind {
        let row = self.segment;
        let request = RetrieveRequest {
            retrieve_id: self.retrieve_id,
            collection_id: row.collection_id,
            key: row.key.clone(),
            unified_id: row.unified_id,
            conjoined_part: row.conjoined_part,
            segment_num: row.segment_num,
            handoff_node_name: Some(self.node_name.to_string()),
            block_offset: 0,
            block_count: None,
        };
        if first {
            MessageKind::RetrieveKeyStart(request)
        } else {
            MessageKind::RetrieveKeyNext(request)
        }
    }

    async fn await_retrieve(&mut self, kind: MessageKind) -> Result<ForwarderState> {
        let first = matches!(kind, MessageKind::RetrieveKeyStart(_));
        let message = self.source.client().request(kind, vec![], self.timeout).await;
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                if !first {
                    self.cancel_local().await;
                }
                return Err(e);
            }
        };
        let share = message.joined_body();
        let reply = match message.kind {
            MessageKind::RetrieveKeyReply(reply) => reply,
            other => {
                return Err(CumulusError::Network(format!(
                    "{} sent {} to a handoff retrieve",
                    self.source.node_name(),
                    other.name()
                )))
            }
        };

        if first && reply.result == ResultCode::NoSequenceRows {
            debug!(
                unified_id = self.segment.unified_id,
                source = self.source.node_name(),
                "Handoff source holds nothing"
            );
            return Ok(ForwarderState::Done(ForwardOutcome::AlreadyPurged));
        }
        let verified = if reply.result.is_success() {
            reply
                .segment
                .ok_or_else(|| CumulusError::Network("share without checksum".to_string()))
                .and_then(|checksum| checksum.verify(&share))
        } else {
            Err(CumulusError::Network(format!(
                "{} replied {}: {}",
                self.source.node_name(),
                reply.result,
                reply.error_message.as_deref().unwrap_or("no detail")
            )))
        };
        if let Err(e) = verified {
            if !first {
                self.cancel_local().await;
            }
            return Err(e);
        }
        Ok(ForwarderState::ArchiveSend { reply, share })
    }

    fn archive_send(&mut self, reply: RetrieveReply, share: Bytes) -> ForwarderState {
        let row = self.segment;
        let first = self.sequence_num == 0;
        let completed = reply.completed;
        let request = ArchiveRequest {
            collection_id: row.collection_id,
            key: row.key.clone(),
            unified_id: row.unified_id,
            timestamp: row.timestamp,
            conjoined_part: row.conjoined_part,
            segment_num: row.segment_num,
            sequence_num: self.sequence_num,
            zfec_padding_size: reply.zfec_padding_size,
            segment: cumulus_core::ShareChecksum::of(&share),
            source_node_name: row.source_node_name.clone(),
            handoff_node_name: None,
            file: completed.then(|| FileSummary {
                file_size: row.file_size,
                file_adler32: row.file_adler32.unwrap_or_default(),
                file_md5: row.file_md5.unwrap_or_default(),
                meta: Default::default(),
            }),
        };
        let kind = match (first, completed) {
            (true, true) => MessageKind::ArchiveKeyEntire(request),
            (true, false) => MessageKind::ArchiveKeyStart(request),
            (false, true) => MessageKind::ArchiveKeyFinal(request),
            (false, false) => MessageKind::ArchiveKeyNext(request),
        };
        self.sequence_num += 1;
        ForwarderState::AwaitArchiveReply {
            kind,
            body: vec![share],
            completed,
        }
    }

    /// Drop a partly copied share so a later run can start over
    async fn cancel_local(&self) {
        if self.sequence_num == 0 || self.segment.status == SegmentStatus::Tombstone {
            return;
        }
        let kind = MessageKind::ArchiveKeyCancel(SegmentRef::from(self.segment.segment_key()));
        match self.writer.request(kind, vec![], self.timeout).await {
            Ok(_) => info!(unified_id = self.segment.unified_id, "Cancelled partial handoff"),
            Err(e) => warn!(unified_id = self.segment.unified_id, error = %e, "Failed to cancel partial handoff"),
        }
    }
}
