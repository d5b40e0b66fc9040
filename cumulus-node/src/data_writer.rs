//! Data writer service
//!
//! Applies archive, destroy, conjoined, purge and handoff-discovery requests
//! to this node's storage. One task owns the `Writer`, so the open value file
//! and the active segment table are never touched concurrently.

use crate::metrics;
use cumulus_core::error::{CumulusError, Result};
use cumulus_network::{
    ArchiveRequest, ConjoinedRequest, HandoffsReply, Message, MessageKind, ResilientServer,
    ResultCode, ResultReply,
};
use cumulus_storage::{ConjoinedUpdate, FileFinal, NewSegment, SequenceWrite, Writer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct DataWriterService {
    node_name: String,
    writer: Writer,
    server: ResilientServer,
}

fn new_segment(request: &ArchiveRequest) -> NewSegment {
    NewSegment {
        collection_id: request.collection_id,
        key: request.key.clone(),
        unified_id: request.unified_id,
        timestamp: request.timestamp,
        conjoined_part: request.conjoined_part,
        segment_num: request.segment_num,
        source_node_name: request.source_node_name.clone(),
        handoff_node_name: request.handoff_node_name.clone(),
    }
}

fn conjoined_update(request: &ConjoinedRequest) -> ConjoinedUpdate {
    ConjoinedUpdate {
        collection_id: request.collection_id,
        key: request.key.clone(),
        unified_id: request.unified_id,
        timestamp: request.timestamp,
        handoff_node_name: request.handoff_node_name.clone(),
    }
}

impl DataWriterService {
    pub fn new(node_name: impl Into<String>, writer: Writer, server: ResilientServer) -> Self {
        Self {
            node_name: node_name.into(),
            writer,
            server,
        }
    }

    /// Handle requests until halted, then close the open value file
    pub async fn run(mut self, mut requests: mpsc::Receiver<Message>, halt: CancellationToken) {
        info!(node = %self.node_name, "Data writer started");
        loop {
            let request = tokio::select! {
                _ = halt.cancelled() => break,
                next = requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            metrics::record_writer_request(request.kind.name());
            let Some(reply) = self.handle(&request) else {
                continue;
            };
            if let Err(e) = self.server.send_reply(&request, reply, vec![]).await {
                warn!(
                    node = %self.node_name,
                    client = %request.client_tag,
                    error = %e,
                    "Failed to send reply"
                );
            }
        }

        if let Err(e) = self.writer.close() {
            error!(node = %self.node_name, error = %e, "Failed to close writer");
        }
        info!(node = %self.node_name, "Data writer stopped");
    }

    /// Apply one request; `None` for messages that get no reply
    pub fn handle(&mut self, request: &Message) -> Option<MessageKind> {
        let reply = match &request.kind {
            MessageKind::ArchiveKeyStart(archive)
            | MessageKind::ArchiveKeyNext(archive)
            | MessageKind::ArchiveKeyFinal(archive)
            | MessageKind::ArchiveKeyEntire(archive) => {
                let outcome = self.archive(&request.kind, archive, request);
                if let Err(e) = &outcome {
                    warn!(
                        node = %self.node_name,
                        message_type = request.kind.name(),
                        segment = %archive.segment_key(),
                        error = %e,
                        "Archive request failed"
                    );
                }
                MessageKind::ArchiveKeyReply(ResultReply::from_result(&outcome))
            }
            MessageKind::ArchiveKeyCancel(segment) => {
                let outcome = self.writer.cancel_active_archive(&segment.segment_key());
                MessageKind::ArchiveKeyReply(ResultReply::from_result(&outcome))
            }
            MessageKind::DestroyKey(destroy) => {
                let tombstone = NewSegment {
                    collection_id: destroy.collection_id,
                    key: destroy.key.clone(),
                    unified_id: destroy.unified_id,
                    timestamp: destroy.timestamp,
                    conjoined_part: 0,
                    segment_num: destroy.segment_num,
                    source_node_name: destroy.source_node_name.clone(),
                    handoff_node_name: destroy.handoff_node_name.clone(),
                };
                let outcome = self
                    .writer
                    .set_tombstone(&tombstone, destroy.unified_id_to_delete)
                    .and_then(|_| self.writer.sync());
                MessageKind::DestroyKeyReply(ResultReply::from_result(&outcome))
            }
            MessageKind::StartConjoinedArchive(conjoined) => {
                let outcome = self.writer.start_conjoined_archive(&conjoined_update(conjoined));
                MessageKind::ConjoinedArchiveReply(ResultReply::from_result(&outcome))
            }
            MessageKind::AbortConjoinedArchive(conjoined) => {
                let outcome = self.writer.abort_conjoined_archive(&conjoined_update(conjoined));
                MessageKind::ConjoinedArchiveReply(ResultReply::from_result(&outcome))
            }
            MessageKind::FinishConjoinedArchive(conjoined) => {
                let outcome = self.writer.finish_conjoined_archive(&conjoined_update(conjoined));
                MessageKind::ConjoinedArchiveReply(ResultReply::from_result(&outcome))
            }
            MessageKind::PurgeHandoffSegment(purge) => {
                let outcome = self.writer.purge_handoff_segment(
                    purge.collection_id,
                    purge.unified_id,
                    purge.conjoined_part,
                    &purge.handoff_node_name,
                );
                MessageKind::PurgeHandoffReply(ResultReply::from_result(&outcome))
            }
            MessageKind::PurgeHandoffConjoined(purge) => {
                let outcome = self
                    .writer
                    .purge_handoff_conjoined(purge.unified_id, &purge.handoff_node_name);
                MessageKind::PurgeHandoffReply(ResultReply::from_result(&outcome))
            }
            MessageKind::CancelActiveArchives(cancel) => {
                let outcome = self
                    .writer
                    .cancel_active_archives_from_node(&cancel.source_node_name, cancel.timestamp);
                if let Ok(count) = &outcome {
                    info!(
                        node = %self.node_name,
                        source = %cancel.source_node_name,
                        cancelled = count,
                        "Cancelled active archives from restarted node"
                    );
                }
                MessageKind::CancelActiveArchivesReply(ResultReply::from_result(&outcome))
            }
            MessageKind::RequestHandoffs(wanted) => {
                MessageKind::RequestHandoffsReply(self.handoffs_for(&wanted.node_name))
            }
            other => {
                warn!(node = %self.node_name, message_type = other.name(), "Unexpected message for data writer");
                return None;
            }
        };
        Some(reply)
    }

    fn archive(&mut self, kind: &MessageKind, archive: &ArchiveRequest, request: &Message) -> Result<()> {
        let key = archive.segment_key();
        let data = request.joined_body();
        debug!(
            node = %self.node_name,
            message_type = kind.name(),
            segment = %key,
            sequence_num = archive.sequence_num,
            bytes = data.len(),
            "Archive request"
        );

        if matches!(kind, MessageKind::ArchiveKeyStart(_) | MessageKind::ArchiveKeyEntire(_)) {
            self.writer.start_new_segment(&new_segment(archive))?;
        }

        let stored = self.writer.store_sequence(
            &key,
            SequenceWrite {
                sequence_num: archive.sequence_num,
                zfec_padding_size: archive.zfec_padding_size,
                checksum: archive.segment,
                data: &data,
            },
        );
        if let Err(e) = stored {
            // A segment that can never complete is not left active.
            if matches!(kind, MessageKind::ArchiveKeyEntire(_)) {
                self.writer.cancel_active_archive(&key)?;
            }
            return Err(e);
        }

        if matches!(kind, MessageKind::ArchiveKeyFinal(_) | MessageKind::ArchiveKeyEntire(_)) {
            let file = archive.file.clone().ok_or_else(|| {
                CumulusError::Internal(format!("{} without file summary", kind.name()))
            })?;
            self.writer.finish_new_segment(
                &key,
                FileFinal {
                    file_size: file.file_size,
                    file_adler32: file.file_adler32,
                    file_md5: file.file_md5,
                    meta: file.meta,
                },
            )?;
        }

        // Durable before the caller hears success.
        self.writer.sync()
    }

    fn handoffs_for(&self, node_name: &str) -> HandoffsReply {
        let catalog = self.writer.catalog();
        let found = catalog
            .handoff_segments_for(node_name)
            .and_then(|segments| Ok((segments, catalog.handoff_conjoined_for(node_name)?)));
        match found {
            Ok((segments, conjoined)) => {
                debug!(
                    node = %self.node_name,
                    for_node = node_name,
                    segments = segments.len(),
                    conjoined = conjoined.len(),
                    "Reporting handoffs"
                );
                HandoffsReply {
                    result: ResultCode::Success,
                    error_message: None,
                    node_name: self.node_name.clone(),
                    segments,
                    conjoined,
                }
            }
            Err(e) => HandoffsReply {
                result: ResultCode::from_error(&e),
                error_message: Some(e.to_string()),
                node_name: self.node_name.clone(),
                segments: Vec::new(),
                conjoined: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use cumulus_core::{FileChecksum, SegmentStatus, ShareChecksum};
    use cumulus_network::{
        FileSummary, MemoryNetwork, PurgeRequest, RequestHandoffs, SegmentRef, ServerConfig, Transport,
    };
    use cumulus_storage::{NodeStorage, StorageConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn service() -> (TempDir, NodeStorage, DataWriterService) {
        let dir = TempDir::new().unwrap();
        let storage = NodeStorage::open(StorageConfig::new(dir.path())).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(MemoryNetwork::new());
        let (server, _requests) = ResilientServer::bind(
            "node-01",
            "node-01/writer",
            transport,
            ServerConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let service = DataWriterService::new("node-01", storage.writer(), server);
        (dir, storage, service)
    }

    fn archive_request(sequence_num: u32, data: &[u8], handoff: Option<&str>) -> ArchiveRequest {
        ArchiveRequest {
            collection_id: 1,
            key: "photos/cat.jpg".to_string(),
            unified_id: 500,
            timestamp: Utc::now(),
            conjoined_part: 0,
            segment_num: 2,
            sequence_num,
            zfec_padding_size: 0,
            segment: ShareChecksum::of(data),
            source_node_name: "node-05".to_string(),
            handoff_node_name: handoff.map(str::to_string),
            file: None,
        }
    }

    fn result_of(reply: Option<MessageKind>) -> ResultCode {
        reply.and_then(|k| k.reply_result().map(|(r, _)| r)).unwrap()
    }

    #[tokio::test]
    async fn test_start_next_final() {
        let (_dir, storage, mut service) = service().await;
        let mut file = FileChecksum::new();

        let first = b"first share".to_vec();
        file.update(&first);
        let start = Message::new(
            MessageKind::ArchiveKeyStart(archive_request(0, &first, None)),
            vec![Bytes::from(first)],
        );
        assert_eq!(result_of(service.handle(&start)), ResultCode::Success);

        let last = b"last".to_vec();
        file.update(&last);
        let checksum = file.finish();
        let mut request = archive_request(1, &last, None);
        request.file = Some(FileSummary {
            file_size: checksum.size,
            file_adler32: checksum.adler32,
            file_md5: checksum.md5,
            meta: Default::default(),
        });
        let fin = Message::new(MessageKind::ArchiveKeyFinal(request), vec![Bytes::from(last)]);
        assert_eq!(result_of(service.handle(&fin)), ResultCode::Success);

        let rows = storage.reader().get_all_segment_rows_for_key(1, "photos/cat.jpg").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SegmentStatus::Final);
        assert_eq!(rows[0].file_size, 15);
    }

    #[tokio::test]
    async fn test_duplicate_start_and_bad_checksum() {
        let (_dir, _storage, mut service) = service().await;
        let data = Bytes::from_static(b"share");
        let start = Message::new(
            MessageKind::ArchiveKeyStart(archive_request(0, &data, None)),
            vec![data.clone()],
        );
        assert_eq!(result_of(service.handle(&start)), ResultCode::Success);
        let again = Message::new(start.kind.clone(), vec![data.clone()]);
        assert_eq!(result_of(service.handle(&again)), ResultCode::DuplicateSegment);

        let mut bad = archive_request(1, &data, None);
        bad.segment.md5 = cumulus_core::Md5Digest::compute(b"other");
        let next = Message::new(MessageKind::ArchiveKeyNext(bad), vec![data]);
        assert_eq!(result_of(service.handle(&next)), ResultCode::Md5Mismatch);

        let orphan = Message::new(
            MessageKind::ArchiveKeyNext(ArchiveRequest {
                unified_id: 999,
                ..archive_request(1, b"x", None)
            }),
            vec![Bytes::from_static(b"x")],
        );
        assert_eq!(result_of(service.handle(&orphan)), ResultCode::SegmentNotActive);
    }

    #[tokio::test]
    async fn test_cancel_then_handoff_listing_and_purge() {
        let (_dir, storage, mut service) = service().await;
        let data = Bytes::from_static(b"held for node-02");

        let start = Message::new(
            MessageKind::ArchiveKeyStart(archive_request(0, &data, None)),
            vec![data.clone()],
        );
        service.handle(&start);
        let cancel = Message::new(
            MessageKind::ArchiveKeyCancel(SegmentRef::from(archive_request(0, &data, None).segment_key())),
            vec![],
        );
        assert_eq!(result_of(service.handle(&cancel)), ResultCode::Success);
        let rows = storage.reader().get_all_segment_rows_for_key(1, "photos/cat.jpg").unwrap();
        assert_eq!(rows[0].status, SegmentStatus::Cancelled);

        let mut held = archive_request(0, &data, Some("node-02"));
        held.unified_id = 600;
        held.file = Some(FileSummary::default());
        let entire = Message::new(MessageKind::ArchiveKeyEntire(held), vec![data]);
        assert_eq!(result_of(service.handle(&entire)), ResultCode::Success);

        let listing = Message::new(
            MessageKind::RequestHandoffs(RequestHandoffs {
                node_name: "node-02".to_string(),
            }),
            vec![],
        );
        match service.handle(&listing) {
            Some(MessageKind::RequestHandoffsReply(reply)) => {
                assert_eq!(reply.node_name, "node-01");
                assert_eq!(reply.segments.len(), 1);
                assert_eq!(reply.segments[0].unified_id, 600);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let purge = Message::new(
            MessageKind::PurgeHandoffSegment(PurgeRequest {
                collection_id: 1,
                unified_id: 600,
                conjoined_part: 0,
                handoff_node_name: "node-02".to_string(),
            }),
            vec![],
        );
        assert_eq!(result_of(service.handle(&purge)), ResultCode::Success);
        assert!(storage.catalog.handoff_segments_for("node-02").unwrap().is_empty());
    }
}
