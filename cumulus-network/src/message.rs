//! Wire messages
//!
//! A message is a control record plus zero or more opaque body segments.
//! The control record is JSON with a `message-type` tag; on the wire the
//! control bytes and body segments travel together in one bincode frame.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::model::{CollectionId, ConjoinedRow, SegmentKey, SegmentRow, UnifiedId};
use cumulus_core::{Md5Digest, ShareChecksum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Outcome tag echoed in every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCode {
    Success,
    SizeMismatch,
    Md5Mismatch,
    Adler32Mismatch,
    DuplicateSegment,
    SegmentNotActive,
    NoSequenceRows,
    InvalidDuplicate,
    UnknownRequest,
    NotFound,
    Exception,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }

    /// Map a local failure onto the tag sent back to the caller
    pub fn from_error(err: &CumulusError) -> Self {
        match err {
            CumulusError::SizeMismatch { .. } => ResultCode::SizeMismatch,
            CumulusError::Md5Mismatch(_) => ResultCode::Md5Mismatch,
            CumulusError::Adler32Mismatch { .. } => ResultCode::Adler32Mismatch,
            CumulusError::DuplicateSegment(_) => ResultCode::DuplicateSegment,
            CumulusError::SegmentNotActive(_) => ResultCode::SegmentNotActive,
            CumulusError::NotFound(_) => ResultCode::NotFound,
            _ => ResultCode::Exception,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Success => "success",
            ResultCode::SizeMismatch => "size-mismatch",
            ResultCode::Md5Mismatch => "md5-mismatch",
            ResultCode::Adler32Mismatch => "adler32-mismatch",
            ResultCode::DuplicateSegment => "duplicate-segment",
            ResultCode::SegmentNotActive => "segment-not-active",
            ResultCode::NoSequenceRows => "no-sequence-rows",
            ResultCode::InvalidDuplicate => "invalid-duplicate",
            ResultCode::UnknownRequest => "unknown-request",
            ResultCode::NotFound => "not-found",
            ResultCode::Exception => "exception",
        };
        f.write_str(text)
    }
}

/// `result` / `error-message` pair carried by plain replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultReply {
    pub result: ResultCode,
    pub error_message: Option<String>,
}

impl ResultReply {
    pub fn success() -> Self {
        Self {
            result: ResultCode::Success,
            error_message: None,
        }
    }

    pub fn failure(result: ResultCode, error_message: impl Into<String>) -> Self {
        Self {
            result,
            error_message: Some(error_message.into()),
        }
    }

    pub fn from_result<T>(outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => Self::success(),
            Err(e) => Self::failure(ResultCode::from_error(e), e.to_string()),
        }
    }
}

/// Resilient-server acknowledgement of a received request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ack {
    pub incoming_type: String,
    pub accepted: bool,
}

/// File-level values sent with the last share of an archive
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileSummary {
    pub file_size: u64,
    pub file_adler32: u32,
    pub file_md5: Md5Digest,
    pub meta: BTreeMap<String, String>,
}

/// One share of an archive; the share bytes are the message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveRequest {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    pub conjoined_part: u32,
    pub segment_num: u8,
    pub sequence_num: u32,
    pub zfec_padding_size: u32,
    pub segment: ShareChecksum,
    pub source_node_name: String,
    pub handoff_node_name: Option<String>,
    pub file: Option<FileSummary>,
}

impl ArchiveRequest {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.unified_id, self.conjoined_part, self.segment_num)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SegmentRef {
    pub unified_id: UnifiedId,
    pub conjoined_part: u32,
    pub segment_num: u8,
}

impl From<SegmentKey> for SegmentRef {
    fn from(key: SegmentKey) -> Self {
        Self {
            unified_id: key.unified_id,
            conjoined_part: key.conjoined_part,
            segment_num: key.segment_num,
        }
    }
}

impl SegmentRef {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.unified_id, self.conjoined_part, self.segment_num)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestroyRequest {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub unified_id_to_delete: Option<UnifiedId>,
    pub timestamp: DateTime<Utc>,
    pub segment_num: u8,
    pub source_node_name: String,
    pub handoff_node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConjoinedRequest {
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub timestamp: DateTime<Utc>,
    pub handoff_node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PurgeRequest {
    pub collection_id: CollectionId,
    pub unified_id: UnifiedId,
    /// Part whose shares are purged; conjoined purges ignore it
    pub conjoined_part: u32,
    pub handoff_node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CancelActiveArchives {
    pub source_node_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequestHandoffs {
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HandoffsReply {
    pub result: ResultCode,
    pub error_message: Option<String>,
    pub node_name: String,
    pub segments: Vec<SegmentRow>,
    pub conjoined: Vec<ConjoinedRow>,
}

/// Request for one segment's share, optionally limited to a block range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveRequest {
    pub retrieve_id: Uuid,
    pub collection_id: CollectionId,
    pub key: String,
    pub unified_id: UnifiedId,
    pub conjoined_part: u32,
    pub segment_num: u8,
    pub handoff_node_name: Option<String>,
    /// Encoded blocks to skip before the first one returned
    pub block_offset: u32,
    /// Encoded blocks to return in total; `None` for all remaining
    pub block_count: Option<u32>,
}

/// One sequence worth of share data; the bytes are the message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveReply {
    pub result: ResultCode,
    pub error_message: Option<String>,
    pub completed: bool,
    pub segment: Option<ShareChecksum>,
    pub zfec_padding_size: u32,
}

impl RetrieveReply {
    pub fn failure(result: ResultCode, error_message: impl Into<String>) -> Self {
        Self {
            result,
            error_message: Some(error_message.into()),
            completed: true,
            segment: None,
            zfec_padding_size: 0,
        }
    }
}

/// Every message kind exchanged between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message-type", rename_all = "kebab-case")]
pub enum MessageKind {
    ResilientServerHandshake,
    ResilientServerSignoff,
    ResilientServerAck(Ack),
    Ping,

    ArchiveKeyStart(ArchiveRequest),
    ArchiveKeyNext(ArchiveRequest),
    ArchiveKeyFinal(ArchiveRequest),
    ArchiveKeyEntire(ArchiveRequest),
    ArchiveKeyCancel(SegmentRef),
    ArchiveKeyReply(ResultReply),

    DestroyKey(DestroyRequest),
    DestroyKeyReply(ResultReply),

    StartConjoinedArchive(ConjoinedRequest),
    AbortConjoinedArchive(ConjoinedRequest),
    FinishConjoinedArchive(ConjoinedRequest),
    ConjoinedArchiveReply(ResultReply),

    PurgeHandoffSegment(PurgeRequest),
    PurgeHandoffConjoined(PurgeRequest),
    PurgeHandoffReply(ResultReply),

    CancelActiveArchives(CancelActiveArchives),
    CancelActiveArchivesReply(ResultReply),

    RequestHandoffs(RequestHandoffs),
    RequestHandoffsReply(HandoffsReply),

    RetrieveKeyStart(RetrieveRequest),
    RetrieveKeyNext(RetrieveRequest),
    RetrieveKeyReply(RetrieveReply),
}

impl MessageKind {
    /// The `message-type` tag
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::ResilientServerHandshake => "resilient-server-handshake",
            MessageKind::ResilientServerSignoff => "resilient-server-signoff",
            MessageKind::ResilientServerAck(_) => "resilient-server-ack",
            MessageKind::Ping => "ping",
            MessageKind::ArchiveKeyStart(_) => "archive-key-start",
            MessageKind::ArchiveKeyNext(_) => "archive-key-next",
            MessageKind::ArchiveKeyFinal(_) => "archive-key-final",
            MessageKind::ArchiveKeyEntire(_) => "archive-key-entire",
            MessageKind::ArchiveKeyCancel(_) => "archive-key-cancel",
            MessageKind::ArchiveKeyReply(_) => "archive-key-reply",
            MessageKind::DestroyKey(_) => "destroy-key",
            MessageKind::DestroyKeyReply(_) => "destroy-key-reply",
            MessageKind::StartConjoinedArchive(_) => "start-conjoined-archive",
            MessageKind::AbortConjoinedArchive(_) => "abort-conjoined-archive",
            MessageKind::FinishConjoinedArchive(_) => "finish-conjoined-archive",
            MessageKind::ConjoinedArchiveReply(_) => "conjoined-archive-reply",
            MessageKind::PurgeHandoffSegment(_) => "purge-handoff-segment",
            MessageKind::PurgeHandoffConjoined(_) => "purge-handoff-conjoined",
            MessageKind::PurgeHandoffReply(_) => "purge-handoff-reply",
            MessageKind::CancelActiveArchives(_) => "cancel-active-archives",
            MessageKind::CancelActiveArchivesReply(_) => "cancel-active-archives-reply",
            MessageKind::RequestHandoffs(_) => "request-handoffs",
            MessageKind::RequestHandoffsReply(_) => "request-handoffs-reply",
            MessageKind::RetrieveKeyStart(_) => "retrieve-key-start",
            MessageKind::RetrieveKeyNext(_) => "retrieve-key-next",
            MessageKind::RetrieveKeyReply(_) => "retrieve-key-reply",
        }
    }

    /// Result tag and error text of a reply, or `None` for requests
    pub fn reply_result(&self) -> Option<(ResultCode, Option<&str>)> {
        match self {
            MessageKind::ArchiveKeyReply(r)
            | MessageKind::DestroyKeyReply(r)
            | MessageKind::ConjoinedArchiveReply(r)
            | MessageKind::PurgeHandoffReply(r)
            | MessageKind::CancelActiveArchivesReply(r) => Some((r.result, r.error_message.as_deref())),
            MessageKind::RequestHandoffsReply(r) => Some((r.result, r.error_message.as_deref())),
            MessageKind::RetrieveKeyReply(r) => Some((r.result, r.error_message.as_deref())),
            _ => None,
        }
    }

    /// Protocol messages handled inside the resilient channel itself
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageKind::ResilientServerHandshake
                | MessageKind::ResilientServerSignoff
                | MessageKind::ResilientServerAck(_)
                | MessageKind::Ping
        )
    }
}

/// A message with its routing fields
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    pub client_tag: String,
    pub client_address: String,
    pub kind: MessageKind,
    pub body: Vec<Bytes>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Control {
    message_id: Uuid,
    client_tag: String,
    client_address: String,
    payload: MessageKind,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    control: Vec<u8>,
    body: Vec<Bytes>,
}

impl Message {
    pub fn new(kind: MessageKind, body: Vec<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            client_tag: String::new(),
            client_address: String::new(),
            kind,
            body,
        }
    }

    /// A reply to this message, correlated by its id
    pub fn reply(&self, kind: MessageKind, body: Vec<Bytes>) -> Self {
        Self {
            message_id: self.message_id,
            client_tag: self.client_tag.clone(),
            client_address: self.client_address.clone(),
            kind,
            body,
        }
    }

    /// Total body length in bytes
    pub fn body_len(&self) -> usize {
        self.body.iter().map(|b| b.len()).sum()
    }

    /// All body segments as one buffer
    pub fn joined_body(&self) -> Bytes {
        match self.body.len() {
            0 => Bytes::new(),
            1 => self.body[0].clone(),
            _ => {
                let mut joined = Vec::with_capacity(self.body_len());
                for segment in &self.body {
                    joined.extend_from_slice(segment);
                }
                Bytes::from(joined)
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let control = serde_json::to_vec(&Control {
            message_id: self.message_id,
            client_tag: self.client_tag.clone(),
            client_address: self.client_address.clone(),
            payload: self.kind.clone(),
        })?;
        let frame = WireFrame {
            control,
            body: self.body.clone(),
        };
        Ok(Bytes::from(bincode::serialize(&frame)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let frame: WireFrame = bincode::deserialize(data)?;
        let control: Control = serde_json::from_slice(&frame.control)?;
        Ok(Self {
            message_id: control.message_id,
            client_tag: control.client_tag,
            client_address: control.client_address,
            kind: control.payload,
            body: frame.body,
        })
    }
}
