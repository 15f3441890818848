//! Per-file transfer protocol: wire messages and the error taxonomy.
//!
//! Control messages travel as string frames (UTF-8 JSON, `type`-tagged);
//! chunk payloads travel as binary frames, one frame per chunk. The
//! receiver distinguishes purely on frame type; there is no multiplexing
//! of concurrent files on one channel.

pub mod engine;
pub mod receiver;
pub mod sender;
pub mod source;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version carried in every `file-offer`.
pub const PROTOCOL_VERSION: u32 = 2;

// ── File metadata ────────────────────────────────────────────────────────────

/// On-wire description of one file. Immutable per `upload_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Equal to `upload_id`; kept as a separate field for wire
    /// compatibility with peers that predate stable upload ids.
    pub id: String,
    #[serde(default)]
    pub upload_id: Option<String>,
    pub protocol_version: u32,
    pub name: String,
    pub size: u64,
    /// MIME type; may be empty.
    #[serde(rename = "type", default)]
    pub mime: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
    /// Sender-local file identity for resume matching. Never serialized:
    /// fingerprints stay off the wire.
    #[serde(skip)]
    pub fingerprint: Option<String>,
}

impl FileMetadata {
    /// The effective upload id: `upload_id` when present, else `id`.
    pub fn effective_upload_id(&self) -> &str {
        self.upload_id.as_deref().unwrap_or(&self.id)
    }
}

// ── Control messages ─────────────────────────────────────────────────────────

/// Machine-readable error payload inside `transfer-error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// String-frame control messages. Unknown `type` values are ignored with a
/// `transfer_control_message_parse_error` event rather than failing the
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "file-offer")]
    FileOffer { metadata: FileMetadata },

    #[serde(rename = "receiver-ready", rename_all = "camelCase")]
    ReceiverReady {
        file_id: String,
        upload_id: String,
        /// Untrusted: normalized against `total_chunks` before use.
        resume_from_chunk: f64,
    },

    #[serde(rename = "transfer-complete", rename_all = "camelCase")]
    TransferComplete {
        file_id: String,
        upload_id: String,
        checksum: String,
    },

    #[serde(rename = "request-retransmit", rename_all = "camelCase")]
    RequestRetransmit {
        file_id: String,
        upload_id: String,
        /// Untrusted: normalized against `total_chunks` before use.
        from_chunk: f64,
        reason: String,
    },

    #[serde(rename = "transfer-error", rename_all = "camelCase")]
    TransferError { file_id: String, error: WireError },
}

/// Outcome of parsing an incoming string frame.
pub enum ParsedControl {
    Message(Box<ControlMessage>),
    /// Valid JSON with an unrecognized `type`: ignore, but observable.
    UnknownType(String),
    /// Not a control message at all.
    Malformed(String),
}

/// Parse a string frame into a control message, distinguishing unknown
/// message types from malformed frames.
pub fn parse_control(text: &str) -> ParsedControl {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return ParsedControl::Malformed(e.to_string()),
    };
    match serde_json::from_value::<ControlMessage>(value.clone()) {
        Ok(message) => ParsedControl::Message(Box::new(message)),
        Err(e) => match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => ParsedControl::UnknownType(kind.to_string()),
            None => ParsedControl::Malformed(e.to_string()),
        },
    }
}

// ── Error taxonomy ───────────────────────────────────────────────────────────

/// Machine codes surfaced in `transfer-error` frames and on user-visible
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    TransferTimeout,
    ReceiverNotReady,
    InvalidFileId,
    InvalidMetadata,
    InvalidChunkSequence,
    ReceiverBufferExhausted,
    ChecksumMismatch,
    ChunkPersistFailed,
    MessageTooLarge,
    RetransmitNotSupported,
    DataChannelNotReady,
    DataChannelSendFailed,
    AutoResumeTimeout,
    TransferControlParseError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransferTimeout => "TRANSFER_TIMEOUT",
            ErrorCode::ReceiverNotReady => "RECEIVER_NOT_READY",
            ErrorCode::InvalidFileId => "INVALID_FILE_ID",
            ErrorCode::InvalidMetadata => "INVALID_METADATA",
            ErrorCode::InvalidChunkSequence => "INVALID_CHUNK_SEQUENCE",
            ErrorCode::ReceiverBufferExhausted => "RECEIVER_BUFFER_EXHAUSTED",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::ChunkPersistFailed => "CHUNK_PERSIST_FAILED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::RetransmitNotSupported => "RETRANSMIT_NOT_SUPPORTED",
            ErrorCode::DataChannelNotReady => "DATA_CHANNEL_NOT_READY",
            ErrorCode::DataChannelSendFailed => "DATA_CHANNEL_SEND_FAILED",
            ErrorCode::AutoResumeTimeout => "AUTO_RESUME_TIMEOUT",
            ErrorCode::TransferControlParseError => "TRANSFER_CONTROL_PARSE_ERROR",
        }
    }
}

/// A transfer failure carrying its machine code through `anyhow` chains so
/// callbacks can recover it with a downcast.
#[derive(Debug, Clone)]
pub struct TransferError {
    pub code: ErrorCode,
    pub message: String,
}

impl TransferError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for TransferError {}

/// Pull the machine code out of an `anyhow` chain, if one is there.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<TransferError>().map(|e| e.code)
}

/// Whether a send-loop failure should feed the auto-resume loop instead of
/// surfacing. Transport hiccups qualify; validation, integrity, and policy
/// failures do not.
pub fn is_recoverable_send_interruption(err: &anyhow::Error) -> bool {
    if let Some(code) = error_code(err) {
        return matches!(
            code,
            ErrorCode::DataChannelNotReady
                | ErrorCode::DataChannelSendFailed
                | ErrorCode::TransferTimeout
        );
    }
    // Transport errors raised below the engine keep their own text; the
    // closed-channel shapes are recoverable.
    let text = format!("{err:#}").to_lowercase();
    text.contains("channel closed") || text.contains("not open") || text.contains("channel is closing")
}
