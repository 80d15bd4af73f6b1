//! Wire protocol for document sync and presence.
//!
//! Binary frames follow the y-protocols layout so that stock Yjs providers
//! can talk to the server without an adapter:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────────────────────┐
//! │ MSG_SYNC │ sub-type │ varbuf (state vector / update)│   sub-type: 0 step1, 1 step2, 2 update
//! └──────────┴──────────┴───────────────────────────────┘
//! ┌───────────────┬───────────────────────────────────────┐
//! │ MSG_AWARENESS │ varbuf (awareness update)             │
//! └───────────────┴───────────────────────────────────────┘
//! ```
//!
//! All integers are lib0 variable-length unsigned integers (7 bits per byte,
//! little-endian, high bit = continuation); yrs does the byte-level work.
//! Text frames carry JSON control messages tagged by a `type` field.
//!
//! Frames are decoded once at the boundary into [`InboundFrame`] and matched
//! exhaustively from there on.

use serde::{Deserialize, Serialize};
use yrs::encoding::read::{self, Cursor, Read};
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::awareness::AwarenessUpdate;

/// Outer tag of a sync-protocol frame.
pub const MSG_SYNC: u8 = 0;
/// Outer tag of an awareness frame.
pub const MSG_AWARENESS: u8 = 1;

/// Sync sub-type: "describe your state so I can compute what you miss".
pub const MSG_SYNC_STEP1: u8 = 0;
/// Sync sub-type: diff answering a step 1.
pub const MSG_SYNC_STEP2: u8 = 1;
/// Sync sub-type: incremental update.
pub const MSG_SYNC_UPDATE: u8 = 2;

/// Protocol errors. None of these ever close a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unsupported sync-channel message: {0}")]
    Unsupported(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("invalid control frame: {0}")]
    Control(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Control(e.to_string())
    }
}

/// A decoded inbound binary frame.
#[derive(Debug)]
pub enum InboundFrame {
    /// Step 1, step 2 or incremental update.
    Sync(SyncMessage),
    /// Encoded set of per-client presence changes.
    Awareness(AwarenessUpdate),
}

impl InboundFrame {
    /// Classify a binary frame by its leading tag and decode its body.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        match data.first() {
            None => Err(ProtocolError::EmptyFrame),
            Some(&MSG_AWARENESS) => {
                check_awareness_count(data)?;
                Self::decode_message(data)
            }
            Some(&MSG_SYNC) => Self::decode_message(data),
            Some(&tag) => Err(ProtocolError::UnknownTag(tag)),
        }
    }

    fn decode_message(data: &[u8]) -> Result<Self, ProtocolError> {
        match Message::decode_v1(data) {
            Ok(Message::Sync(msg)) => Ok(InboundFrame::Sync(msg)),
            Ok(Message::Awareness(update)) => Ok(InboundFrame::Awareness(update)),
            Ok(other) => Err(ProtocolError::Unsupported(format!("{other:?}"))),
            Err(e) => Err(ProtocolError::Decode(e.to_string())),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Sync(SyncMessage::SyncStep1(_)) => "sync-step1",
            InboundFrame::Sync(SyncMessage::SyncStep2(_)) => "sync-step2",
            InboundFrame::Sync(SyncMessage::Update(_)) => "sync-update",
            InboundFrame::Awareness(_) => "awareness",
        }
    }
}

/// Reject awareness bodies whose entry count cannot fit in the body; yrs
/// preallocates for the claimed count. An entry takes at least three bytes.
fn check_awareness_count(data: &[u8]) -> Result<(), ProtocolError> {
    let decode = |e: read::Error| ProtocolError::Decode(e.to_string());
    let mut frame = Cursor::new(data);
    let _tag: u8 = frame.read_var().map_err(decode)?;
    let body = frame.read_buf().map_err(decode)?;
    let count: usize = Cursor::new(body).read_var().map_err(decode)?;
    if count > body.len() / 3 {
        return Err(ProtocolError::Decode(format!(
            "awareness update claims {count} entries in {} bytes",
            body.len()
        )));
    }
    Ok(())
}

/// Encode a step 1 request carrying the local state vector.
pub fn encode_sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Encode a step 2 response carrying the missing updates.
pub fn encode_sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Encode an incremental update.
pub fn encode_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Encode an awareness frame.
pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Decode a state vector sent by a peer.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, ProtocolError> {
    StateVector::decode_v1(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

// ─── JSON control channel ─────────────────────────────────────────────

/// Control frames sent by the server over the text channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: String,
        document_id: String,
    },
    Pong,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A structured (JSON) event received from a client.
///
/// Only the `type` field is interpreted here; the rest belongs to whichever
/// collaborator handles that type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl StructuredEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let payload: serde_json::Value = serde_json::from_str(text)?;
        let event_type = payload
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Control("missing `type` field".into()))?
            .to_string();
        Ok(Self { event_type, payload })
    }
}
