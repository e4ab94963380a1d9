//! Envelope Codec — wire message shapes and (de)serialization
//!
//! One JSON object per frame, length-prefixed with a `u32`. The relay only
//! ever reads `kind` and `target`; `content` is opaque to it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single wire frame. Signaling payloads are small; anything
/// larger is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Per-client metadata carried in presence messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProperties {
    /// Display name chosen at join time
    pub username: String,
    /// Free-form role string (e.g. "host", "participant")
    pub role: String,
    /// Relay-assigned join timestamp (unix milliseconds); shared ordering
    /// field used for negotiation role assignment
    #[serde(rename = "joinedAt")]
    pub joined_at: u64,
}

/// A connected client as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Relay-unique identity for the lifetime of the connection
    pub id: String,
    /// Transport-level origin as observed by the relay
    pub address: String,
    /// Join metadata
    pub properties: ClientProperties,
}

/// Kind-discriminated envelope payload.
///
/// Closed set: decoding rejects unknown tags and content that does not match
/// the shape implied by the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content")]
pub enum Payload {
    /// A client joined; broadcast to everyone else
    PresenceEnter(ClientRecord),
    /// The joiner's own confirmed record
    PresenceEntered(ClientRecord),
    /// Current roster, self excluded
    PresenceList(Vec<ClientRecord>),
    /// A client left; broadcast with its last-known record
    PresenceExit(ClientRecord),
    /// Session description offer (opaque to the relay)
    Offer(serde_json::Value),
    /// Session description answer (opaque to the relay)
    Answer(serde_json::Value),
    /// Network-reachability candidate (opaque to the relay)
    Candidate(serde_json::Value),
}

/// A relay-routable signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    /// Authenticated sender id; set by the relay when routing, never trusted
    /// from the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Routing target for Offer/Answer/Candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Opaque application bag, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Handshake sent as the first frame of every connection.
///
/// Kept separate from [`Envelope`]: it is a control message between a client
/// and the relay, not something the relay ever routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Client-proposed id; the relay assigns one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    pub role: String,
}

/// Codec error types
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Encode failed: {0}")]
    EncodeFailed(String),
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Envelope {
    /// Build an envelope with no addressing fields
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            sender: None,
            target: None,
            metadata: None,
        }
    }

    /// Build a targeted envelope (Offer/Answer/Candidate)
    pub fn to_target(payload: Payload, target: impl Into<String>) -> Self {
        Self {
            payload,
            sender: None,
            target: Some(target.into()),
            metadata: None,
        }
    }

    /// Human-readable kind tag, matching the wire discriminant
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Payload::PresenceEnter(_) => "PresenceEnter",
            Payload::PresenceEntered(_) => "PresenceEntered",
            Payload::PresenceList(_) => "PresenceList",
            Payload::PresenceExit(_) => "PresenceExit",
            Payload::Offer(_) => "Offer",
            Payload::Answer(_) => "Answer",
            Payload::Candidate(_) => "Candidate",
        }
    }

    /// Serialize to a JSON frame body
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    /// Deserialize a JSON frame body. Pure: a failed decode leaves nothing
    /// half-built.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }
}

impl JoinRequest {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrameLength(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrameLength(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// TESTS
// ============================================================================
