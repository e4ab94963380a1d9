//! Peer-connection capability — the opaque primitive the negotiation engine
//! drives
//!
//! The engine never touches media or SDP internals; it only asks the
//! capability to create/apply descriptions and candidates, and listens to
//! the events the capability pushes back (local candidates, renegotiation
//! requests, connectivity transitions, incoming data channels).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque session description payload, forwarded verbatim over signaling
pub type SessionDescription = serde_json::Value;

/// Opaque network-reachability candidate payload
pub type CandidateInit = serde_json::Value;

/// Signaling-plane state of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in flight
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet generated
    HaveRemoteOffer,
}

/// Connectivity of the underlying connection, as reported by its own
/// watchdog signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States that tear the owning session down
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Capability error types
#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("Description rejected: {0}")]
    DescriptionRejected(String),
    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("Connection closed")]
    Closed,
}

/// Event pushed by a capability to its owning session.
///
/// `session` carries the epoch assigned at session creation; the engine
/// ignores events whose epoch no longer matches, so a late completion can
/// never mutate a session that has been destroyed and recreated.
#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: String,
    pub session: u64,
    pub detail: PeerEventDetail,
}

#[derive(Debug)]
pub enum PeerEventDetail {
    /// The capability produced a local candidate to signal to the remote
    LocalCandidate(CandidateInit),
    /// The capability wants a (re)negotiation
    NegotiationNeeded,
    /// Connectivity transition
    StateChanged(PeerConnectionState),
    /// The remote opened a data channel
    DataChannel { label: String },
}

/// The fixed operation set the engine drives. Implementations wrap a real
/// WebRTC stack; tests use an in-memory fake.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Generate an offer description
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerConnectionError>;

    /// Generate an answer to the current remote offer
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerConnectionError>;

    /// Apply a locally generated description
    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerConnectionError>;

    /// Apply the remote description. Applying a remote offer while a local
    /// offer is in flight implicitly rolls the local offer back.
    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerConnectionError>;

    /// Apply one remote candidate
    async fn add_candidate(&mut self, candidate: CandidateInit)
        -> Result<(), PeerConnectionError>;

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    /// Tear the connection down; must be idempotent
    async fn close(&mut self);
}

/// Builds one capability per negotiation session
pub trait PeerConnectionFactory: Send + Sync {
    /// `events` is where the new capability must push its [`PeerEvent`]s,
    /// tagged with `peer_id` and the given session epoch.
    fn create(
        &mut self,
        peer_id: &str,
        session: u64,
        events: mpsc::Sender<PeerEvent>,
    ) -> Box<dyn PeerConnection>;
}
