//! Probe capability — an in-memory stand-in for a real WebRTC stack
//!
//! Lets two wavelink endpoints run the complete signaling exchange against a
//! live relay without any media machinery: descriptions are fabricated JSON,
//! candidates are counted, and the "connection" reports itself connected as
//! soon as both descriptions are in place.

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use wavelink_core::rtc::{
    CandidateInit, PeerConnection, PeerConnectionError, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventDetail, SessionDescription, SignalingState,
};

pub struct ProbeFactory {
    local_id: String,
}

impl ProbeFactory {
    pub fn new(local_id: String) -> Self {
        Self { local_id }
    }
}

impl PeerConnectionFactory for ProbeFactory {
    fn create(
        &mut self,
        peer_id: &str,
        session: u64,
        events: mpsc::Sender<PeerEvent>,
    ) -> Box<dyn PeerConnection> {
        Box::new(ProbeConnection {
            local_id: self.local_id.clone(),
            peer_id: peer_id.to_string(),
            session,
            events,
            local: None,
            remote: None,
            signaling: SignalingState::Stable,
            candidates_applied: 0,
            closed: false,
        })
    }
}

struct ProbeConnection {
    local_id: String,
    peer_id: String,
    session: u64,
    events: mpsc::Sender<PeerEvent>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    candidates_applied: u32,
    closed: bool,
}

impl ProbeConnection {
    // The engine's driver task both calls into this capability and consumes
    // its events; an awaited send here could block that task against itself.
    fn push(&self, detail: PeerEventDetail) {
        let _ = self.events.try_send(PeerEvent {
            peer_id: self.peer_id.clone(),
            session: self.session,
            detail,
        });
    }

    /// Both descriptions in place: report connectivity and a fake candidate
    fn maybe_connected(&self) {
        if self.local.is_some() && self.remote.is_some() {
            self.push(PeerEventDetail::LocalCandidate(
                json!({"candidate": format!("probe host {}", self.local_id)}),
            ));
            self.push(PeerEventDetail::StateChanged(PeerConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for ProbeConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerConnectionError> {
        Ok(json!({"type": "offer", "sdp": format!("probe:{}", self.local_id)}))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerConnectionError> {
        Ok(json!({"type": "answer", "sdp": format!("probe:{}", self.local_id)}))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerConnectionError> {
        self.signaling = if description["type"] == "offer" {
            SignalingState::HaveLocalOffer
        } else {
            SignalingState::Stable
        };
        self.local = Some(description);
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerConnectionError> {
        self.signaling = if description["type"] == "offer" {
            SignalingState::HaveRemoteOffer
        } else {
            SignalingState::Stable
        };
        self.remote = Some(description);
        self.maybe_connected();
        Ok(())
    }

    async fn add_candidate(&mut self, _candidate: CandidateInit) -> Result<(), PeerConnectionError> {
        self.candidates_applied += 1;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.push(PeerEventDetail::StateChanged(PeerConnectionState::Closed));
        }
    }
}
