//! Negotiation Engine — perfect negotiation against an opaque capability
//!
//! One session per remote peer. Both sides may offer simultaneously; a fixed
//! polite/impolite role assignment resolves the collision deterministically,
//! with no extra election round. All transitions for one session run on a
//! single task, so envelope handling for a peer is processed strictly in
//! arrival order.

use crate::rtc::connection::{
    CandidateInit, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventDetail, SessionDescription, SignalingState,
};
use crate::signaling::envelope::{ClientRecord, Envelope, Payload};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Most candidates held for a peer that has no session yet. A remote that
/// streams candidates without ever negotiating must not grow memory.
const EARLY_CANDIDATE_DEPTH: usize = 64;

/// Which side yields when both peers offer at once.
///
/// Fixed for the lifetime of a session: the peer that joined the room
/// earlier is impolite (its offers win), the later joiner is polite. Both
/// sides compute this independently from the shared `joined_at` ordering
/// field, ties broken by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Polite,
    Impolite,
}

impl SessionRole {
    /// Compute the local role from both presence records
    pub fn from_join_order(
        local_joined_at: u64,
        local_id: &str,
        remote_joined_at: u64,
        remote_id: &str,
    ) -> Self {
        let local_first = (local_joined_at, local_id) < (remote_joined_at, remote_id);
        if local_first {
            SessionRole::Impolite
        } else {
            SessionRole::Polite
        }
    }
}

/// Events the engine emits toward the application (UI/media layer)
#[derive(Debug)]
pub enum EndpointEvent {
    /// The locally-known roster changed
    RosterChanged(Vec<ClientRecord>),
    /// Connectivity of a peer session changed
    ConnectionStateChanged {
        peer_id: String,
        state: PeerConnectionState,
    },
    /// The remote side opened a data channel
    IncomingDataChannel { peer_id: String, label: String },
    /// Signaling toward this peer failed; its session was torn down
    PeerUnreachable { peer_id: String },
}

/// Negotiation error types
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Local identity not confirmed yet")]
    NotJoined,
    #[error("Session already active for peer {0}")]
    SessionActive(String),
    #[error("No roster entry for peer {0}; join time unknown")]
    UnknownPeerJoinTime(String),
    #[error("Signaling toward peer {0} failed")]
    PeerUnreachable(String),
    #[error("Description step failed for peer {0}: {1}")]
    DescriptionFailed(String, String),
}

struct Session {
    peer_id: String,
    epoch: u64,
    role: SessionRole,
    making_offer: bool,
    setting_remote_answer: bool,
    pending_candidates: VecDeque<CandidateInit>,
    connection: Box<dyn PeerConnection>,
}

/// Drives one capability per remote peer through offer/answer/candidate
/// exchange.
///
/// Not internally synchronized: the owning task (the signaling driver loop)
/// feeds it envelopes and capability events one at a time.
pub struct NegotiationEngine {
    local: Option<(String, u64)>,
    factory: Box<dyn PeerConnectionFactory>,
    sessions: HashMap<String, Session>,
    /// Candidates that arrived before any session existed for the peer
    early_candidates: HashMap<String, VecDeque<CandidateInit>>,
    next_epoch: u64,
    outbound: mpsc::Sender<Envelope>,
    events: mpsc::Sender<EndpointEvent>,
    peer_events: mpsc::Sender<PeerEvent>,
}

impl NegotiationEngine {
    /// `outbound` carries envelopes to the signaling transport; `events`
    /// carries upstream notifications; `peer_events` is handed to every
    /// capability the factory builds (the owner selects on its receiver and
    /// feeds events back through [`handle_peer_event`]).
    ///
    /// [`handle_peer_event`]: NegotiationEngine::handle_peer_event
    pub fn new(
        factory: Box<dyn PeerConnectionFactory>,
        outbound: mpsc::Sender<Envelope>,
        events: mpsc::Sender<EndpointEvent>,
        peer_events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            local: None,
            factory,
            sessions: HashMap::new(),
            early_candidates: HashMap::new(),
            next_epoch: 0,
            outbound,
            events,
            peer_events,
        }
    }

    /// Record the relay-confirmed local identity. Calls are rejected until
    /// this has happened.
    pub fn set_local_identity(&mut self, id: String, joined_at: u64) {
        self.local = Some((id, joined_at));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn session_role(&self, peer_id: &str) -> Option<SessionRole> {
        self.sessions.get(peer_id).map(|s| s.role)
    }

    /// Start an outbound call to a peer from the roster. The roster record
    /// is required so the role can be computed before any offer is sent.
    pub async fn call(&mut self, peer: &ClientRecord) -> Result<(), NegotiationError> {
        if self.sessions.contains_key(&peer.id) {
            return Err(NegotiationError::SessionActive(peer.id.clone()));
        }
        self.ensure_session(&peer.id, peer.properties.joined_at)?;
        self.start_offer(&peer.id).await
    }

    /// End a call. Idempotent: hanging up an absent session is a no-op.
    pub async fn hang_up(&mut self, peer_id: &str) {
        self.terminate(peer_id).await;
    }

    /// Drop every session (endpoint shutdown)
    pub async fn hang_up_all(&mut self) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer_id in peers {
            self.terminate(&peer_id).await;
        }
    }

    /// Inbound offer from `sender`, with glare resolution
    pub async fn handle_offer(
        &mut self,
        sender: &ClientRecord,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_session(&sender.id, sender.properties.joined_at)?;
        let peer_id = sender.id.clone();

        let (role, collision) = {
            let session = self
                .sessions
                .get(&peer_id)
                .ok_or_else(|| NegotiationError::SessionActive(peer_id.clone()))?;
            let collision = session.making_offer
                || (session.connection.signaling_state() != SignalingState::Stable
                    && !session.setting_remote_answer);
            (session.role, collision)
        };

        if collision && role == SessionRole::Impolite {
            // Impolite peers never yield: drop the offer, send nothing.
            info!("Offer collision with {peer_id}; ignoring remote offer (impolite)");
            return Ok(());
        }

        // Applying the remote offer implicitly rolls back any local in-flight
        // offer on the polite side.
        let answer = {
            let session = match self.sessions.get_mut(&peer_id) {
                Some(session) => session,
                None => return Ok(()),
            };
            if let Err(err) = session.connection.set_remote_description(description).await {
                let reason = err.to_string();
                self.fail_session(&peer_id, &reason).await;
                return Err(NegotiationError::DescriptionFailed(peer_id, reason));
            }
            Self::flush_candidates(session).await;

            let answer = match session.connection.create_answer().await {
                Ok(answer) => answer,
                Err(err) => {
                    let reason = err.to_string();
                    self.fail_session(&peer_id, &reason).await;
                    return Err(NegotiationError::DescriptionFailed(peer_id, reason));
                }
            };
            if let Err(err) = session.connection.set_local_description(answer.clone()).await {
                let reason = err.to_string();
                self.fail_session(&peer_id, &reason).await;
                return Err(NegotiationError::DescriptionFailed(peer_id, reason));
            }
            answer
        };

        self.send_to_peer(&peer_id, Payload::Answer(answer)).await
    }

    /// Inbound answer. A stale answer (no local offer pending) is dropped
    /// without touching session state.
    pub async fn handle_answer(
        &mut self,
        sender_id: &str,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(session) = self.sessions.get_mut(sender_id) else {
            debug!("Dropping answer from {sender_id}: no session");
            return Ok(());
        };
        if session.connection.signaling_state() != SignalingState::HaveLocalOffer {
            debug!("Dropping stale answer from {sender_id}");
            return Ok(());
        }

        session.setting_remote_answer = true;
        let applied = session.connection.set_remote_description(description).await;
        if let Some(session) = self.sessions.get_mut(sender_id) {
            session.setting_remote_answer = false;
        }
        match applied {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(sender_id) {
                    Self::flush_candidates(session).await;
                }
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.fail_session(sender_id, &reason).await;
                Err(NegotiationError::DescriptionFailed(
                    sender_id.to_string(),
                    reason,
                ))
            }
        }
    }

    /// Inbound candidate: apply now if a remote description is set, queue
    /// otherwise. Individual apply failures are logged and skipped, never
    /// fatal to the session.
    pub async fn handle_candidate(&mut self, sender_id: &str, candidate: CandidateInit) {
        match self.sessions.get_mut(sender_id) {
            Some(session) => {
                if session.connection.has_remote_description() {
                    if let Err(err) = session.connection.add_candidate(candidate).await {
                        warn!("Skipping candidate from {sender_id}: {err}");
                    }
                } else {
                    session.pending_candidates.push_back(candidate);
                }
            }
            // No session yet: hold the candidate until one is created.
            // Bounded, dropping the oldest first; a fresher candidate set is
            // the more useful one if a session ever starts.
            None => {
                let queue = self
                    .early_candidates
                    .entry(sender_id.to_string())
                    .or_default();
                queue.push_back(candidate);
                if queue.len() > EARLY_CANDIDATE_DEPTH {
                    queue.pop_front();
                    debug!("Early candidate queue for {sender_id} full, dropped oldest");
                }
            }
        }
    }

    /// Feed back one capability event. Events whose session epoch no longer
    /// matches are stale completions from a destroyed session and are
    /// ignored.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let live = self
            .sessions
            .get(&event.peer_id)
            .map(|s| s.epoch == event.session)
            .unwrap_or(false);
        if !live {
            debug!(
                "Ignoring stale capability event for {} (session {})",
                event.peer_id, event.session
            );
            return;
        }

        match event.detail {
            PeerEventDetail::LocalCandidate(candidate) => {
                let _ = self
                    .send_to_peer(&event.peer_id, Payload::Candidate(candidate))
                    .await;
            }
            PeerEventDetail::NegotiationNeeded => {
                let wants_offer = self
                    .sessions
                    .get(&event.peer_id)
                    .map(|s| {
                        !s.making_offer
                            && s.connection.signaling_state() != SignalingState::HaveRemoteOffer
                    })
                    .unwrap_or(false);
                if wants_offer {
                    let _ = self.start_offer(&event.peer_id).await;
                }
            }
            PeerEventDetail::StateChanged(state) => {
                self.emit(EndpointEvent::ConnectionStateChanged {
                    peer_id: event.peer_id.clone(),
                    state,
                })
                .await;
                if state.is_terminal() {
                    self.terminate(&event.peer_id).await;
                }
            }
            PeerEventDetail::DataChannel { label } => {
                self.emit(EndpointEvent::IncomingDataChannel {
                    peer_id: event.peer_id,
                    label,
                })
                .await;
            }
        }
    }

    /// Create a session for `peer_id` if none exists, with the role computed
    /// from join order. Drains any early-queued candidates into the session.
    fn ensure_session(&mut self, peer_id: &str, remote_joined_at: u64) -> Result<(), NegotiationError> {
        if self.sessions.contains_key(peer_id) {
            return Ok(());
        }
        let (local_id, local_joined_at) = self
            .local
            .clone()
            .ok_or(NegotiationError::NotJoined)?;

        let role = SessionRole::from_join_order(local_joined_at, &local_id, remote_joined_at, peer_id);
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let connection = self
            .factory
            .create(peer_id, epoch, self.peer_events.clone());
        let pending_candidates = self.early_candidates.remove(peer_id).unwrap_or_default();

        info!("Session with {peer_id} created, role {role:?}");
        self.sessions.insert(
            peer_id.to_string(),
            Session {
                peer_id: peer_id.to_string(),
                epoch,
                role,
                making_offer: false,
                setting_remote_answer: false,
                pending_candidates,
                connection,
            },
        );
        Ok(())
    }

    /// Generate a local offer and signal it. `making_offer` guards the whole
    /// stretch so a renegotiation signal cannot trigger a duplicate offer.
    async fn start_offer(&mut self, peer_id: &str) -> Result<(), NegotiationError> {
        let offer = {
            let Some(session) = self.sessions.get_mut(peer_id) else {
                return Ok(());
            };
            session.making_offer = true;
            let generated = async {
                let offer = session.connection.create_offer().await?;
                session.connection.set_local_description(offer.clone()).await?;
                Ok::<_, crate::rtc::connection::PeerConnectionError>(offer)
            }
            .await;
            match generated {
                Ok(offer) => offer,
                Err(err) => {
                    let reason = err.to_string();
                    if let Some(session) = self.sessions.get_mut(peer_id) {
                        session.making_offer = false;
                    }
                    self.fail_session(peer_id, &reason).await;
                    return Err(NegotiationError::DescriptionFailed(
                        peer_id.to_string(),
                        reason,
                    ));
                }
            }
        };

        let sent = self.send_to_peer(peer_id, Payload::Offer(offer)).await;
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.making_offer = false;
        }
        sent
    }

    async fn flush_candidates(session: &mut Session) {
        while let Some(candidate) = session.pending_candidates.pop_front() {
            if let Err(err) = session.connection.add_candidate(candidate).await {
                warn!("Skipping queued candidate for {}: {err}", session.peer_id);
            }
        }
    }

    /// A signaling send failure means the peer is unreachable: tear down
    /// that session only.
    ///
    /// Must not await the queue: the task that runs the engine is also the
    /// queue's consumer, so a blocking send here could wedge it against
    /// itself. Full and closed both count as the transport being gone.
    async fn send_to_peer(&mut self, peer_id: &str, payload: Payload) -> Result<(), NegotiationError> {
        let envelope = Envelope::to_target(payload, peer_id);
        if self.outbound.try_send(envelope).is_err() {
            warn!("Signaling send toward {peer_id} failed; terminating session");
            self.terminate(peer_id).await;
            self.emit(EndpointEvent::PeerUnreachable {
                peer_id: peer_id.to_string(),
            })
            .await;
            return Err(NegotiationError::PeerUnreachable(peer_id.to_string()));
        }
        Ok(())
    }

    /// A critical description step failed: the session cannot make progress.
    async fn fail_session(&mut self, peer_id: &str, reason: &str) {
        warn!("Session with {peer_id} failed: {reason}");
        self.terminate(peer_id).await;
    }

    /// Destroy a session and close its capability. Idempotent; other
    /// sessions are untouched.
    async fn terminate(&mut self, peer_id: &str) {
        self.early_candidates.remove(peer_id);
        if let Some(mut session) = self.sessions.remove(peer_id) {
            session.connection.close().await;
            info!("Session with {peer_id} closed");
            self.emit(EndpointEvent::ConnectionStateChanged {
                peer_id: peer_id.to_string(),
                state: PeerConnectionState::Closed,
            })
            .await;
        }
    }

    async fn emit(&self, event: EndpointEvent) {
        // The application may have dropped its receiver; that is not an
        // engine failure.
        let _ = self.events.send(event).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
