//! Signaling Transport — endpoint side of the relay connection
//!
//! Owns the duplex connection to the relay, learns the confirmed local
//! identity from the join handshake, maintains the locally-known roster, and
//! feeds inbound envelopes to the negotiation engine. One driver task per
//! endpoint: envelope handling and capability events for a given peer are
//! processed strictly in arrival order, never interleaved.

use crate::rtc::connection::{PeerConnectionFactory, PeerEvent};
use crate::rtc::negotiation::{EndpointEvent, NegotiationEngine, NegotiationError};
use crate::signaling::envelope::{
    read_frame, write_frame, ClientRecord, Envelope, JoinRequest, Payload,
};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long the relay may take to confirm a join
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CHANNEL_DEPTH: usize = 64;

/// Signaling transport error types
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Join handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Peer {0} is not in the roster")]
    UnknownPeer(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Endpoint is shut down")]
    Closed,
}

enum Command {
    Call {
        peer_id: String,
        reply: oneshot::Sender<Result<(), SignalingError>>,
    },
    HangUp {
        peer_id: String,
    },
    Roster {
        reply: oneshot::Sender<Vec<ClientRecord>>,
    },
    Shutdown,
}

/// Handle to a connected endpoint. Cloneable; dropping the last handle (or
/// calling [`shutdown`](SignalingClient::shutdown)) stops the driver and
/// tears every session down.
#[derive(Clone)]
pub struct SignalingClient {
    local: ClientRecord,
    commands: mpsc::Sender<Command>,
}

impl SignalingClient {
    /// Connect to a relay, perform the join handshake, and start the driver
    /// task. Returns the handle plus the stream of upstream events.
    pub async fn connect(
        relay_addr: &str,
        join: JoinRequest,
        factory: Box<dyn PeerConnectionFactory>,
    ) -> Result<(Self, mpsc::Receiver<EndpointEvent>), SignalingError> {
        let mut stream = TcpStream::connect(relay_addr)
            .await
            .map_err(|e| SignalingError::ConnectFailed(e.to_string()))?;

        let join_frame = join
            .encode()
            .map_err(|e| SignalingError::HandshakeFailed(e.to_string()))?;
        write_frame(&mut stream, &join_frame)
            .await
            .map_err(|e| SignalingError::HandshakeFailed(e.to_string()))?;

        // The relay answers a successful join with PresenceEntered then
        // PresenceList. A PresenceEnter for a concurrently joining client
        // can land between the two; fold it into the roster.
        let mut local: Option<ClientRecord> = None;
        let mut roster: Option<Vec<ClientRecord>> = None;
        let mut early_enters: Vec<ClientRecord> = Vec::new();
        while roster.is_none() {
            match Self::expect_envelope(&mut stream).await?.payload {
                Payload::PresenceEntered(record) => local = Some(record),
                Payload::PresenceList(list) => roster = Some(list),
                Payload::PresenceEnter(record) => early_enters.push(record),
                other => {
                    return Err(SignalingError::HandshakeFailed(format!(
                        "unexpected envelope during join: {other:?}"
                    )))
                }
            }
        }
        let local = local.ok_or_else(|| {
            SignalingError::HandshakeFailed("relay never confirmed identity".to_string())
        })?;
        let mut roster = roster.unwrap_or_default();
        for record in early_enters {
            if record.id != local.id && !roster.iter().any(|r| r.id == record.id) {
                roster.push(record);
            }
        }

        info!(
            "Joined relay as {} ({}), {} peers online",
            local.id,
            local.properties.username,
            roster.len()
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (peer_events_tx, peer_events_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_DEPTH);

        let mut engine =
            NegotiationEngine::new(factory, outbound_tx, events_tx.clone(), peer_events_tx);
        engine.set_local_identity(local.id.clone(), local.properties.joined_at);

        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let reader = tokio::spawn(read_loop(read_half, inbound_tx));

        let driver = Driver {
            local: local.clone(),
            roster,
            engine,
            events: events_tx,
        };
        tokio::spawn(async move {
            driver
                .run(inbound_rx, outbound_rx, peer_events_rx, commands_rx, write_half)
                .await;
            reader.abort();
        });

        Ok((
            Self {
                local,
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    async fn expect_envelope(stream: &mut TcpStream) -> Result<Envelope, SignalingError> {
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
            .await
            .map_err(|_| SignalingError::HandshakeFailed("timed out".to_string()))?
            .map_err(|e| SignalingError::HandshakeFailed(e.to_string()))?;
        Envelope::decode(&frame).map_err(|e| SignalingError::HandshakeFailed(e.to_string()))
    }

    /// The relay-confirmed local record
    pub fn local_record(&self) -> &ClientRecord {
        &self.local
    }

    /// Start a call toward a roster peer. Fails with [`UnknownPeer`] until
    /// the peer's presence (and thus its `joined_at`) is known, so the
    /// negotiation role is always resolved before the first offer.
    ///
    /// [`UnknownPeer`]: SignalingError::UnknownPeer
    pub async fn call(&self, peer_id: &str) -> Result<(), SignalingError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Call {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| SignalingError::Closed)?;
        result.await.map_err(|_| SignalingError::Closed)?
    }

    /// End the call with a peer, if any
    pub async fn hang_up(&self, peer_id: &str) -> Result<(), SignalingError> {
        self.commands
            .send(Command::HangUp {
                peer_id: peer_id.to_string(),
            })
            .await
            .map_err(|_| SignalingError::Closed)
    }

    /// Snapshot of the locally-known roster (self excluded)
    pub async fn roster(&self) -> Result<Vec<ClientRecord>, SignalingError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Roster { reply })
            .await
            .map_err(|_| SignalingError::Closed)?;
        result.await.map_err(|_| SignalingError::Closed)
    }

    /// Stop the driver, tearing down every session
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct Driver {
    local: ClientRecord,
    roster: Vec<ClientRecord>,
    engine: NegotiationEngine,
    events: mpsc::Sender<EndpointEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Envelope>,
        mut outbound: mpsc::Receiver<Envelope>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut writer: OwnedWriteHalf,
    ) {
        self.emit_roster().await;

        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        info!("Relay connection closed");
                        break;
                    }
                },
                envelope = outbound.recv() => {
                    if let Some(envelope) = envelope {
                        if let Ok(frame) = envelope.encode() {
                            if write_frame(&mut writer, &frame).await.is_err() {
                                warn!("Relay send failed, shutting endpoint down");
                                break;
                            }
                        }
                    }
                },
                event = peer_events.recv() => {
                    if let Some(event) = event {
                        self.engine.handle_peer_event(event).await;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Call { peer_id, reply }) => {
                        let _ = reply.send(self.start_call(&peer_id).await);
                    }
                    Some(Command::HangUp { peer_id }) => {
                        self.engine.hang_up(&peer_id).await;
                    }
                    Some(Command::Roster { reply }) => {
                        let _ = reply.send(self.roster.clone());
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        self.engine.hang_up_all().await;
    }

    async fn start_call(&mut self, peer_id: &str) -> Result<(), SignalingError> {
        // Role assignment needs the remote's joined_at; without a roster
        // entry the call cannot start.
        let record = self
            .roster
            .iter()
            .find(|r| r.id == peer_id)
            .cloned()
            .ok_or_else(|| SignalingError::UnknownPeer(peer_id.to_string()))?;
        self.engine.call(&record).await?;
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let sender = envelope.sender.clone();
        match envelope.payload {
            Payload::PresenceEntered(record) => {
                // Already consumed during the handshake; a duplicate only
                // refreshes the local record's metadata.
                debug!("Duplicate PresenceEntered for {}", record.id);
            }
            Payload::PresenceList(roster) => {
                self.roster = roster;
                self.emit_roster().await;
            }
            Payload::PresenceEnter(record) => {
                if record.id != self.local.id && !self.roster.iter().any(|r| r.id == record.id) {
                    self.roster.push(record);
                    self.emit_roster().await;
                }
            }
            Payload::PresenceExit(record) => {
                self.roster.retain(|r| r.id != record.id);
                // Presence exit ends any call with that peer
                self.engine.hang_up(&record.id).await;
                self.emit_roster().await;
            }
            Payload::Offer(description) => {
                let Some(sender_id) = sender else {
                    debug!("Dropping offer without sender");
                    return;
                };
                let Some(record) = self.roster.iter().find(|r| r.id == sender_id).cloned() else {
                    warn!("Dropping offer from unknown peer {sender_id}");
                    return;
                };
                if let Err(err) = self.engine.handle_offer(&record, description).await {
                    warn!("Offer from {sender_id} failed: {err}");
                }
            }
            Payload::Answer(description) => {
                let Some(sender_id) = sender else {
                    debug!("Dropping answer without sender");
                    return;
                };
                if let Err(err) = self.engine.handle_answer(&sender_id, description).await {
                    warn!("Answer from {sender_id} failed: {err}");
                }
            }
            Payload::Candidate(candidate) => {
                let Some(sender_id) = sender else {
                    debug!("Dropping candidate without sender");
                    return;
                };
                self.engine.handle_candidate(&sender_id, candidate).await;
            }
        }
    }

    async fn emit_roster(&self) {
        let _ = self
            .events
            .send(EndpointEvent::RosterChanged(self.roster.clone()))
            .await;
    }
}

/// Socket read loop: decode frames into envelopes for the driver. Malformed
/// frames are dropped; I/O errors end the loop, which the driver treats as
/// the relay going away.
async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::Sender<Envelope>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match Envelope::decode(&frame) {
            Ok(envelope) => {
                if inbound.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(err) => debug!("Dropping malformed frame from relay: {err}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
