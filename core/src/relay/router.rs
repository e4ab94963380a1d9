//! Relay Router — bridges accepted connections to the registry and to each
//! other
//!
//! Each connection gets a reader task plus a driver task with a bounded
//! outbound queue. The router never interprets Offer/Answer/Candidate
//! content; it only reads `kind` and `target`, and it overwrites `sender`
//! with the authenticated id before forwarding.

use crate::relay::registry::{ClientRegistry, RegistryError};
use crate::signaling::envelope::{
    read_frame, write_frame, ClientProperties, ClientRecord, Envelope, JoinRequest, Payload,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum concurrent clients (forwarded to the registry bound)
    pub max_clients: usize,
    /// Depth of each connection's outbound queue; a full queue marks the
    /// connection as dead
    pub send_queue_depth: usize,
    /// How long a fresh connection may take to present its JoinRequest
    pub handshake_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_clients: 256,
            send_queue_depth: 64,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Router error types
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Missing identity in handshake")]
    MissingIdentity,
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Registry rejected join: {0}")]
    Rejected(#[from] RegistryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection handle kept in the live connection table
struct ConnectionHandle {
    /// Bounded outbound queue of encoded frames
    outbound: mpsc::Sender<Vec<u8>>,
    /// Forces the driver loop to exit without draining the queue
    shutdown: Arc<Notify>,
}

/// The signaling relay.
///
/// The registry is injected at construction; the router owns only the
/// socket-facing connection table. No lock is held across a network send:
/// queue handles are cloned out under the read lock and used after release.
pub struct RelayRouter {
    config: RouterConfig,
    registry: Arc<ClientRegistry>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl RelayRouter {
    pub fn new(config: RouterConfig, registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Accept loop. Runs until the listener fails; each connection is served
    /// on its own task and cannot take the router down with it.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RouterError> {
        info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = router.handle_connection(stream, addr.to_string()).await {
                    debug!("Connection from {addr} ended: {err}");
                }
            });
        }
    }

    /// Number of live connections (test and status visibility)
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        address: String,
    ) -> Result<(), RouterError> {
        // Handshake: first frame must be a JoinRequest with username and role
        let join = match tokio::time::timeout(self.config.handshake_timeout, read_frame(&mut stream))
            .await
        {
            Err(_) => return Err(RouterError::HandshakeTimeout),
            Ok(frame) => match frame.ok().and_then(|f| JoinRequest::decode(&f).ok()) {
                Some(join) => join,
                None => return Err(RouterError::MissingIdentity),
            },
        };

        if join.username.is_empty() || join.role.is_empty() {
            return Err(RouterError::MissingIdentity);
        }

        let id = join
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let properties = ClientProperties {
            username: join.username,
            role: join.role,
            joined_at: unix_millis(),
        };

        // Keep the existing registration on a duplicate id: terminate the
        // newcomer, not the established client.
        let record = self
            .registry
            .register(id.clone(), address.clone(), properties)?;

        info!(
            "Client {} ({}) joined from {}, total {}",
            record.id,
            record.properties.username,
            address,
            self.registry.len()
        );

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(self.config.send_queue_depth);
        let shutdown = Arc::new(Notify::new());
        self.connections.write().insert(
            id.clone(),
            ConnectionHandle {
                outbound: outbound_tx.clone(),
                shutdown: Arc::clone(&shutdown),
            },
        );

        self.broadcast(&id, Envelope::new(Payload::PresenceEnter(record.clone())));
        self.enqueue_to(&id, Envelope::new(Payload::PresenceEntered(record.clone())));
        self.enqueue_to(
            &id,
            Envelope::new(Payload::PresenceList(self.registry.snapshot(Some(&id)))),
        );

        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(self.config.send_queue_depth);
        let reader = tokio::spawn(read_loop(read_half, inbound_tx));

        self.drive_connection(&id, inbound_rx, outbound_rx, write_half, shutdown)
            .await;

        reader.abort();
        self.disconnect(&id);
        Ok(())
    }

    /// Pump inbound envelopes and the outbound queue until either side ends
    /// or the connection is force-dropped.
    async fn drive_connection(
        &self,
        id: &str,
        mut inbound: mpsc::Receiver<Envelope>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        mut writer: OwnedWriteHalf,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.route(id, envelope),
                    None => break,
                },
                frame = outbound.recv() => match frame {
                    // A force-drop must also interrupt a write that is
                    // stalled on a dead socket, not just an idle loop.
                    Some(frame) => tokio::select! {
                        result = write_frame(&mut writer, &frame) => {
                            if result.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.notified() => {
                            debug!("Connection {id} force-dropped mid-write");
                            break;
                        }
                    },
                    None => break,
                },
                _ = shutdown.notified() => {
                    debug!("Connection {id} force-dropped");
                    break;
                }
            }
        }
    }

    /// Forward a client envelope. Only Offer/Answer/Candidate are routable;
    /// presence kinds are relay-originated and ignored from clients.
    fn route(&self, sender_id: &str, mut envelope: Envelope) {
        match envelope.payload {
            Payload::Offer(_) | Payload::Answer(_) | Payload::Candidate(_) => {}
            _ => {
                debug!("Ignoring {} from client {sender_id}", envelope.kind());
                return;
            }
        }

        let Some(target) = envelope.target.clone() else {
            debug!("Dropping untargeted {} from {sender_id}", envelope.kind());
            return;
        };

        // Never trust a client-supplied sender field
        envelope.sender = Some(sender_id.to_string());

        let handle = {
            let connections = self.connections.read();
            connections.get(&target).map(|h| h.outbound.clone())
        };
        match handle {
            Some(outbound) => {
                debug!("Routing {} from {sender_id} to {target}", envelope.kind());
                if let Ok(frame) = envelope.encode() {
                    self.try_deliver(&target, &outbound, frame);
                }
            }
            // Peer already left; negotiation traffic is racy with
            // disconnects, so this is not an error.
            None => debug!(
                "Dropping {} from {sender_id}: target {target} not connected",
                envelope.kind()
            ),
        }
    }

    /// Broadcast a presence envelope to every connection except the origin
    fn broadcast(&self, excluding: &str, envelope: Envelope) {
        let Ok(frame) = envelope.encode() else {
            return;
        };
        let targets: Vec<(String, mpsc::Sender<Vec<u8>>)> = {
            let connections = self.connections.read();
            connections
                .iter()
                .filter(|(id, _)| id.as_str() != excluding)
                .map(|(id, handle)| (id.clone(), handle.outbound.clone()))
                .collect()
        };
        for (id, outbound) in targets {
            self.try_deliver(&id, &outbound, frame.clone());
        }
    }

    /// Queue a relay-originated envelope to one client
    fn enqueue_to(&self, id: &str, envelope: Envelope) {
        let Ok(frame) = envelope.encode() else {
            return;
        };
        let handle = {
            let connections = self.connections.read();
            connections.get(id).map(|h| h.outbound.clone())
        };
        if let Some(outbound) = handle {
            self.try_deliver(id, &outbound, frame);
        }
    }

    /// Non-blocking delivery into a bounded queue. A full queue means the
    /// peer is too slow or dead; drop that connection rather than stall the
    /// sender.
    fn try_deliver(&self, id: &str, outbound: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>) {
        match outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Send queue full for client {id}, dropping connection");
                self.force_drop(id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Send queue closed for client {id}");
            }
        }
    }

    /// Signal a connection's driver to exit immediately
    fn force_drop(&self, id: &str) {
        let shutdown = {
            let connections = self.connections.read();
            connections.get(id).map(|h| Arc::clone(&h.shutdown))
        };
        if let Some(shutdown) = shutdown {
            shutdown.notify_one();
        }
    }

    /// Tear down a connection: drop the queue, unregister, announce the exit.
    /// Safe to call once per connection lifecycle; the registry makes the
    /// unregister idempotent.
    fn disconnect(&self, id: &str) {
        self.connections.write().remove(id);
        if let Some(record) = self.registry.unregister(id) {
            info!(
                "Client {} ({}) left, total {}",
                record.id,
                record.properties.username,
                self.registry.len()
            );
            self.broadcast(id, Envelope::new(Payload::PresenceExit(record)));
        }
    }
}

/// Socket read loop: decode frames, forward envelopes to the driver.
/// Malformed frames are dropped and the connection stays open; I/O errors
/// end the loop (treated as disconnect by the driver).
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
            Err(err) => debug!("Dropping malformed frame: {err}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpStream;

    async fn start_router(config: RouterConfig) -> (Arc<RelayRouter>, std::net::SocketAddr) {
        let registry = Arc::new(ClientRegistry::new(config.max_clients));
        let router = RelayRouter::new(config, registry);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(Arc::clone(&router).serve(listener));
        (router, addr)
    }

    async fn join(
        addr: std::net::SocketAddr,
        id: Option<&str>,
        username: &str,
    ) -> (TcpStream, ClientRecord, Vec<ClientRecord>) {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = JoinRequest {
            id: id.map(str::to_string),
            username: username.to_string(),
            role: "participant".to_string(),
        };
        write_frame(&mut stream, &request.encode().expect("encode"))
            .await
            .expect("send join");

        let entered = recv(&mut stream).await;
        let Payload::PresenceEntered(record) = entered.payload else {
            panic!("expected PresenceEntered, got {}", entered.kind());
        };
        let list = recv(&mut stream).await;
        let Payload::PresenceList(roster) = list.payload else {
            panic!("expected PresenceList, got {}", list.kind());
        };
        (stream, record, roster)
    }

    async fn recv(stream: &mut TcpStream) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .expect("timed out waiting for envelope")
            .expect("read frame");
        Envelope::decode(&frame).expect("decode envelope")
    }

    #[tokio::test]
    async fn test_join_presence_consistency() {
        let (_router, addr) = start_router(RouterConfig::default()).await;

        let (mut alice, alice_record, alice_roster) = join(addr, Some("alice"), "alice").await;
        assert_eq!(alice_record.id, "alice");
        assert!(alice_roster.is_empty());

        let (_bob, bob_record, bob_roster) = join(addr, Some("bob"), "bob").await;
        // B's list contains A but not B
        assert_eq!(bob_roster.len(), 1);
        assert_eq!(bob_roster[0].id, "alice");

        // A receives a PresenceEnter for B
        let enter = recv(&mut alice).await;
        match enter.payload {
            Payload::PresenceEnter(record) => assert_eq!(record.id, bob_record.id),
            other => panic!("expected PresenceEnter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relay_assigns_id_when_absent() {
        let (_router, addr) = start_router(RouterConfig::default()).await;
        let (_stream, record, _) = join(addr, None, "anon").await;
        assert!(!record.id.is_empty());
        assert!(record.properties.joined_at > 0);
    }

    #[tokio::test]
    async fn test_missing_identity_terminates() {
        let (router, addr) = start_router(RouterConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = JoinRequest {
            id: None,
            username: String::new(),
            role: "participant".to_string(),
        };
        write_frame(&mut stream, &request.encode().expect("encode"))
            .await
            .expect("send join");

        // Connection closes without a PresenceEntered
        let frame = read_frame(&mut stream).await;
        assert!(frame.is_err());
        assert_eq!(router.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_existing_connection() {
        let (router, addr) = start_router(RouterConfig::default()).await;
        let (mut first, _, _) = join(addr, Some("dup"), "first").await;

        let mut second = TcpStream::connect(addr).await.expect("connect");
        let request = JoinRequest {
            id: Some("dup".to_string()),
            username: "second".to_string(),
            role: "participant".to_string(),
        };
        write_frame(&mut second, &request.encode().expect("encode"))
            .await
            .expect("send join");
        assert!(read_frame(&mut second).await.is_err());

        // Existing client still routable to itself via a third party
        let (mut carol, _, _) = join(addr, Some("carol"), "carol").await;
        let offer = Envelope::to_target(Payload::Offer(json!({"sdp": "v=0"})), "dup");
        write_frame(&mut carol, &offer.encode().expect("encode"))
            .await
            .expect("send offer");

        // first sees carol's join, then the offer
        let _enter = recv(&mut first).await;
        let routed = recv(&mut first).await;
        assert_eq!(routed.kind(), "Offer");
        assert_eq!(router.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_route_overwrites_sender() {
        let (_router, addr) = start_router(RouterConfig::default()).await;
        let (mut alice, _, _) = join(addr, Some("alice"), "alice").await;
        let (mut bob, _, _) = join(addr, Some("bob"), "bob").await;
        let _enter = recv(&mut alice).await;

        let mut offer = Envelope::to_target(Payload::Offer(json!({"sdp": "v=0"})), "bob");
        offer.sender = Some("mallory".to_string()); // forged
        write_frame(&mut alice, &offer.encode().expect("encode"))
            .await
            .expect("send offer");

        let routed = recv(&mut bob).await;
        assert_eq!(routed.sender.as_deref(), Some("alice"));
        assert_eq!(routed.target.as_deref(), Some("bob"));
        match routed.payload {
            Payload::Offer(content) => assert_eq!(content, json!({"sdp": "v=0"})),
            other => panic!("expected Offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_target_silently_dropped() {
        let (_router, addr) = start_router(RouterConfig::default()).await;
        let (mut alice, _, _) = join(addr, Some("alice"), "alice").await;
        let (mut bob, _, _) = join(addr, Some("bob"), "bob").await;
        let _enter = recv(&mut alice).await;

        let offer = Envelope::to_target(Payload::Offer(json!({"sdp": "v=0"})), "ghost");
        write_frame(&mut alice, &offer.encode().expect("encode"))
            .await
            .expect("send offer");

        // Relay still alive and routing afterwards
        let offer = Envelope::to_target(Payload::Offer(json!({"sdp": "v=1"})), "bob");
        write_frame(&mut alice, &offer.encode().expect("encode"))
            .await
            .expect("send offer");
        let routed = recv(&mut bob).await;
        assert_eq!(routed.kind(), "Offer");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (_router, addr) = start_router(RouterConfig::default()).await;
        let (mut alice, _, _) = join(addr, Some("alice"), "alice").await;
        let (mut bob, _, _) = join(addr, Some("bob"), "bob").await;
        let _enter = recv(&mut alice).await;

        write_frame(&mut alice, b"{\"kind\": \"Garbage\"}")
            .await
            .expect("send garbage");

        let answer = Envelope::to_target(Payload::Answer(json!({"sdp": "v=0"})), "bob");
        write_frame(&mut alice, &answer.encode().expect("encode"))
            .await
            .expect("send answer");
        let routed = recv(&mut bob).await;
        assert_eq!(routed.kind(), "Answer");
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_exit() {
        let (_router, addr) = start_router(RouterConfig::default()).await;
        let (mut alice, _, _) = join(addr, Some("alice"), "alice").await;
        let (bob, _, _) = join(addr, Some("bob"), "bob").await;
        let _enter = recv(&mut alice).await;

        drop(bob);

        let exit = recv(&mut alice).await;
        match exit.payload {
            Payload::PresenceExit(record) => assert_eq!(record.id, "bob"),
            other => panic!("expected PresenceExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped_without_stalling_relay() {
        let config = RouterConfig {
            send_queue_depth: 2,
            ..Default::default()
        };
        let (router, addr) = start_router(config).await;

        // slug joins and never reads
        let (_slug, _, _) = join(addr, Some("slug"), "slug").await;
        let (mut flooder, _, _) = join(addr, Some("flooder"), "flooder").await;

        // Frames large enough that slug's socket buffer fills, its writer
        // stalls, and its bounded queue overflows
        let sdp = "a".repeat(64 * 1024);
        for _ in 0..256 {
            let offer = Envelope::to_target(Payload::Offer(json!({"sdp": sdp.clone()})), "slug");
            if write_frame(&mut flooder, &offer.encode().expect("encode"))
                .await
                .is_err()
            {
                break;
            }
        }

        // The flood completed above without hanging the flooder; slug must
        // have been force-dropped and unregistered
        for _ in 0..100 {
            if !router.registry.contains("slug") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!router.registry.contains("slug"));
        assert!(router.registry.contains("flooder"));
    }
}
