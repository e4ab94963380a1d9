// Wavelink Core — Signaling Spine
//
// A central relay gets two browsers talking long enough to negotiate a
// direct connection; after that it is out of the picture. Everything here
// serves that handoff: presence, envelope routing, perfect negotiation.

pub mod relay;
pub mod rtc;
pub mod signaling;

pub use relay::{ClientRegistry, RelayRouter, RouterConfig};
pub use rtc::{
    EndpointEvent, NegotiationEngine, PeerConnection, PeerConnectionFactory, SessionRole,
};
pub use signaling::{ClientRecord, Envelope, JoinRequest, Payload, SignalingClient};
