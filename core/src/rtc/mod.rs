//! Peer-negotiation plane — the capability seam and the perfect-negotiation
//! engine

pub mod connection;
pub mod negotiation;

pub use connection::{
    CandidateInit, PeerConnection, PeerConnectionError, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventDetail, SessionDescription, SignalingState,
};
pub use negotiation::{EndpointEvent, NegotiationEngine, NegotiationError, SessionRole};
