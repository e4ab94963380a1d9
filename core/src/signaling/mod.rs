//! Signaling plane — wire envelopes and the endpoint transport

pub mod client;
pub mod envelope;

pub use client::{SignalingClient, SignalingError};
pub use envelope::{ClientProperties, ClientRecord, CodecError, Envelope, JoinRequest, Payload};
