//! Relay plane — client registry and the envelope router
//!
//! The relay is a pure transport: it registers who is online, routes
//! negotiation envelopes by target id, and broadcasts presence. It never
//! reads envelope content and never participates in a negotiated session.

pub mod registry;
pub mod router;

pub use registry::{ClientRegistry, RegistryError, RegistryStats};
pub use router::{RelayRouter, RouterConfig, RouterError};
