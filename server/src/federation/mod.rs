//! Server-to-server federation.
//!
//! Inbound: `gatekeeper` authenticates a signed request, `registry` routes
//! its envelope to a typed handler, and `engine` applies sync events to
//! mirrored groups under the version chain.
//!
//! Outbound: `client` signs envelopes with the local key from `keys` and fans
//! them out; `owner` is the publishing side for groups this domain owns.

pub mod client;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod gatekeeper;
pub mod header;
pub mod keys;
pub mod maintenance;
pub mod owner;
pub mod registry;
pub mod requests;

pub use client::{Delivery, FederationClient};
pub use envelope::{Envelope, EventPayload};
pub use gatekeeper::{authenticate, record_event, VerifiedRequest};
pub use keys::KeyManager;
pub use registry::{EventContext, EventRegistry};

use crate::state::SharedState;

/// Inbound event endpoint.
pub const EVENT_PATH: &str = "/_federation/v1/event";
/// Public key endpoint.
pub const KEY_PATH: &str = "/_federation/v1/key";

/// Registry with every federation event this server understands.
pub fn build_registry() -> EventRegistry<SharedState> {
    let mut registry = EventRegistry::new();
    engine::register_handlers(&mut registry);
    owner::register_handlers(&mut registry);
    requests::register_handlers(&mut registry);
    registry
}
