//! Transport as a capability.
//!
//! The core ships opaque `WireMessage`s and reads replies; framing,
//! retries, and connection management belong to the host application.
//! Handshake initiators drive a request/response exchange through this
//! trait; responders are handed inbound messages directly.

use async_trait::async_trait;

use sage_proto::WireMessage;

use crate::error::ProtocolError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `msg` to its peer and return the peer's reply.
    async fn request(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError>;
}
