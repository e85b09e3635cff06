//! sage_proto — wire types and serialisation for SAGE agent messaging
//!
//! All on-wire types are serialised to JSON and versioned through the
//! task-id string (`handshake/{phase}@v1`) so the format can evolve
//! without breaking peers. Binary fields travel as base64url without
//! padding and are length-checked on decode.
//!
//! # Modules
//! - `message`   — transport envelope (what the transport layer ships)
//! - `handshake` — handshake payloads (what the envelope carries)

pub mod handshake;
pub mod message;

pub use message::{AgentRole, HandshakePhase, WireMessage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unknown task id: {0}")]
    UnknownTaskId(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
