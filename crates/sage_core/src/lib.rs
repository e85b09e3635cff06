//! sage_core — handshakes, sessions, and request authentication for SAGE
//! agent messaging
//!
//! Two handshakes derive a shared 32-byte session seed between agents
//! whose identities are anchored in DIDs:
//! - `handshake::legacy` — the four-phase Invitation → Request → Response
//!   → Complete exchange, bootstrap-encrypted to the peer's identity key.
//! - `handshake::hpke`   — the one-round-trip HPKE exchange with an
//!   optional ephemeral-ephemeral forward-secrecy add-on.
//!
//! The seed feeds `session::SessionManager`, which owns every live
//! session: key separation, AEAD framing, covered-component HMACs, key-id
//! bindings, replay protection, lifetime policy, and zeroizing teardown.
//!
//! External capabilities (DID resolution, transport, ephemeral minting,
//! time) are narrow traits injected at construction; there are no global
//! registries.

pub mod clock;
pub mod ephemeral;
pub mod error;
pub mod handshake;
pub mod nonce_cache;
pub mod resolver;
pub mod session;
pub mod singleflight;
pub mod transport;

pub use error::ProtocolError;
pub use session::manager::SessionManager;
