//! Ephemeral key minting for the legacy handshake.
//!
//! The responder does not generate its handshake ephemeral inline; it
//! asks this capability, which owns the private half until the Complete
//! phase supplies the peer's public key. `complete` performs the ECDH and
//! destroys the private key; `discard` destroys it without agreement
//! (abandoned handshakes).

use std::collections::HashMap;
use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use sage_crypto::ecdh::{self, SharedSecret32};

use crate::error::ProtocolError;

pub trait EphemeralProvider: Send + Sync {
    /// Mint an ephemeral X25519 pair for `ctx_id`; returns the raw public
    /// key and its base64url encoding. The private half stays inside the
    /// provider.
    fn ask_ephemeral(&self, ctx_id: &str) -> Result<([u8; 32], String), ProtocolError>;

    /// Finish the agreement for `ctx_id` and destroy the private half.
    fn complete(&self, ctx_id: &str, peer_eph: &[u8; 32]) -> Result<SharedSecret32, ProtocolError>;

    /// Destroy the private half without completing (abandoned handshake).
    fn discard(&self, ctx_id: &str);
}

/// In-memory provider; private halves are zeroized on drop by
/// `x25519_dalek::StaticSecret` itself.
#[derive(Default)]
pub struct MemoryEphemeralProvider {
    pending: Mutex<HashMap<String, StaticSecret>>,
}

impl MemoryEphemeralProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EphemeralProvider for MemoryEphemeralProvider {
    fn ask_ephemeral(&self, ctx_id: &str) -> Result<([u8; 32], String), ProtocolError> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        self.pending
            .lock()
            .expect("ephemeral store poisoned")
            .insert(ctx_id.to_string(), secret);
        Ok((public, URL_SAFE_NO_PAD.encode(public)))
    }

    fn complete(&self, ctx_id: &str, peer_eph: &[u8; 32]) -> Result<SharedSecret32, ProtocolError> {
        let secret = self
            .pending
            .lock()
            .expect("ephemeral store poisoned")
            .remove(ctx_id)
            .ok_or_else(|| {
                ProtocolError::EphemeralFailure(format!("no pending ephemeral for {ctx_id}"))
            })?;
        let shared = secret.diffie_hellman(&X25519Public::from(*peer_eph));
        ecdh::checked_shared_secret(shared.as_bytes())
            .map_err(|_| ProtocolError::KeyAgreementFailure)
    }

    fn discard(&self, ctx_id: &str) {
        self.pending
            .lock()
            .expect("ephemeral store poisoned")
            .remove(ctx_id);
    }
}
