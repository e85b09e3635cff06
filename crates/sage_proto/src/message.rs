//! Transport envelope — what the transport layer ships between agents.
//!
//! The transport is a dumb pipe: it sees an opaque payload, the sender's
//! DID, an Ed25519 signature over the payload bytes, and a small string
//! metadata map. Handshake phases are distinguished by the task-id string
//! (`handshake/{phase}@v1`), which also carries the wire version.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use sage_crypto::identity::IdentityKeyPair;

use crate::ProtoError;

// ── Metadata keys ────────────────────────────────────────────────────────────

pub const META_DID: &str = "did";
pub const META_SIGNATURE: &str = "signature";
pub const META_KID: &str = "kid";
pub const META_ACK_TAG: &str = "ackTagB64";
pub const META_EPH_S: &str = "ephS";

/// Task ids for the HPKE handshake round trip.
pub const TASK_HPKE_INIT: &str = "handshake/hpke-init@v1";
pub const TASK_HPKE_ACK: &str = "handshake/hpke-ack@v1";

// ── Phases ───────────────────────────────────────────────────────────────────

/// The four legacy handshake phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    Invitation,
    Request,
    Response,
    Complete,
}

impl HandshakePhase {
    pub fn task_id(&self) -> &'static str {
        match self {
            Self::Invitation => "handshake/invitation@v1",
            Self::Request => "handshake/request@v1",
            Self::Response => "handshake/response@v1",
            Self::Complete => "handshake/complete@v1",
        }
    }

    pub fn from_task_id(task_id: &str) -> Result<Self, ProtoError> {
        match task_id {
            "handshake/invitation@v1" => Ok(Self::Invitation),
            "handshake/request@v1" => Ok(Self::Request),
            "handshake/response@v1" => Ok(Self::Response),
            "handshake/complete@v1" => Ok(Self::Complete),
            other => Err(ProtoError::UnknownTaskId(other.to_string())),
        }
    }
}

/// Sender role tag carried on every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    User,
    Agent,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// On-wire message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Random UUID, used for ack/dedup only.
    pub id: String,

    /// Handshake context this message belongs to.
    pub context_id: String,

    /// `handshake/{phase}@v1` — selects the payload type and wire version.
    pub task_id: String,

    /// Payload bytes (JSON or bootstrap ciphertext), base64url-encoded.
    pub payload: String,

    /// Sender DID.
    pub did: String,

    /// Ed25519 signature over the raw payload bytes, base64url-encoded.
    pub signature: String,

    pub role: AgentRole,

    /// Free-form metadata (`did`, `signature`, `kid`, `ackTagB64`, `ephS`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl WireMessage {
    pub fn new(
        context_id: impl Into<String>,
        task_id: impl Into<String>,
        payload: &[u8],
        did: impl Into<String>,
        role: AgentRole,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            task_id: task_id.into(),
            payload: URL_SAFE_NO_PAD.encode(payload),
            did: did.into(),
            signature: String::new(),
            role,
            metadata: HashMap::new(),
        }
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.payload)?)
    }

    /// Sign the payload with the sender identity; mirrors the signature into
    /// the metadata map alongside the DID.
    pub fn sign(&mut self, identity: &IdentityKeyPair) -> Result<(), ProtoError> {
        let payload = self.payload_bytes()?;
        let sig = identity.sign(&payload);
        self.signature = URL_SAFE_NO_PAD.encode(&sig);
        self.metadata.insert(META_DID.into(), self.did.clone());
        self.metadata
            .insert(META_SIGNATURE.into(), self.signature.clone());
        Ok(())
    }

    /// Verify the envelope signature against a resolved verification key.
    pub fn verify(&self, verification_key: &[u8]) -> Result<(), ProtoError> {
        if self.signature.is_empty() {
            return Err(ProtoError::InvalidField {
                field: "signature",
                reason: "missing".into(),
            });
        }
        let payload = self.payload_bytes()?;
        let sig = URL_SAFE_NO_PAD.decode(&self.signature)?;
        IdentityKeyPair::verify(verification_key, &payload, &sig).map_err(|_| {
            ProtoError::InvalidField {
                field: "signature",
                reason: "verification failed".into(),
            }
        })
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_task_ids_roundtrip() {
        for phase in [
            HandshakePhase::Invitation,
            HandshakePhase::Request,
            HandshakePhase::Response,
            HandshakePhase::Complete,
        ] {
            assert_eq!(HandshakePhase::from_task_id(phase.task_id()).unwrap(), phase);
        }
        assert!(HandshakePhase::from_task_id("handshake/invitation@v2").is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let mut msg = WireMessage::new("ctx-1", HandshakePhase::Invitation.task_id(), b"{}", "did:sage:a", AgentRole::Agent);
        msg.sign(&identity).unwrap();
        msg.verify(&identity.public.0).unwrap();
        assert_eq!(msg.meta(META_DID), Some("did:sage:a"));
        assert!(msg.meta(META_SIGNATURE).is_some());
    }

    #[test]
    fn verify_rejects_payload_swap() {
        let identity = IdentityKeyPair::generate();
        let mut msg = WireMessage::new("ctx-1", HandshakePhase::Invitation.task_id(), b"{}", "did:sage:a", AgentRole::Agent);
        msg.sign(&identity).unwrap();
        msg.payload = URL_SAFE_NO_PAD.encode(b"{\"x\":1}");
        assert!(msg.verify(&identity.public.0).is_err());
    }

    #[test]
    fn verify_rejects_unsigned() {
        let identity = IdentityKeyPair::generate();
        let msg = WireMessage::new("ctx-1", TASK_HPKE_INIT, b"{}", "did:sage:a", AgentRole::Agent);
        assert!(msg.verify(&identity.public.0).is_err());
    }

    #[test]
    fn envelope_serialises_with_metadata() {
        let identity = IdentityKeyPair::generate();
        let mut msg = WireMessage::new("ctx", TASK_HPKE_ACK, b"{}", "did:sage:b", AgentRole::Agent);
        msg.sign(&identity).unwrap();
        msg.set_meta(META_KID, "kid-1");
        let json = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.meta(META_KID), Some("kid-1"));
        back.verify(&identity.public.0).unwrap();
    }
}
