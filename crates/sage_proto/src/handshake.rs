//! Handshake payloads.
//!
//! Legacy four-phase payloads plus the HPKE Init/Ack pair. Signatures
//! always cover the exact payload bytes that travelled on the wire, never
//! a re-serialisation, so field-order questions cannot break verification.
//!
//! Request and Response are sign-then-encrypt: the inner payload JSON is
//! signed, wrapped in a `SealedPacket`, and the packet JSON becomes the
//! bootstrap-envelope plaintext.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use sage_crypto::identity::IdentityKeyPair;

use crate::ProtoError;

fn decode_32(field: &'static str, b64: &str) -> Result<[u8; 32], ProtoError> {
    let bytes = URL_SAFE_NO_PAD.decode(b64)?;
    bytes.as_slice().try_into().map_err(|_| ProtoError::InvalidField {
        field,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

// ── Legacy payloads ──────────────────────────────────────────────────────────

/// Phase 1 — plaintext, signed. Announces the context and both DIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationPayload {
    pub context_id: String,
    pub init_did: String,
    pub resp_did: String,
    /// Sender wall-clock, unix seconds.
    pub ts: i64,
}

/// Reply to an Invitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationAck {
    pub context_id: String,
    pub accepted: bool,
}

/// Phase 2 — carried inside a bootstrap envelope. The initiator's
/// ephemeral X25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub context_id: String,
    /// Ephemeral X25519 public key (base64url)
    pub eph_pub: String,
    pub ts: i64,
}

impl RequestPayload {
    pub fn eph_pub_bytes(&self) -> Result<[u8; 32], ProtoError> {
        decode_32("eph_pub", &self.eph_pub)
    }
}

/// Phase 3 — symmetric to Request, from the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub context_id: String,
    /// Responder's ephemeral X25519 public key (base64url)
    pub eph_pub: String,
    /// Responder acknowledges the Request was accepted.
    #[serde(default)]
    pub ack: bool,
    pub ts: i64,
}

impl ResponsePayload {
    pub fn eph_pub_bytes(&self) -> Result<[u8; 32], ProtoError> {
        decode_32("eph_pub", &self.eph_pub)
    }
}

/// Phase 4 — plaintext, signed acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    pub context_id: String,
    pub ts: i64,
}

/// Reply to Complete. `kid` is present when the responder minted a key id
/// for the new session; `session_created` is false on an idempotent
/// Complete that found no pending state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAck {
    pub context_id: String,
    pub session_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

// ── Sign-then-encrypt packet ─────────────────────────────────────────────────

/// Inner packet for Request/Response: payload bytes + identity signature,
/// both base64url. The whole packet JSON is the envelope plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPacket {
    pub payload: String,
    pub sig: String,
}

impl SealedPacket {
    /// Sign `inner` and wrap it.
    pub fn build(identity: &IdentityKeyPair, inner: &[u8]) -> Self {
        let sig = identity.sign(inner);
        Self {
            payload: URL_SAFE_NO_PAD.encode(inner),
            sig: URL_SAFE_NO_PAD.encode(&sig),
        }
    }

    /// Verify against the sender's verification key and return the inner
    /// payload bytes.
    pub fn verify_open(&self, verification_key: &[u8]) -> Result<Vec<u8>, ProtoError> {
        let payload = URL_SAFE_NO_PAD.decode(&self.payload)?;
        let sig = URL_SAFE_NO_PAD.decode(&self.sig)?;
        IdentityKeyPair::verify(verification_key, &payload, &sig).map_err(|_| {
            ProtoError::InvalidField {
                field: "sig",
                reason: "verification failed".into(),
            }
        })?;
        Ok(payload)
    }
}

// ── HPKE payloads ────────────────────────────────────────────────────────────

/// HPKE handshake Init (initiator → responder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpkeInitPayload {
    pub context_id: String,
    pub init_did: String,
    pub resp_did: String,
    /// Canonical `info` string; the responder recomputes and compares.
    pub info: String,
    /// Canonical exporter-context string; recomputed and compared.
    pub export_ctx: String,
    /// HPKE encapsulation (32 bytes, base64url)
    pub enc: String,
    /// Replay-unique handshake nonce (base64url)
    pub nonce: String,
    /// Sender wall-clock, unix seconds; checked against MaxSkew.
    pub ts: i64,
    /// Initiator ephemeral X25519 public key — present in PFS mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eph_c: Option<String>,
    /// Optional anti-DoS token (`hmac:…` or `pow:…`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dos_token: Option<String>,
}

impl HpkeInitPayload {
    pub fn enc_bytes(&self) -> Result<[u8; 32], ProtoError> {
        decode_32("enc", &self.enc)
    }

    pub fn eph_c_bytes(&self) -> Result<Option<[u8; 32]>, ProtoError> {
        self.eph_c
            .as_deref()
            .map(|b64| decode_32("eph_c", b64))
            .transpose()
    }
}

/// HPKE handshake Ack (responder → initiator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpkeAckPayload {
    pub context_id: String,
    /// Replay-unique ack nonce (base64url); bound into the ack tag.
    pub nonce: String,
    pub ts: i64,
    /// Key id the responder bound to the new session.
    pub kid: String,
    /// Key-confirmation tag, HMAC-SHA256 (base64url).
    pub ack_tag: String,
    /// Responder ephemeral X25519 public key — PFS mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eph_s: Option<String>,
}

impl HpkeAckPayload {
    pub fn ack_tag_bytes(&self) -> Result<[u8; 32], ProtoError> {
        decode_32("ack_tag", &self.ack_tag)
    }

    pub fn eph_s_bytes(&self) -> Result<Option<[u8; 32]>, ProtoError> {
        self.eph_s
            .as_deref()
            .map(|b64| decode_32("eph_s", b64))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_packet_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let inner = serde_json::to_vec(&RequestPayload {
            context_id: "ctx".into(),
            eph_pub: URL_SAFE_NO_PAD.encode([9u8; 32]),
            ts: 1_700_000_000,
        })
        .unwrap();
        let packet = SealedPacket::build(&identity, &inner);
        let opened = packet.verify_open(&identity.public.0).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn sealed_packet_rejects_wrong_signer() {
        let identity = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let packet = SealedPacket::build(&identity, b"inner");
        assert!(packet.verify_open(&other.public.0).is_err());
    }

    #[test]
    fn init_payload_checks_enc_length() {
        let payload = HpkeInitPayload {
            context_id: "abc123".into(),
            init_did: "did:sage:A".into(),
            resp_did: "did:sage:B".into(),
            info: "i".into(),
            export_ctx: "e".into(),
            enc: URL_SAFE_NO_PAD.encode([1u8; 31]),
            nonce: "n".into(),
            ts: 0,
            eph_c: None,
            dos_token: None,
        };
        assert!(payload.enc_bytes().is_err());
    }

    #[test]
    fn optional_ephemerals_stay_off_the_wire_in_base_mode() {
        let payload = HpkeAckPayload {
            context_id: "abc123".into(),
            nonce: "n".into(),
            ts: 0,
            kid: "kid".into(),
            ack_tag: URL_SAFE_NO_PAD.encode([0u8; 32]),
            eph_s: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("eph_s"));
        let back: HpkeAckPayload = serde_json::from_str(&json).unwrap();
        assert!(back.eph_s_bytes().unwrap().is_none());
    }
}
