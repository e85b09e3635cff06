//! X25519 key agreement
//!
//! References:
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!
//! Post-conditions enforced here (non-negotiable):
//!   - A shared secret of all zeroes is rejected in constant time. A
//!     low-order peer public key would otherwise silently collapse the
//!     key space.
//!   - Peer public keys are validated to be exactly 32 bytes and non-zero
//!     before any DH is computed.
//!
//! Ephemeral private keys live inside `EphemeralKeyPair` and are consumed
//! by `diffie_hellman`; `x25519_dalek::StaticSecret` zeroizes on drop, so
//! the private scalar is destroyed as soon as the agreement completes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

// ── Shared secret ─────────────────────────────────────────────────────────────

/// 32-byte X25519 shared secret. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret32([u8; 32]);

impl SharedSecret32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wrap raw bytes that are already known to be a DH output.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ── Key material ──────────────────────────────────────────────────────────────

/// One-shot X25519 keypair. The private half is destroyed when
/// `diffie_hellman` consumes the pair.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn public_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public)
    }

    /// Complete the agreement and destroy the private half.
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> Result<SharedSecret32, CryptoError> {
        let peer = X25519Public::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        checked_shared_secret(shared.as_bytes())
    }
}

/// Long-lived X25519 keypair (the HPKE static KEM key of a responder).
#[derive(ZeroizeOnDrop)]
pub struct KemKeyPair {
    secret_bytes: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl KemKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self {
            secret_bytes: secret.to_bytes(),
            public,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr = validate_public_key(bytes)?;
        let secret = StaticSecret::from(arr);
        let public = X25519Public::from(&secret).to_bytes();
        Ok(Self {
            secret_bytes: arr,
            public,
        })
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret_bytes)
    }

    /// Agreement with a borrowed secret; the pair stays usable (static key).
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Result<SharedSecret32, CryptoError> {
        let peer = X25519Public::from(*peer_public);
        let shared = self.secret().diffie_hellman(&peer);
        checked_shared_secret(shared.as_bytes())
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Check a peer-supplied public key: exactly 32 bytes, not all-zero.
pub fn validate_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("X25519 key must be 32 bytes, got {}", bytes.len())))?;
    if bool::from(arr.ct_eq(&[0u8; 32])) {
        return Err(CryptoError::InvalidKey("all-zero X25519 public key".into()));
    }
    Ok(arr)
}

/// Reject an all-zero DH output in constant time (RFC 7748 §6.1) and
/// confirm the output length.
pub fn checked_shared_secret(bytes: &[u8]) -> Result<SharedSecret32, CryptoError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::KeyAgreement("ECDH output is not 32 bytes".into()))?;
    if bool::from(arr.ct_eq(&[0u8; 32])) {
        return Err(CryptoError::KeyAgreement("zero-valued shared secret".into()));
    }
    Ok(SharedSecret32(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let a_pub = *a.public();
        let b_pub = *b.public();
        let ss_a = a.diffie_hellman(&b_pub).unwrap();
        let ss_b = b.diffie_hellman(&a_pub).unwrap();
        assert_eq!(ss_a.as_bytes(), ss_b.as_bytes());
    }

    #[test]
    fn rejects_low_order_peer() {
        // The neutral element: DH with it always yields all zeroes.
        let a = EphemeralKeyPair::generate();
        let zero_point = [0u8; 32];
        assert!(validate_public_key(&zero_point).is_err());
        // Order-8 point 1: x = 1 is low order and collapses the output.
        let mut low_order = [0u8; 32];
        low_order[0] = 1;
        assert!(a.diffie_hellman(&low_order).is_err());
    }

    #[test]
    fn rejects_truncated_key() {
        assert!(validate_public_key(&[1u8; 31]).is_err());
    }

    #[test]
    fn kem_keypair_roundtrips_through_bytes() {
        let kp = KemKeyPair::generate();
        let restored = KemKeyPair::from_bytes(&kp.secret_bytes).unwrap();
        assert_eq!(kp.public(), restored.public());
    }
}
