//! Identity key management
//!
//! Each agent has one long-term Ed25519 identity keypair whose public half
//! is published in the agent's DID document. The identity key signs every
//! handshake message; it never encrypts anything directly. When a handshake
//! needs to encrypt *to* an identity (the bootstrap envelope), the Ed25519
//! key is converted to X25519 first — see `envelope`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        self.0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key not 32 bytes".into()))
    }

    /// Short fingerprint for log lines: BLAKE3 of the public key, truncated
    /// to 8 bytes, hex-encoded in groups of 4.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..8]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Self {
            public,
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self {
            public,
            secret_bytes: arr,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign arbitrary bytes; returns a 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// This key's public half mapped to X25519, as used by the bootstrap
    /// envelope AAD.
    pub fn x25519_public(&self) -> Result<[u8; 32], CryptoError> {
        let ed_pub = self.public.as_array()?;
        crate::envelope::ed25519_pub_to_x25519(&ed_pub).map(|p| p.to_bytes())
    }

    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }
}
