//! Bootstrap envelope — one-shot encryption to a peer's identity key.
//!
//! Used only by the legacy handshake's Request and Response phases, before
//! any session key exists. The sender converts the receiver's Ed25519
//! identity public key to X25519, runs Ephemeral-Static ECDH, derives an
//! AES-256-GCM key via HKDF, and authenticates the receiver's converted
//! public key through the associated data.
//!
//! Wire layout:
//!   [ ephSenderX25519Pub (32) | nonce (12) | AES-GCM ciphertext+tag ]
//!
//! AAD = PREFIX ‖ receiverX25519Pub.
//!
//! Ed25519→X25519 conversions mirror libsignal's identity-key approach:
//! the secret via the clamped SHA-512 expansion (RFC 8032 key expansion,
//! RFC 7748 §5 clamping), the public via the Edwards→Montgomery birational
//! map.

use curve25519_dalek::edwards::CompressedEdwardsY;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead,
    ecdh::{self, SharedSecret32},
    error::CryptoError,
    identity::IdentityKeyPair,
};

/// Domain prefix bound into the envelope AAD.
pub const BOOTSTRAP_PREFIX: &[u8] = b"sage/hs-bootstrap|v1";

const KEY_INFO: &[u8] = b"sage/bootstrap-key|v1";
const MIN_FRAME: usize = 32 + aead::NONCE_LEN + aead::TAG_LEN;

// ── Ed25519 → X25519 conversion ──────────────────────────────────────────────

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// The scalar is the lower half of the same SHA-512 key expansion Ed25519
/// signing performs (RFC 8032 §5.1.5), clamped per RFC 7748 §5.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut expanded = Sha512::digest(ed_secret);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&expanded[..32]);
    expanded.as_mut_slice().zeroize();
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    let secret = StaticSecret::from(scalar);
    scalar.zeroize();
    secret
}

/// Map an Ed25519 verifying key onto Curve25519's Montgomery form, the
/// X25519 view of the same point.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    let point = CompressedEdwardsY::from_slice(ed_pub)
        .ok()
        .and_then(|compressed| compressed.decompress())
        .ok_or_else(|| CryptoError::InvalidKey("not a valid Ed25519 point".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

// ── Seal / open ──────────────────────────────────────────────────────────────

fn derive_envelope_key(
    shared: &SharedSecret32,
    eph_pub: &[u8; 32],
    receiver_x: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pub);
    salt[32..].copy_from_slice(receiver_x);
    let mut key = [0u8; 32];
    crate::kdf::hkdf_expand(shared.as_bytes(), Some(&salt), KEY_INFO, &mut key)?;
    Ok(key)
}

fn aad_for(receiver_x: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(BOOTSTRAP_PREFIX.len() + 32);
    aad.extend_from_slice(BOOTSTRAP_PREFIX);
    aad.extend_from_slice(receiver_x);
    aad
}

/// Encrypt `plaintext` so only the holder of `peer_ed_pub`'s secret can
/// read it.
pub fn seal(peer_ed_pub: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let receiver_x = ed25519_pub_to_x25519(peer_ed_pub)?.to_bytes();

    let eph = StaticSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph).to_bytes();
    let shared =
        ecdh::checked_shared_secret(eph.diffie_hellman(&X25519Public::from(receiver_x)).as_bytes())?;

    let mut key = derive_envelope_key(&shared, &eph_pub, &receiver_x)?;
    let (nonce, ciphertext) = aead::gcm_seal(&key, plaintext, &aad_for(&receiver_x))?;
    key.zeroize();

    let mut out = Vec::with_capacity(32 + aead::NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&eph_pub);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope addressed to `identity`.
pub fn open(identity: &IdentityKeyPair, frame: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if frame.len() < MIN_FRAME {
        return Err(CryptoError::MalformedEnvelope);
    }
    let eph_pub = ecdh::validate_public_key(&frame[..32])?;
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce.copy_from_slice(&frame[32..32 + aead::NONCE_LEN]);
    let ciphertext = &frame[32 + aead::NONCE_LEN..];

    let self_x = ed25519_secret_to_x25519(identity.secret_bytes());
    let self_x_pub = X25519Public::from(&self_x).to_bytes();
    let shared =
        ecdh::checked_shared_secret(self_x.diffie_hellman(&X25519Public::from(eph_pub)).as_bytes())?;

    let mut key = derive_envelope_key(&shared, &eph_pub, &self_x_pub)?;
    let plaintext = aead::gcm_open(&key, &nonce, ciphertext, &aad_for(&self_x_pub));
    key.zeroize();
    plaintext
}
