//! Key derivation and message authentication helpers
//!
//! `hkdf_extract` / `hkdf_expand` — HKDF-SHA256 (RFC 5869), used for seed
//!   derivation and session key separation.
//! `hmac_sha256` — covered-component signatures and handshake ack tags.
//! `ct_eq` — constant-time comparison for anything secret-derived.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-Extract: `PRK = Extract(salt, ikm)`.
pub fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    prk.into()
}

/// Expand `ikm` (+ optional `salt`) with `info` into `output.len()` bytes.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Expand an existing PRK (skips the extract step).
pub fn hkdf_expand_prk(prk: &[u8; 32], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// HMAC-SHA256 over `msg`.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality for secret-derived byte strings.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
