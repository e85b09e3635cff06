//! Authenticated Encryption with Associated Data
//!
//! Session traffic uses ChaCha20-Poly1305 (96-bit nonce, 128-bit tag).
//! The bootstrap envelope uses AES-256-GCM; nothing else does.
//!
//! Ciphertext wire format:
//!   [ nonce (12 bytes) | ciphertext + tag ]
//!
//! Decryption failures are opaque: a truncated frame and a bad tag return
//! the same error so a peer learns nothing about which check failed.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{
        generic_array::GenericArray,
        Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload,
    },
    ChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

// ── ChaCha20-Poly1305 (session AEAD) ─────────────────────────────────────────

/// Encrypt `plaintext` with a 32-byte key, prepending a random 12-byte nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn open(key: &[u8; 32], frame: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if frame.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = frame.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

// ── AES-256-GCM (bootstrap envelope only) ────────────────────────────────────

/// Encrypt with AES-256-GCM under a fresh random nonce.
/// Returns (nonce, ciphertext+tag); the envelope decides the frame layout.
pub fn gcm_seal(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok((nonce.into(), ciphertext))
}

/// Decrypt AES-256-GCM ciphertext+tag under an explicit nonce.
pub fn gcm_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let frame = seal(&key, b"agent payload", b"aad").unwrap();
        let pt = open(&key, &frame, b"aad").unwrap();
        assert_eq!(&*pt, b"agent payload");
    }

    #[test]
    fn open_rejects_any_flipped_bit() {
        let key = [7u8; 32];
        let frame = seal(&key, b"agent payload", b"").unwrap();
        for i in 0..frame.len() {
            let mut tampered = frame.clone();
            tampered[i] ^= 0x01;
            assert!(open(&key, &tampered, b"").is_err(), "bit flip at {i} accepted");
        }
    }

    #[test]
    fn open_rejects_truncation() {
        let key = [7u8; 32];
        let frame = seal(&key, b"x", b"").unwrap();
        assert!(open(&key, &frame[..NONCE_LEN + TAG_LEN - 1], b"").is_err());
        assert!(open(&key, &[], b"").is_err());
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [9u8; 32];
        let frame = seal(&key, b"payload", b"aad-a").unwrap();
        assert!(open(&key, &frame, b"aad-b").is_err());
    }

    #[test]
    fn same_plaintext_twice_differs() {
        let key = [3u8; 32];
        let a = seal(&key, b"repeat", b"").unwrap();
        let b = seal(&key, b"repeat", b"").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
    }

    #[test]
    fn gcm_roundtrip_and_aad_binding() {
        let key = [5u8; 32];
        let (nonce, ct) = gcm_seal(&key, b"bootstrap", b"prefix-x").unwrap();
        let pt = gcm_open(&key, &nonce, &ct, b"prefix-x").unwrap();
        assert_eq!(&*pt, b"bootstrap");
        assert!(gcm_open(&key, &nonce, &ct, b"prefix-y").is_err());
    }
}
