//! HPKE base mode, export-only (RFC 9180)
//!
//! Suite: DHKEM(X25519, HKDF-SHA256) + HKDF-SHA256, AEAD id 0xFFFF
//! (export-only). The handshake never uses HPKE's AEAD; the encapsulated
//! secret feeds the exporter, and the exporter output becomes the session
//! seed. Labeled KDF steps follow RFC 9180 §4 byte-for-byte so both peers
//! of a handshake derive identical exporter values.
//!
//! Flow:
//!   sender:   (enc, ctx) = setup_base_sender(pkR, info)
//!   receiver:        ctx = setup_base_receiver(enc, skR, info)
//!   both:     exporter = ctx.export(exporter_context, 32)

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ecdh::{self, KemKeyPair},
    error::CryptoError,
    kdf,
};

pub const ENC_LEN: usize = 32;

const MODE_BASE: u8 = 0x00;
const KEM_X25519_HKDF_SHA256: u16 = 0x0020;
const KDF_HKDF_SHA256: u16 = 0x0001;
const AEAD_EXPORT_ONLY: u16 = 0xFFFF;

fn suite_id_kem() -> [u8; 5] {
    let mut id = [0u8; 5];
    id[..3].copy_from_slice(b"KEM");
    id[3..].copy_from_slice(&KEM_X25519_HKDF_SHA256.to_be_bytes());
    id
}

fn suite_id_hpke() -> [u8; 10] {
    let mut id = [0u8; 10];
    id[..4].copy_from_slice(b"HPKE");
    id[4..6].copy_from_slice(&KEM_X25519_HKDF_SHA256.to_be_bytes());
    id[6..8].copy_from_slice(&KDF_HKDF_SHA256.to_be_bytes());
    id[8..].copy_from_slice(&AEAD_EXPORT_ONLY.to_be_bytes());
    id
}

// ── Labeled KDF (RFC 9180 §4) ────────────────────────────────────────────────

fn labeled_extract(suite_id: &[u8], salt: &[u8], label: &[u8], ikm: &[u8]) -> [u8; 32] {
    let mut labeled_ikm = Vec::with_capacity(7 + suite_id.len() + label.len() + ikm.len());
    labeled_ikm.extend_from_slice(b"HPKE-v1");
    labeled_ikm.extend_from_slice(suite_id);
    labeled_ikm.extend_from_slice(label);
    labeled_ikm.extend_from_slice(ikm);
    let prk = kdf::hkdf_extract(Some(salt), &labeled_ikm);
    labeled_ikm.zeroize();
    prk
}

fn labeled_expand(
    suite_id: &[u8],
    prk: &[u8; 32],
    label: &[u8],
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let mut labeled_info = Vec::with_capacity(9 + suite_id.len() + label.len() + info.len());
    labeled_info.extend_from_slice(&(output.len() as u16).to_be_bytes());
    labeled_info.extend_from_slice(b"HPKE-v1");
    labeled_info.extend_from_slice(suite_id);
    labeled_info.extend_from_slice(label);
    labeled_info.extend_from_slice(info);
    kdf::hkdf_expand_prk(prk, &labeled_info, output)
}

// ── DHKEM(X25519, HKDF-SHA256) ───────────────────────────────────────────────

fn extract_and_expand(dh: &[u8; 32], kem_context: &[u8]) -> Result<[u8; 32], CryptoError> {
    let suite = suite_id_kem();
    let mut eae_prk = labeled_extract(&suite, b"", b"eae_prk", dh);
    let mut shared_secret = [0u8; 32];
    labeled_expand(&suite, &eae_prk, b"shared_secret", kem_context, &mut shared_secret)?;
    eae_prk.zeroize();
    Ok(shared_secret)
}

/// Encapsulate to the receiver's static public key. The ephemeral scalar is
/// destroyed before this returns.
fn encap(pk_r: &[u8; 32]) -> Result<([u8; ENC_LEN], [u8; 32]), CryptoError> {
    let eph = StaticSecret::random_from_rng(OsRng);
    let enc = X25519Public::from(&eph).to_bytes();

    let dh = eph.diffie_hellman(&X25519Public::from(*pk_r));
    let dh = ecdh::checked_shared_secret(dh.as_bytes())?;

    let mut kem_context = [0u8; 64];
    kem_context[..32].copy_from_slice(&enc);
    kem_context[32..].copy_from_slice(pk_r);

    let shared_secret = extract_and_expand(dh.as_bytes(), &kem_context)?;
    Ok((enc, shared_secret))
}

/// Decapsulate with the receiver's static secret.
fn decap(enc: &[u8; ENC_LEN], kem: &KemKeyPair) -> Result<[u8; 32], CryptoError> {
    let enc_pub = ecdh::validate_public_key(enc)?;
    let dh = kem.diffie_hellman(&enc_pub)?;

    let mut kem_context = [0u8; 64];
    kem_context[..32].copy_from_slice(enc);
    kem_context[32..].copy_from_slice(kem.public());

    extract_and_expand(dh.as_bytes(), &kem_context)
}

// ── Key schedule & exporter ──────────────────────────────────────────────────

/// Export-only HPKE context: just the exporter secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Exporter {
    exporter_secret: [u8; 32],
}

impl Exporter {
    /// `Export(exporter_context, 32)`.
    pub fn export(&self, exporter_context: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut out = [0u8; 32];
        labeled_expand(
            &suite_id_hpke(),
            &self.exporter_secret,
            b"sec",
            exporter_context,
            &mut out,
        )?;
        Ok(out)
    }
}

fn key_schedule_base(shared_secret: &mut [u8; 32], info: &[u8]) -> Result<Exporter, CryptoError> {
    let suite = suite_id_hpke();

    let psk_id_hash = labeled_extract(&suite, b"", b"psk_id_hash", b"");
    let info_hash = labeled_extract(&suite, b"", b"info_hash", info);

    let mut context = Vec::with_capacity(1 + 64);
    context.push(MODE_BASE);
    context.extend_from_slice(&psk_id_hash);
    context.extend_from_slice(&info_hash);

    let mut secret = labeled_extract(&suite, shared_secret, b"secret", b"");
    shared_secret.zeroize();

    let mut exporter_secret = [0u8; 32];
    labeled_expand(&suite, &secret, b"exp", &context, &mut exporter_secret)?;
    secret.zeroize();

    Ok(Exporter { exporter_secret })
}

/// Sender side of HPKE base setup. Returns the encapsulation to put on the
/// wire and the exporter context.
pub fn setup_base_sender(
    pk_r: &[u8; 32],
    info: &[u8],
) -> Result<([u8; ENC_LEN], Exporter), CryptoError> {
    let (enc, mut shared_secret) = encap(pk_r)?;
    let exporter = key_schedule_base(&mut shared_secret, info)?;
    Ok((enc, exporter))
}

/// Receiver side of HPKE base setup.
pub fn setup_base_receiver(
    enc: &[u8; ENC_LEN],
    kem: &KemKeyPair,
    info: &[u8],
) -> Result<Exporter, CryptoError> {
    let mut shared_secret = decap(enc, kem)?;
    key_schedule_base(&mut shared_secret, info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_receiver_agree_on_exports() {
        let kem = KemKeyPair::generate();
        let (enc, ctx_s) = setup_base_sender(kem.public(), b"info").unwrap();
        let ctx_r = setup_base_receiver(&enc, &kem, b"info").unwrap();

        let exp_s = ctx_s.export(b"export-ctx").unwrap();
        let exp_r = ctx_r.export(b"export-ctx").unwrap();
        assert_eq!(exp_s, exp_r);
    }

    #[test]
    fn info_separates_exporter_values() {
        let kem = KemKeyPair::generate();
        let (enc, ctx_a) = setup_base_sender(kem.public(), b"info-a").unwrap();
        let ctx_b = setup_base_receiver(&enc, &kem, b"info-b").unwrap();
        assert_ne!(
            ctx_a.export(b"x").unwrap(),
            ctx_b.export(b"x").unwrap(),
            "different info strings must land in disjoint key spaces"
        );
    }

    #[test]
    fn exporter_context_separates_outputs() {
        let kem = KemKeyPair::generate();
        let (_, ctx) = setup_base_sender(kem.public(), b"info").unwrap();
        assert_ne!(ctx.export(b"ctx-1").unwrap(), ctx.export(b"ctx-2").unwrap());
    }

    #[test]
    fn fresh_encapsulations_differ() {
        let kem = KemKeyPair::generate();
        let (enc_1, ctx_1) = setup_base_sender(kem.public(), b"info").unwrap();
        let (enc_2, ctx_2) = setup_base_sender(kem.public(), b"info").unwrap();
        assert_ne!(enc_1, enc_2);
        assert_ne!(ctx_1.export(b"x").unwrap(), ctx_2.export(b"x").unwrap());
    }

    #[test]
    fn decap_rejects_zero_encapsulation() {
        let kem = KemKeyPair::generate();
        assert!(setup_base_receiver(&[0u8; 32], &kem, b"info").is_err());
    }
}
