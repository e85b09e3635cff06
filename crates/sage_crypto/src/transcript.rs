//! Canonical protocol strings and transcript hashes
//!
//! Every derived key in the protocol is bound to a transcript that embeds
//! the protocol version and the cipher-suite label; bumping either moves
//! all derivations into a disjoint key space. Concatenations use either a
//! 0x00 separator before each field (transcript hash) or a 4-byte
//! big-endian length prefix (ack message) so no two field sequences can
//! collide.

use sha2::{Digest, Sha256};

/// Protocol version embedded in every transcript.
pub const PROTOCOL_VERSION: &str = "v1";

/// Suite label for the HPKE handshake.
pub const SUITE_HPKE_BASE: &str = "hpke-base+x25519+hkdf-sha256";

/// Combiner label for the ephemeral-ephemeral PFS add-on.
pub const COMBINER_E2E: &str = "e2e-x25519-hkdf-v1";

/// Session label for the legacy four-phase handshake.
pub const LEGACY_LABEL: &str = "a2a/handshake v1";

/// Session label for HPKE-derived sessions.
pub const HPKE_SESSION_LABEL: &str = "sage/hpke-session v1";

/// HKDF info for the ack confirmation key.
pub const ACK_KEY_INFO: &[u8] = b"SAGE-ack-key-v1";

/// HKDF info for the PFS seed combiner.
pub const COMBINER_INFO: &[u8] = b"SAGE-HPKE+E2E-Combiner";

/// HKDF info for the application-facing channel binding value.
pub const CHANNEL_BINDING_INFO: &[u8] = b"channel-binding";

const ACK_MSG_PREFIX: &[u8] = b"SAGE-ack-msg|v1|";

// ── Protocol strings ─────────────────────────────────────────────────────────

/// HPKE `info` string, bound to suite, combiner, context and both DIDs.
pub fn hpke_info(ctx_id: &str, init_did: &str, resp_did: &str) -> String {
    format!(
        "sage/hpke-info|{PROTOCOL_VERSION}|suite={SUITE_HPKE_BASE}|combiner={COMBINER_E2E}|ctx={ctx_id}|init={init_did}|resp={resp_did}"
    )
}

/// HPKE exporter context string.
pub fn hpke_export_ctx(ctx_id: &str) -> String {
    format!(
        "sage/hpke-export|{PROTOCOL_VERSION}|suite={SUITE_HPKE_BASE}|combiner={COMBINER_E2E}|ctx={ctx_id}"
    )
}

// ── Legacy seed salt ─────────────────────────────────────────────────────────

/// `SHA-256(label ‖ ctxID ‖ min(ephA, ephB) ‖ max(ephA, ephB))`.
///
/// Lexicographic ordering of the ephemeral publics makes the salt identical
/// on both peers regardless of role.
pub fn legacy_salt(label: &str, ctx_id: &str, eph_a: &[u8; 32], eph_b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if eph_a <= eph_b { (eph_a, eph_b) } else { (eph_b, eph_a) };
    let mut h = Sha256::new();
    h.update(label.as_bytes());
    h.update(ctx_id.as_bytes());
    h.update(lo);
    h.update(hi);
    h.finalize().into()
}

// ── Ack transcript & message ─────────────────────────────────────────────────

/// `SHA-256(0x00‖info‖0x00‖exportCtx‖0x00‖enc‖0x00‖ephC‖0x00‖ephS‖0x00‖initDID‖0x00‖respDID)`.
///
/// In base-only mode `eph_c` and `eph_s` are empty; the separators still
/// keep the field positions unambiguous.
#[allow(clippy::too_many_arguments)]
pub fn ack_transcript(
    info: &[u8],
    export_ctx: &[u8],
    enc: &[u8],
    eph_c: &[u8],
    eph_s: &[u8],
    init_did: &str,
    resp_did: &str,
) -> [u8; 32] {
    let mut h = Sha256::new();
    for field in [
        info,
        export_ctx,
        enc,
        eph_c,
        eph_s,
        init_did.as_bytes(),
        resp_did.as_bytes(),
    ] {
        h.update([0u8]);
        h.update(field);
    }
    h.finalize().into()
}

/// `"SAGE-ack-msg|v1|" ‖ LP(ctxID) ‖ LP(nonce) ‖ LP(kid) ‖ transcript`
/// where LP is a 4-byte big-endian length prefix. `nonce` and `kid` are the
/// wire-encoded strings from the Ack payload.
pub fn ack_message(ctx_id: &str, nonce: &str, kid: &str, transcript: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        ACK_MSG_PREFIX.len() + 12 + ctx_id.len() + nonce.len() + kid.len() + transcript.len(),
    );
    out.extend_from_slice(ACK_MSG_PREFIX);
    for field in [ctx_id.as_bytes(), nonce.as_bytes(), kid.as_bytes()] {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out.extend_from_slice(transcript);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_embeds_version_suite_and_identities() {
        let info = hpke_info("abc123", "did:sage:A", "did:sage:B");
        assert_eq!(
            info,
            "sage/hpke-info|v1|suite=hpke-base+x25519+hkdf-sha256|combiner=e2e-x25519-hkdf-v1|ctx=abc123|init=did:sage:A|resp=did:sage:B"
        );
    }

    #[test]
    fn export_ctx_shape() {
        assert_eq!(
            hpke_export_ctx("abc123"),
            "sage/hpke-export|v1|suite=hpke-base+x25519+hkdf-sha256|combiner=e2e-x25519-hkdf-v1|ctx=abc123"
        );
    }

    #[test]
    fn legacy_salt_is_role_independent() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(
            legacy_salt("a2a/handshake v1", "ctx", &a, &b),
            legacy_salt("a2a/handshake v1", "ctx", &b, &a)
        );
    }

    #[test]
    fn legacy_salt_binds_label_and_context() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let base = legacy_salt("a2a/handshake v1", "ctx", &a, &b);
        assert_ne!(base, legacy_salt("a2a/handshake v2", "ctx", &a, &b));
        assert_ne!(base, legacy_salt("a2a/handshake v1", "ctx2", &a, &b));
    }

    #[test]
    fn ack_transcript_flips_on_every_input() {
        let base = ack_transcript(b"i", b"e", b"enc", b"c", b"s", "A", "B");
        assert_ne!(base, ack_transcript(b"j", b"e", b"enc", b"c", b"s", "A", "B"));
        assert_ne!(base, ack_transcript(b"i", b"f", b"enc", b"c", b"s", "A", "B"));
        assert_ne!(base, ack_transcript(b"i", b"e", b"foo", b"c", b"s", "A", "B"));
        assert_ne!(base, ack_transcript(b"i", b"e", b"enc", b"d", b"s", "A", "B"));
        assert_ne!(base, ack_transcript(b"i", b"e", b"enc", b"c", b"t", "A", "B"));
        assert_ne!(base, ack_transcript(b"i", b"e", b"enc", b"c", b"s", "X", "B"));
        assert_ne!(base, ack_transcript(b"i", b"e", b"enc", b"c", b"s", "A", "Y"));
    }

    #[test]
    fn ack_transcript_separators_prevent_field_sliding() {
        // Moving a byte across a field boundary must change the hash.
        assert_ne!(
            ack_transcript(b"ab", b"c", b"", b"", b"", "A", "B"),
            ack_transcript(b"a", b"bc", b"", b"", b"", "A", "B")
        );
    }

    #[test]
    fn ack_message_length_prefixes() {
        let t = [0xAAu8; 32];
        let msg = ack_message("ctx", "nonce1", "kid9", &t);
        assert!(msg.starts_with(b"SAGE-ack-msg|v1|"));
        let rest = &msg[b"SAGE-ack-msg|v1|".len()..];
        assert_eq!(&rest[..4], 3u32.to_be_bytes().as_slice());
        assert_eq!(&rest[4..7], b"ctx");
        assert!(msg.ends_with(&t));
        // Shifting bytes between nonce and kid changes the message.
        assert_ne!(msg, ack_message("ctx", "nonce", "1kid9", &t));
    }
}
