//! Optional anti-DoS pre-handshake gate.
//!
//! Before spending HPKE work on an Init, a responder MAY require either
//! an HMAC cookie it previously handed out or a client proof-of-work:
//!
//!   cookie:  `hmac:<b64(HMAC-SHA256(secret, "SAGE-Cookie|v1|ctx|init|resp"))>`
//!   pow:     `pow:<nonce>:<hex(SHA-256("SAGE-PoW|ctx|init|resp|nonce"))>`
//!            with N leading zero nibbles
//!
//! Invalid tokens fail fast, before any signature or KEM work.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

use sage_crypto::kdf;

use crate::error::ProtocolError;

/// Responder-side policy.
#[derive(Clone)]
pub enum DosPolicy {
    None,
    Cookie { secret: Vec<u8> },
    Pow { difficulty: u8 },
}

impl DosPolicy {
    /// Gate an Init. `token` is the `dos_token` field of the payload.
    pub fn verify(
        &self,
        token: Option<&str>,
        ctx_id: &str,
        init_did: &str,
        resp_did: &str,
    ) -> Result<(), ProtocolError> {
        match self {
            Self::None => Ok(()),
            Self::Cookie { secret } => {
                let token = token.ok_or(ProtocolError::MissingCredential("dos token"))?;
                let presented = token
                    .strip_prefix("hmac:")
                    .ok_or(ProtocolError::SignatureInvalid)?;
                let presented = URL_SAFE_NO_PAD
                    .decode(presented)
                    .map_err(|_| ProtocolError::SignatureInvalid)?;
                let expected = kdf::hmac_sha256(secret, cookie_message(ctx_id, init_did, resp_did).as_bytes());
                if !kdf::ct_eq(&expected, &presented) {
                    return Err(ProtocolError::SignatureInvalid);
                }
                Ok(())
            }
            Self::Pow { difficulty } => {
                let token = token.ok_or(ProtocolError::MissingCredential("dos token"))?;
                let mut parts = token.splitn(3, ':');
                let (tag, nonce, digest_hex) = (parts.next(), parts.next(), parts.next());
                let (Some("pow"), Some(nonce), Some(digest_hex)) = (tag, nonce, digest_hex) else {
                    return Err(ProtocolError::SignatureInvalid);
                };
                let expected = hex::encode(pow_digest(ctx_id, init_did, resp_did, nonce));
                if expected != digest_hex {
                    return Err(ProtocolError::SignatureInvalid);
                }
                if leading_zero_nibbles(&expected) < *difficulty as usize {
                    return Err(ProtocolError::SignatureInvalid);
                }
                Ok(())
            }
        }
    }
}

fn cookie_message(ctx_id: &str, init_did: &str, resp_did: &str) -> String {
    format!("SAGE-Cookie|v1|{ctx_id}|{init_did}|{resp_did}")
}

fn pow_digest(ctx_id: &str, init_did: &str, resp_did: &str, nonce: &str) -> [u8; 32] {
    Sha256::digest(format!("SAGE-PoW|{ctx_id}|{init_did}|{resp_did}|{nonce}")).into()
}

fn leading_zero_nibbles(digest_hex: &str) -> usize {
    digest_hex.chars().take_while(|&c| c == '0').count()
}

/// Mint a cookie for a client (handed out over a prior channel).
pub fn cookie_token(secret: &[u8], ctx_id: &str, init_did: &str, resp_did: &str) -> String {
    let tag = kdf::hmac_sha256(secret, cookie_message(ctx_id, init_did, resp_did).as_bytes());
    format!("hmac:{}", URL_SAFE_NO_PAD.encode(tag))
}

/// Client-side proof-of-work search. Iterates a counter nonce until the
/// digest has `difficulty` leading zero nibbles.
pub fn solve_pow(ctx_id: &str, init_did: &str, resp_did: &str, difficulty: u8) -> String {
    let mut counter: u64 = 0;
    loop {
        let nonce = counter.to_string();
        let digest = hex::encode(pow_digest(ctx_id, init_did, resp_did, &nonce));
        if leading_zero_nibbles(&digest) >= difficulty as usize {
            return format!("pow:{nonce}:{digest}");
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_policy_accepts_anything() {
        DosPolicy::None.verify(None, "c", "i", "r").unwrap();
        DosPolicy::None.verify(Some("garbage"), "c", "i", "r").unwrap();
    }

    #[test]
    fn cookie_roundtrip() {
        let policy = DosPolicy::Cookie { secret: b"server-secret".to_vec() };
        let token = cookie_token(b"server-secret", "ctx", "did:sage:a", "did:sage:b");
        policy
            .verify(Some(&token), "ctx", "did:sage:a", "did:sage:b")
            .unwrap();
    }

    #[test]
    fn cookie_is_context_bound() {
        let policy = DosPolicy::Cookie { secret: b"server-secret".to_vec() };
        let token = cookie_token(b"server-secret", "ctx", "did:sage:a", "did:sage:b");
        assert_eq!(
            policy
                .verify(Some(&token), "other-ctx", "did:sage:a", "did:sage:b")
                .unwrap_err(),
            ProtocolError::SignatureInvalid
        );
    }

    #[test]
    fn missing_token_is_rejected_fast() {
        let policy = DosPolicy::Cookie { secret: b"s".to_vec() };
        assert_eq!(
            policy.verify(None, "c", "i", "r").unwrap_err(),
            ProtocolError::MissingCredential("dos token")
        );
    }

    #[test]
    fn pow_roundtrip() {
        let policy = DosPolicy::Pow { difficulty: 2 };
        let token = solve_pow("ctx", "did:sage:a", "did:sage:b", 2);
        policy
            .verify(Some(&token), "ctx", "did:sage:a", "did:sage:b")
            .unwrap();
    }

    #[test]
    fn pow_rejects_forged_digest() {
        let policy = DosPolicy::Pow { difficulty: 2 };
        // Correct shape, zero-leading digest, but not the digest of this input.
        let forged = format!("pow:1:{}", "00".repeat(32));
        assert_eq!(
            policy
                .verify(Some(&forged), "ctx", "did:sage:a", "did:sage:b")
                .unwrap_err(),
            ProtocolError::SignatureInvalid
        );
    }

    #[test]
    fn pow_rejects_insufficient_difficulty() {
        let policy = DosPolicy::Pow { difficulty: 60 };
        let token = solve_pow("ctx", "did:sage:a", "did:sage:b", 1);
        assert!(policy
            .verify(Some(&token), "ctx", "did:sage:a", "did:sage:b")
            .is_err());
    }
}
