//! Covered components — the canonical byte string a request signature
//! authenticates.
//!
//! Follows the RFC 9421 message-signature shape: each covered component
//! on its own `"name": value` line, closed by a `"@signature-params"`
//! line that repeats the component list and binds the algorithm, key id,
//! and request nonce. The content digest is computed from the actual body
//! on both sides, so any body tampering breaks the HMAC even when the
//! attacker leaves the digest header alone.
//!
//! Headers produced/consumed:
//!   Date:            <RFC 1123>
//!   Content-Digest:  sha-256=:<b64url(SHA-256(body))>:
//!   Signature-Input: sig1=("@method" "@path" "host" "date" "content-digest");
//!                    alg="hmac-sha256";keyid="<kid>";nonce="<nonce>"
//!   Signature:       sig1=:<b64url(HMAC)>:

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

const COMPONENT_LIST: &str = r#""@method" "@path" "host" "date" "content-digest""#;
const RFC1123: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// One request's covered components.
#[derive(Debug, Clone)]
pub struct CoveredComponents {
    pub method: String,
    pub path: String,
    pub host: String,
    pub date: String,
    pub content_digest: String,
    pub kid: String,
    pub nonce: String,
}

impl CoveredComponents {
    /// Build from request parts, computing the digest from `body`.
    #[allow(clippy::too_many_arguments)]
    pub fn for_request(
        method: &str,
        path: &str,
        host: &str,
        date: DateTime<Utc>,
        body: &[u8],
        kid: &str,
        nonce: &str,
    ) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            host: host.to_string(),
            date: date.format(RFC1123).to_string(),
            content_digest: content_digest(body),
            kid: kid.to_string(),
            nonce: nonce.to_string(),
        }
    }

    /// The exact bytes the session signing key authenticates.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("\"@method\": {}\n", self.method));
        out.push_str(&format!("\"@path\": {}\n", self.path));
        out.push_str(&format!("\"host\": {}\n", self.host));
        out.push_str(&format!("\"date\": {}\n", self.date));
        out.push_str(&format!("\"content-digest\": {}\n", self.content_digest));
        out.push_str(&format!(
            "\"@signature-params\": ({COMPONENT_LIST});alg=\"hmac-sha256\";keyid=\"{}\";nonce=\"{}\"",
            self.kid, self.nonce
        ));
        out.into_bytes()
    }

    /// `Signature-Input` header value.
    pub fn signature_input(&self) -> String {
        format!(
            "sig1=({COMPONENT_LIST});alg=\"hmac-sha256\";keyid=\"{}\";nonce=\"{}\"",
            self.kid, self.nonce
        )
    }

    /// Check the request `Date` against the freshness window.
    pub fn verify_date(&self, now: DateTime<Utc>, window: std::time::Duration) -> Result<(), ProtocolError> {
        let parsed = DateTime::parse_from_rfc2822(&self.date)
            .map_err(|_| ProtocolError::Malformed("unparseable Date header".into()))?;
        let skew = (now - parsed.with_timezone(&Utc)).num_seconds().unsigned_abs();
        if skew > window.as_secs() {
            return Err(ProtocolError::FreshnessViolation);
        }
        Ok(())
    }
}

/// `Content-Digest` header value for `body`.
pub fn content_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("sha-256=:{}:", URL_SAFE_NO_PAD.encode(digest))
}

/// `Signature` header value wrapping an HMAC tag.
pub fn signature_header(tag: &[u8]) -> String {
    format!("sig1=:{}:", URL_SAFE_NO_PAD.encode(tag))
}

/// Extract the tag bytes from a `Signature` header value.
pub fn parse_signature_header(value: &str) -> Result<Vec<u8>, ProtocolError> {
    let inner = value
        .strip_prefix("sig1=:")
        .and_then(|rest| rest.strip_suffix(':'))
        .ok_or_else(|| ProtocolError::Malformed("bad Signature header".into()))?;
    URL_SAFE_NO_PAD
        .decode(inner)
        .map_err(|_| ProtocolError::Malformed("bad Signature header encoding".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> CoveredComponents {
        let date = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        CoveredComponents::for_request(
            "post",
            "/protected",
            "agent.example",
            date,
            b"{\"op\":1}",
            "kid-1",
            "nonce-1",
        )
    }

    #[test]
    fn canonical_bytes_shape() {
        let covered = sample();
        let text = String::from_utf8(covered.canonical_bytes()).unwrap();
        assert!(text.starts_with("\"@method\": POST\n\"@path\": /protected\n"));
        assert!(text.contains("\"date\": Sun, 01 Mar 2026 12:00:00 GMT\n"));
        assert!(text.contains("\"content-digest\": sha-256=:"));
        assert!(text.ends_with("keyid=\"kid-1\";nonce=\"nonce-1\""));
    }

    #[test]
    fn body_change_changes_canonical_bytes() {
        let date = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = CoveredComponents::for_request("POST", "/p", "h", date, b"body-a", "k", "n");
        let b = CoveredComponents::for_request("POST", "/p", "h", date, b"body-b", "k", "n");
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn signature_header_roundtrip() {
        let tag = [0x5Au8; 32];
        let header = signature_header(&tag);
        assert_eq!(parse_signature_header(&header).unwrap(), tag);
        assert!(parse_signature_header("sig2=:AA:").is_err());
    }

    #[test]
    fn date_outside_window_is_stale() {
        let covered = sample();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 4, 0).unwrap();
        covered
            .verify_date(now, std::time::Duration::from_secs(300))
            .unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 12, 6, 0).unwrap();
        assert_eq!(
            covered
                .verify_date(late, std::time::Duration::from_secs(300))
                .unwrap_err(),
            ProtocolError::FreshnessViolation
        );
    }
}
