//! One session's crypto state.
//!
//! A session owns a 32-byte seed and two HKDF-separated keys derived from
//! it: `encryption` for the ChaCha20-Poly1305 frames, `signing` for the
//! covered-component HMAC. All mutable state (keys, counters, lifecycle)
//! sits behind one mutex so the expiry check, the nonce draw, and the
//! counter update are a single atomic step.
//!
//! Lifecycle: FRESH → ACTIVE on first use → EXPIRED when any lifetime
//! bound trips → CLOSED. Closing zeroizes the seed and both derived keys;
//! every crypto call afterwards fails with `SessionExpired`.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use sage_crypto::{aead, kdf, transcript};

use crate::clock::Clock;
use crate::error::ProtocolError;
use crate::session::config::SessionConfig;

const INFO_ENCRYPTION: &[u8] = b"encryption";
const INFO_SIGNING: &[u8] = b"signing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Fresh,
    Active,
    Closed,
}

struct SessionState {
    seed: [u8; 32],
    encrypt_key: [u8; 32],
    signing_key: [u8; 32],
    last_used_at: SystemTime,
    message_count: u64,
    lifecycle: Lifecycle,
}

impl SessionState {
    fn zeroize_keys(&mut self) {
        self.seed.zeroize();
        self.encrypt_key.zeroize();
        self.signing_key.zeroize();
    }
}

pub struct Session {
    id: String,
    created_at: SystemTime,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    /// Deterministic session id: base64url of the first 16 bytes of
    /// `SHA-256(label ‖ seed)`. Identical on both peers.
    pub fn id_for(label: &str, seed: &[u8; 32]) -> String {
        let mut h = Sha256::new();
        h.update(label.as_bytes());
        h.update(seed);
        let digest = h.finalize();
        URL_SAFE_NO_PAD.encode(&digest[..16])
    }

    /// Derive a session from a seed. The id doubles as HKDF salt so key
    /// material is bound to the session identity.
    pub(crate) fn derive(
        label: &str,
        seed: &[u8; 32],
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProtocolError> {
        let id = Self::id_for(label, seed);

        let mut encrypt_key = [0u8; 32];
        let mut signing_key = [0u8; 32];
        kdf::hkdf_expand(seed, Some(id.as_bytes()), INFO_ENCRYPTION, &mut encrypt_key)
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        kdf::hkdf_expand(seed, Some(id.as_bytes()), INFO_SIGNING, &mut signing_key)
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;

        let now = clock.now();
        Ok(Self {
            id,
            created_at: now,
            config,
            clock,
            state: Mutex::new(SessionState {
                seed: *seed,
                encrypt_key,
                signing_key,
                last_used_at: now,
                message_count: 0,
                lifecycle: Lifecycle::Fresh,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn message_count(&self) -> u64 {
        self.lock().message_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    fn expired_locked(&self, state: &SessionState) -> bool {
        if state.lifecycle == Lifecycle::Closed {
            return true;
        }
        let now = self.clock.now();
        if now
            .duration_since(self.created_at)
            .map_or(false, |age| age >= self.config.max_age)
        {
            return true;
        }
        if now
            .duration_since(state.last_used_at)
            .map_or(false, |idle| idle >= self.config.idle_timeout)
        {
            return true;
        }
        state.message_count >= self.config.max_messages
    }

    pub fn is_expired(&self) -> bool {
        let state = self.lock();
        self.expired_locked(&state)
    }

    /// Gate a crypto operation: expired sessions fail, fresh ones activate.
    fn check_usable(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
        if self.expired_locked(state) {
            return Err(ProtocolError::SessionExpired);
        }
        if state.lifecycle == Lifecycle::Fresh {
            state.lifecycle = Lifecycle::Active;
        }
        Ok(())
    }

    // ── AEAD ─────────────────────────────────────────────────────────────

    /// Encrypt a message. Output frame: `nonce(12) ‖ ciphertext‖tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        self.check_usable(&mut state)?;
        let frame = aead::seal(&state.encrypt_key, plaintext, b"")
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        state.last_used_at = self.clock.now();
        state.message_count += 1;
        Ok(frame)
    }

    /// Decrypt a frame. Tag failure and truncation are indistinguishable.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        let mut state = self.lock();
        self.check_usable(&mut state)?;
        let plaintext = aead::open(&state.encrypt_key, frame, b"")
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        state.last_used_at = self.clock.now();
        state.message_count += 1;
        Ok(plaintext)
    }

    // ── Covered-component MAC ────────────────────────────────────────────

    /// HMAC-SHA256 over the canonical covered bytes.
    pub fn sign_covered(&self, covered: &[u8]) -> Result<[u8; 32], ProtocolError> {
        let mut state = self.lock();
        self.check_usable(&mut state)?;
        let tag = kdf::hmac_sha256(&state.signing_key, covered);
        state.last_used_at = self.clock.now();
        Ok(tag)
    }

    /// Constant-time verification of a covered-bytes tag.
    pub fn verify_covered(&self, covered: &[u8], tag: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.lock();
        self.check_usable(&mut state)?;
        let expected = kdf::hmac_sha256(&state.signing_key, covered);
        if !kdf::ct_eq(&expected, tag) {
            return Err(ProtocolError::SignatureInvalid);
        }
        state.last_used_at = self.clock.now();
        Ok(())
    }

    // ── Channel binding ──────────────────────────────────────────────────

    /// Application-facing channel-binding value derived from the seed.
    pub fn channel_binding(&self) -> Result<[u8; 32], ProtocolError> {
        let mut state = self.lock();
        self.check_usable(&mut state)?;
        let mut cb = [0u8; 32];
        kdf::hkdf_expand(&state.seed, None, transcript::CHANNEL_BINDING_INFO, &mut cb)
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        Ok(cb)
    }

    /// `X-Channel-Binding` header value.
    pub fn channel_binding_header(&self) -> Result<String, ProtocolError> {
        Ok(format!(
            "sage-cb:v1.{}",
            URL_SAFE_NO_PAD.encode(self.channel_binding()?)
        ))
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Idempotent close: zeroize the seed and both derived keys.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Closed {
            state.zeroize_keys();
            state.lifecycle = Lifecycle::Closed;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Closed
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.zeroize_keys();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn test_session(config: SessionConfig) -> (Session, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(50_000));
        let session = Session::derive("test-label v1", &[0x42u8; 32], config, clock.clone()).unwrap();
        (session, clock)
    }

    #[test]
    fn both_label_and_seed_bind_the_id() {
        let id = Session::id_for("label", &[1u8; 32]);
        assert_ne!(id, Session::id_for("label2", &[1u8; 32]));
        assert_ne!(id, Session::id_for("label", &[2u8; 32]));
        assert_eq!(id, Session::id_for("label", &[1u8; 32]));
    }

    #[test]
    fn keys_are_separated_by_info_label() {
        let (session, _) = test_session(SessionConfig::default());
        let state = session.lock();
        assert_ne!(state.encrypt_key, state.signing_key);

        // Swapping the info labels produces different material.
        let mut swapped = [0u8; 32];
        kdf::hkdf_expand(&state.seed, Some(session.id.as_bytes()), INFO_SIGNING, &mut swapped)
            .unwrap();
        assert_eq!(swapped, state.signing_key);
        kdf::hkdf_expand(&state.seed, Some(session.id.as_bytes()), INFO_ENCRYPTION, &mut swapped)
            .unwrap();
        assert_eq!(swapped, state.encrypt_key);
    }

    #[test]
    fn encrypt_decrypt_roundtrip_and_tamper_detection() {
        let (session, _) = test_session(SessionConfig::default());
        let frame = session.encrypt(b"agent message").unwrap();
        assert_eq!(&*session.decrypt(&frame).unwrap(), b"agent message");

        for i in 0..frame.len() {
            let mut tampered = frame.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                session.decrypt(&tampered).unwrap_err(),
                ProtocolError::DecryptionFailure,
                "flip at {i}"
            );
        }
    }

    #[test]
    fn repeated_encryption_uses_fresh_nonces() {
        let (session, _) = test_session(SessionConfig::default());
        let a = session.encrypt(b"same plaintext").unwrap();
        let b = session.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..12], b[..12]);
    }

    #[test]
    fn covered_mac_roundtrip() {
        let (session, _) = test_session(SessionConfig::default());
        let tag = session.sign_covered(b"covered bytes").unwrap();
        session.verify_covered(b"covered bytes", &tag).unwrap();
        assert_eq!(
            session.verify_covered(b"covered byte5", &tag).unwrap_err(),
            ProtocolError::SignatureInvalid
        );
    }

    #[test]
    fn expires_at_max_age() {
        let config = SessionConfig {
            max_age: Duration::from_secs(3600),
            ..SessionConfig::default()
        };
        let (session, clock) = test_session(config);
        clock.advance(Duration::from_secs(3599));
        session.encrypt(b"still fine").unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            session.encrypt(b"too old").unwrap_err(),
            ProtocolError::SessionExpired
        );
    }

    #[test]
    fn expires_after_idle_timeout() {
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        };
        let (session, clock) = test_session(config);
        session.encrypt(b"traffic").unwrap();
        clock.advance(Duration::from_millis(2_500));
        assert_eq!(
            session.encrypt(b"idle").unwrap_err(),
            ProtocolError::SessionExpired
        );
    }

    #[test]
    fn activity_extends_the_idle_window() {
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        };
        let (session, clock) = test_session(config);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(8));
            session.encrypt(b"keepalive").unwrap();
        }
    }

    #[test]
    fn expires_on_message_count() {
        let config = SessionConfig {
            max_messages: 3,
            ..SessionConfig::default()
        };
        let (session, _) = test_session(config);
        for _ in 0..3 {
            session.encrypt(b"m").unwrap();
        }
        assert_eq!(
            session.encrypt(b"over").unwrap_err(),
            ProtocolError::SessionExpired
        );
    }

    #[test]
    fn covered_mac_does_not_consume_message_budget() {
        let config = SessionConfig {
            max_messages: 2,
            ..SessionConfig::default()
        };
        let (session, _) = test_session(config);
        for _ in 0..10 {
            session.sign_covered(b"c").unwrap();
        }
        session.encrypt(b"1").unwrap();
        session.encrypt(b"2").unwrap();
        assert!(session.encrypt(b"3").is_err());
    }

    #[test]
    fn close_zeroizes_and_blocks_further_use() {
        let (session, _) = test_session(SessionConfig::default());
        session.encrypt(b"warm-up").unwrap();
        session.close();
        session.close(); // idempotent

        {
            let state = session.lock();
            assert_eq!(state.seed, [0u8; 32]);
            assert_eq!(state.encrypt_key, [0u8; 32]);
            assert_eq!(state.signing_key, [0u8; 32]);
        }
        assert_eq!(
            session.encrypt(b"dead").unwrap_err(),
            ProtocolError::SessionExpired
        );
        assert_eq!(
            session.sign_covered(b"dead").unwrap_err(),
            ProtocolError::SessionExpired
        );
        assert!(session.is_expired());
    }

    #[test]
    fn channel_binding_is_stable_and_header_shaped() {
        let (session, _) = test_session(SessionConfig::default());
        let cb1 = session.channel_binding().unwrap();
        let cb2 = session.channel_binding().unwrap();
        assert_eq!(cb1, cb2);
        let header = session.channel_binding_header().unwrap();
        assert!(header.starts_with("sage-cb:v1."));
    }
}
