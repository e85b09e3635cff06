//! Session manager — owns every live session.
//!
//! The manager is the only code that creates, removes, or closes
//! sessions. It keeps a forward map `kid → sessionID` and a reverse map
//! `sessionID → {kid…}`, shares sessions out as `Arc<Session>`, and runs
//! one background GC task that sweeps expired sessions. Sessions never
//! reference the manager back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use tracing::{debug, info};
use zeroize::Zeroize;

use sage_crypto::{ecdh::SharedSecret32, kdf, transcript};

use crate::clock::{Clock, SystemClock};
use crate::error::ProtocolError;
use crate::nonce_cache::NonceCache;
use crate::session::config::SessionConfig;
use crate::session::covered::{self, CoveredComponents};
use crate::session::session::Session;

/// Secret input to session creation.
pub enum SessionSecret {
    /// A raw ECDH output (legacy handshake); the manager derives the seed.
    SharedSecret(SharedSecret32),
    /// An already-combined 32-byte seed (HPKE handshake).
    Seed([u8; 32]),
}

/// Inputs to `ensure_session`. Both peers must pass byte-identical values
/// (up to the ephemeral swap) to land in the same session.
pub struct SessionParams<'a> {
    pub ctx_id: &'a str,
    pub label: &'a str,
    pub self_eph: &'a [u8; 32],
    pub peer_eph: &'a [u8; 32],
    pub secret: SessionSecret,
}

pub struct SessionManager {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    kid_to_sid: RwLock<HashMap<String, String>>,
    sid_to_kids: RwLock<HashMap<String, HashSet<String>>>,
    replay: Arc<NonceCache>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, ProtocolError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self, ProtocolError> {
        config.validate()?;
        let replay = Arc::new(NonceCache::new(config.replay_ttl, clock.clone()));
        Ok(Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
            kid_to_sid: RwLock::new(HashMap::new()),
            sid_to_kids: RwLock::new(HashMap::new()),
            replay,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Derive the seed (if needed) and insert the session under
    /// double-checked locking: the first creator wins and every concurrent
    /// caller gets the same handle.
    pub fn ensure_session(&self, params: SessionParams<'_>) -> Result<Arc<Session>, ProtocolError> {
        let mut seed = match params.secret {
            SessionSecret::Seed(seed) => seed,
            SessionSecret::SharedSecret(shared) => {
                let salt = transcript::legacy_salt(
                    params.label,
                    params.ctx_id,
                    params.self_eph,
                    params.peer_eph,
                );
                kdf::hkdf_extract(Some(&salt), shared.as_bytes())
            }
        };
        let sid = Session::id_for(params.label, &seed);

        if let Some(existing) = self.sessions.read().expect("session map poisoned").get(&sid) {
            seed.zeroize();
            return Ok(existing.clone());
        }

        let mut sessions = self.sessions.write().expect("session map poisoned");
        if let Some(existing) = sessions.get(&sid) {
            seed.zeroize();
            return Ok(existing.clone());
        }
        let session = Arc::new(Session::derive(
            params.label,
            &seed,
            self.config.clone(),
            self.clock.clone(),
        )?);
        seed.zeroize();
        sessions.insert(sid.clone(), session.clone());
        info!(sid = %sid, ctx = %params.ctx_id, "session created");
        Ok(session)
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.read().expect("session map poisoned").get(sid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Key-id binding ───────────────────────────────────────────────────

    /// Mint a fresh random kid and bind it to `sid`.
    pub fn issue_kid(&self, sid: &str) -> Result<String, ProtocolError> {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let kid = URL_SAFE_NO_PAD.encode(raw);
        self.bind_kid(&kid, sid)?;
        Ok(kid)
    }

    /// Bind `kid` to an existing session. Many kids may map to one
    /// session; each kid maps to exactly one.
    pub fn bind_kid(&self, kid: &str, sid: &str) -> Result<(), ProtocolError> {
        if !self.sessions.read().expect("session map poisoned").contains_key(sid) {
            return Err(ProtocolError::SessionNotFound);
        }
        let mut forward = self.kid_to_sid.write().expect("kid map poisoned");
        let mut reverse = self.sid_to_kids.write().expect("kid map poisoned");
        if let Some(previous) = forward.insert(kid.to_string(), sid.to_string()) {
            if let Some(kids) = reverse.get_mut(&previous) {
                kids.remove(kid);
            }
        }
        reverse.entry(sid.to_string()).or_default().insert(kid.to_string());
        debug!(kid = %kid, sid = %sid, "kid bound");
        Ok(())
    }

    /// Unbind `kid` and drop its replay partition.
    pub fn unbind_kid(&self, kid: &str) {
        let mut forward = self.kid_to_sid.write().expect("kid map poisoned");
        if let Some(sid) = forward.remove(kid) {
            let mut reverse = self.sid_to_kids.write().expect("kid map poisoned");
            if let Some(kids) = reverse.get_mut(&sid) {
                kids.remove(kid);
                if kids.is_empty() {
                    reverse.remove(&sid);
                }
            }
        }
        self.replay.delete_key(kid);
    }

    /// Resolve a kid to its live session.
    pub fn get_by_kid(&self, kid: &str) -> Result<Arc<Session>, ProtocolError> {
        let sid = self
            .kid_to_sid
            .read()
            .expect("kid map poisoned")
            .get(kid)
            .cloned()
            .ok_or(ProtocolError::SessionNotFound)?;
        let session = self.get(&sid).ok_or(ProtocolError::SessionNotFound)?;
        if session.is_expired() {
            return Err(ProtocolError::SessionExpired);
        }
        Ok(session)
    }

    // ── Replay guard & request authorization ─────────────────────────────

    /// True when `(kid, nonce)` was already seen inside the replay TTL.
    pub fn replay_seen_once(&self, kid: &str, nonce: &str) -> bool {
        self.replay.seen_once(kid, nonce)
    }

    /// Authorize one inbound request: freshness, session lookup, replay
    /// guard, covered-bytes HMAC — in that order. Returns the session so
    /// the caller can decrypt the body.
    pub fn authorize_request(
        &self,
        covered: &CoveredComponents,
        signature_header: &str,
    ) -> Result<Arc<Session>, ProtocolError> {
        let tag = covered::parse_signature_header(signature_header)?;
        let now = chrono::DateTime::<chrono::Utc>::from(self.clock.now());
        covered.verify_date(now, self.config.date_freshness)?;

        let session = self.get_by_kid(&covered.kid)?;
        if self.replay_seen_once(&covered.kid, &covered.nonce) {
            return Err(ProtocolError::ReplayDetected);
        }
        session.verify_covered(&covered.canonical_bytes(), &tag)?;
        Ok(session)
    }

    // ── Removal & GC ─────────────────────────────────────────────────────

    /// Close and remove a session, unbinding every kid mapped to it.
    pub fn remove_session(&self, sid: &str) {
        let session = {
            let mut sessions = self.sessions.write().expect("session map poisoned");
            sessions.remove(sid)
        };
        let Some(session) = session else { return };
        session.close();

        let kids: Vec<String> = {
            let mut reverse = self.sid_to_kids.write().expect("kid map poisoned");
            reverse.remove(sid).map(|set| set.into_iter().collect()).unwrap_or_default()
        };
        let mut forward = self.kid_to_sid.write().expect("kid map poisoned");
        for kid in &kids {
            forward.remove(kid);
            self.replay.delete_key(kid);
        }
        info!(sid = %sid, kids = kids.len(), "session removed");
    }

    /// One GC sweep: remove every expired session.
    pub fn gc(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().expect("session map poisoned");
            sessions
                .iter()
                .filter(|(_, session)| session.is_expired())
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for sid in &expired {
            self.remove_session(sid);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "session GC sweep");
        }
        self.replay.gc();
    }

    /// Spawn the background GC loop. Abort the handle to stop it.
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let every = manager.config.gc_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.gc();
            }
        })
    }
}
