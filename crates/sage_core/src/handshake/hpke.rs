//! HPKE handshake — one round trip, optional forward-secrecy add-on.
//!
//! Init (A→B) carries the HPKE encapsulation to B's static KEM key plus,
//! in PFS mode, a fresh ephemeral `ephC`. Ack (B→A) returns the minted
//! key id and a transcript-bound key-confirmation tag; in PFS mode it
//! adds B's ephemeral `ephS`.
//!
//! Seed:
//!   base:  seed = exporter(exportCtx, 32)
//!   pfs:   seed = HKDF-Expand(HKDF-Extract(salt=exportCtx,
//!                 IKM=exporter ‖ ECDH(ephS, ephC)), combiner-info, 32)
//!
//! Base-only mode leaves past sessions recoverable if the static KEM key
//! leaks; mixing in the one-shot DH removes that, provided both ephemeral
//! scalars are destroyed after the seed is derived — they are, before the
//! session manager ever sees the seed.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroize;

use sage_crypto::{
    ecdh::{self, EphemeralKeyPair, KemKeyPair, SharedSecret32},
    hpke,
    identity::IdentityKeyPair,
    kdf, transcript,
};
use sage_proto::handshake::{HpkeAckPayload, HpkeInitPayload};
use sage_proto::message::{AgentRole, WireMessage, META_ACK_TAG, META_DID, META_EPH_S, META_KID, META_SIGNATURE, TASK_HPKE_ACK, TASK_HPKE_INIT};

use crate::clock::Clock;
use crate::error::ProtocolError;
use crate::handshake::dos::DosPolicy;
use crate::nonce_cache::NonceCache;
use crate::resolver::{CachingResolver, DidResolver};
use crate::session::manager::{SessionManager, SessionParams, SessionSecret};
use crate::session::session::Session;
use crate::transport::Transport;

/// Replay partition for handshake Init nonces.
const INIT_NONCE_PARTITION: &str = "hpke-init";

const ZERO_EPH: [u8; 32] = [0u8; 32];

fn fresh_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Mix the HPKE exporter output with the ephemeral-ephemeral DH.
fn combine_seed(
    export_ctx: &str,
    exporter: &[u8; 32],
    ss_e2e: &SharedSecret32,
) -> Result<[u8; 32], ProtocolError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(exporter);
    ikm[32..].copy_from_slice(ss_e2e.as_bytes());
    let mut prk = kdf::hkdf_extract(Some(export_ctx.as_bytes()), &ikm);
    ikm.zeroize();

    let mut seed = [0u8; 32];
    let expanded = kdf::hkdf_expand_prk(&prk, transcript::COMBINER_INFO, &mut seed);
    prk.zeroize();
    expanded.map_err(|_| ProtocolError::KeyAgreementFailure)?;
    Ok(seed)
}

/// Key-confirmation tag over the full handshake transcript.
#[allow(clippy::too_many_arguments)]
fn ack_tag(
    seed: &[u8; 32],
    info: &str,
    export_ctx: &str,
    enc: &[u8; 32],
    eph_c: &[u8],
    eph_s: &[u8],
    init_did: &str,
    resp_did: &str,
    ctx_id: &str,
    nonce: &str,
    kid: &str,
) -> Result<[u8; 32], ProtocolError> {
    let mut ack_key = [0u8; 32];
    kdf::hkdf_expand(seed, None, transcript::ACK_KEY_INFO, &mut ack_key)
        .map_err(|_| ProtocolError::KeyAgreementFailure)?;
    let transcript_hash = transcript::ack_transcript(
        info.as_bytes(),
        export_ctx.as_bytes(),
        enc,
        eph_c,
        eph_s,
        init_did,
        resp_did,
    );
    let message = transcript::ack_message(ctx_id, nonce, kid, &transcript_hash);
    let tag = kdf::hmac_sha256(&ack_key, &message);
    ack_key.zeroize();
    Ok(tag)
}

// ── Responder ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HpkeResponderConfig {
    /// Tolerated |now − ts| on Init.
    pub max_skew: Duration,
    /// TTL of the Init-nonce replay store.
    pub nonce_ttl: Duration,
    /// Optional pre-handshake gate.
    pub dos: DosPolicy,
}

impl Default for HpkeResponderConfig {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(120),
            nonce_ttl: Duration::from_secs(600),
            dos: DosPolicy::None,
        }
    }
}

pub struct HpkeResponder<R: DidResolver> {
    identity: IdentityKeyPair,
    did: String,
    kem: KemKeyPair,
    resolver: Arc<CachingResolver<R>>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    config: HpkeResponderConfig,
    init_nonces: NonceCache,
}

impl<R: DidResolver> HpkeResponder<R> {
    pub fn new(
        identity: IdentityKeyPair,
        did: impl Into<String>,
        kem: KemKeyPair,
        resolver: Arc<CachingResolver<R>>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        config: HpkeResponderConfig,
    ) -> Self {
        let init_nonces = NonceCache::new(config.nonce_ttl, clock.clone());
        Self {
            identity,
            did: did.into(),
            kem,
            resolver,
            sessions,
            clock,
            config,
            init_nonces,
        }
    }

    /// The static KEM public key to publish in this agent's DID document.
    pub fn kem_public(&self) -> &[u8; 32] {
        self.kem.public()
    }

    /// Process an Init and build the signed Ack.
    pub async fn handle_init(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        if msg.task_id != TASK_HPKE_INIT {
            return Err(ProtocolError::Malformed(format!("unexpected task {}", msg.task_id)));
        }
        if msg.meta(META_DID).map_or(true, str::is_empty) {
            return Err(ProtocolError::MissingCredential("did"));
        }
        if msg.meta(META_SIGNATURE).map_or(true, str::is_empty) {
            return Err(ProtocolError::MissingCredential("signature"));
        }

        let payload: HpkeInitPayload = serde_json::from_slice(&msg.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if payload.context_id != msg.context_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }
        if payload.resp_did != self.did {
            return Err(ProtocolError::Malformed("init addressed to another responder".into()));
        }

        // Fail-fast gate before any crypto.
        self.config.dos.verify(
            payload.dos_token.as_deref(),
            &payload.context_id,
            &payload.init_did,
            &payload.resp_did,
        )?;

        let initiator = self
            .resolver
            .resolve(&payload.context_id, &payload.init_did)
            .await?;
        msg.verify(&initiator.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;

        let now = self.clock.unix_secs() as i64;
        if (now - payload.ts).unsigned_abs() > self.config.max_skew.as_secs() {
            warn!(ctx = %payload.context_id, "init outside freshness window");
            return Err(ProtocolError::FreshnessViolation);
        }

        if payload.nonce.is_empty() {
            return Err(ProtocolError::MissingCredential("nonce"));
        }
        if self.init_nonces.seen_once(INIT_NONCE_PARTITION, &payload.nonce) {
            return Err(ProtocolError::ReplayDetected);
        }

        let expected_info = transcript::hpke_info(
            &payload.context_id,
            &payload.init_did,
            &payload.resp_did,
        );
        let expected_export_ctx = transcript::hpke_export_ctx(&payload.context_id);
        if payload.info != expected_info || payload.export_ctx != expected_export_ctx {
            return Err(ProtocolError::TranscriptMismatch);
        }

        let enc = payload.enc_bytes()?;
        ecdh::validate_public_key(&enc).map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let exporter = hpke::setup_base_receiver(&enc, &self.kem, expected_info.as_bytes())
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let mut exporter_secret = exporter
            .export(expected_export_ctx.as_bytes())
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;

        // PFS add-on: mix in a one-shot DH; the ephemeral scalar and the
        // DH output are gone before the seed leaves this scope.
        let eph_c = payload.eph_c_bytes()?;
        let (mut seed, eph_s_pub) = match eph_c {
            Some(eph_c) => {
                ecdh::validate_public_key(&eph_c).map_err(|_| ProtocolError::KeyAgreementFailure)?;
                let eph_s = EphemeralKeyPair::generate();
                let eph_s_pub = *eph_s.public();
                let ss_e2e = eph_s
                    .diffie_hellman(&eph_c)
                    .map_err(|_| ProtocolError::KeyAgreementFailure)?;
                let seed = combine_seed(&expected_export_ctx, &exporter_secret, &ss_e2e)?;
                (seed, Some(eph_s_pub))
            }
            None => (exporter_secret, None),
        };
        exporter_secret.zeroize();

        let ack_nonce = fresh_nonce();
        let outcome = (|| {
            let session = self.sessions.ensure_session(SessionParams {
                ctx_id: &payload.context_id,
                label: transcript::HPKE_SESSION_LABEL,
                self_eph: &ZERO_EPH,
                peer_eph: &ZERO_EPH,
                secret: SessionSecret::Seed(seed),
            })?;
            let kid = self.sessions.issue_kid(session.id())?;
            let tag = ack_tag(
                &seed,
                &expected_info,
                &expected_export_ctx,
                &enc,
                eph_c.as_ref().map_or(&[][..], |e| &e[..]),
                eph_s_pub.as_ref().map_or(&[][..], |e| &e[..]),
                &payload.init_did,
                &payload.resp_did,
                &payload.context_id,
                &ack_nonce,
                &kid,
            )?;
            Ok::<_, ProtocolError>((kid, tag))
        })();
        seed.zeroize();
        let (kid, tag) = outcome?;

        debug!(ctx = %payload.context_id, kid = %kid, pfs = eph_s_pub.is_some(), "hpke handshake accepted");

        let ack = HpkeAckPayload {
            context_id: payload.context_id.clone(),
            nonce: ack_nonce,
            ts: self.clock.unix_secs() as i64,
            kid: kid.clone(),
            ack_tag: URL_SAFE_NO_PAD.encode(tag),
            eph_s: eph_s_pub.map(|p| URL_SAFE_NO_PAD.encode(p)),
        };
        let mut reply = WireMessage::new(
            payload.context_id,
            TASK_HPKE_ACK,
            &serde_json::to_vec(&ack).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            self.did.clone(),
            AgentRole::Agent,
        );
        reply.sign(&self.identity)?;
        reply.set_meta(META_KID, &kid);
        reply.set_meta(META_ACK_TAG, &ack.ack_tag);
        if let Some(eph_s) = &ack.eph_s {
            reply.set_meta(META_EPH_S, eph_s);
        }
        Ok(reply)
    }
}

// ── Initiator ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HpkeInitiatorConfig {
    /// Request the ephemeral-ephemeral add-on.
    pub pfs: bool,
    /// Tolerated |now − ts| on the Ack.
    pub max_skew: Duration,
}

impl Default for HpkeInitiatorConfig {
    fn default() -> Self {
        Self {
            pfs: true,
            max_skew: Duration::from_secs(120),
        }
    }
}

pub struct HpkeInitiator<R: DidResolver> {
    identity: IdentityKeyPair,
    did: String,
    resolver: Arc<CachingResolver<R>>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    config: HpkeInitiatorConfig,
}

impl<R: DidResolver> HpkeInitiator<R> {
    pub fn new(
        identity: IdentityKeyPair,
        did: impl Into<String>,
        resolver: Arc<CachingResolver<R>>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        config: HpkeInitiatorConfig,
    ) -> Self {
        Self {
            identity,
            did: did.into(),
            resolver,
            sessions,
            clock,
            config,
        }
    }

    /// Run the full round trip against `resp_did`. On success the kid from
    /// the Ack is bound to the session locally; a failed key confirmation
    /// aborts without binding anything.
    pub async fn run(
        &self,
        transport: &dyn Transport,
        resp_did: &str,
        ctx_id: &str,
        dos_token: Option<String>,
    ) -> Result<(Arc<Session>, String), ProtocolError> {
        let kem_pub = self.resolver.resolve_kem(ctx_id, resp_did).await?;

        let info = transcript::hpke_info(ctx_id, &self.did, resp_did);
        let export_ctx = transcript::hpke_export_ctx(ctx_id);

        let (enc, exporter) = hpke::setup_base_sender(&kem_pub, info.as_bytes())
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let mut exporter_secret = exporter
            .export(export_ctx.as_bytes())
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;

        let eph_c = self.config.pfs.then(EphemeralKeyPair::generate);
        let eph_c_pub = eph_c.as_ref().map(|pair| *pair.public());

        let init = HpkeInitPayload {
            context_id: ctx_id.to_string(),
            init_did: self.did.clone(),
            resp_did: resp_did.to_string(),
            info: info.clone(),
            export_ctx: export_ctx.clone(),
            enc: URL_SAFE_NO_PAD.encode(enc),
            nonce: fresh_nonce(),
            ts: self.clock.unix_secs() as i64,
            eph_c: eph_c_pub.map(|p| URL_SAFE_NO_PAD.encode(p)),
            dos_token,
        };
        let mut msg = WireMessage::new(
            ctx_id,
            TASK_HPKE_INIT,
            &serde_json::to_vec(&init).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            self.did.clone(),
            AgentRole::Agent,
        );
        msg.sign(&self.identity)?;

        let reply = transport.request(msg).await?;

        if reply.task_id != TASK_HPKE_ACK {
            return Err(ProtocolError::Malformed(format!("unexpected task {}", reply.task_id)));
        }
        let responder = self.resolver.resolve(ctx_id, resp_did).await?;
        reply
            .verify(&responder.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;

        let ack: HpkeAckPayload = serde_json::from_slice(&reply.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if ack.context_id != ctx_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }
        let now = self.clock.unix_secs() as i64;
        if (now - ack.ts).unsigned_abs() > self.config.max_skew.as_secs() {
            return Err(ProtocolError::FreshnessViolation);
        }
        if ack.kid.is_empty() {
            return Err(ProtocolError::MissingCredential("kid"));
        }

        // Derive the seed: base, or combined with the responder ephemeral.
        let eph_s_pub = ack.eph_s_bytes()?;
        let mut seed = match (eph_c, eph_s_pub) {
            (Some(pair), Some(eph_s)) => {
                ecdh::validate_public_key(&eph_s).map_err(|_| ProtocolError::KeyAgreementFailure)?;
                let ss_e2e = pair
                    .diffie_hellman(&eph_s)
                    .map_err(|_| ProtocolError::KeyAgreementFailure)?;
                combine_seed(&export_ctx, &exporter_secret, &ss_e2e)?
            }
            (None, None) => exporter_secret,
            _ => return Err(ProtocolError::TranscriptMismatch),
        };
        exporter_secret.zeroize();

        // Key confirmation: recompute the tag over our own view of the
        // transcript and compare in constant time.
        let expected = ack_tag(
            &seed,
            &info,
            &export_ctx,
            &enc,
            eph_c_pub.as_ref().map_or(&[][..], |e| &e[..]),
            eph_s_pub.as_ref().map_or(&[][..], |e| &e[..]),
            &self.did,
            resp_did,
            ctx_id,
            &ack.nonce,
            &ack.kid,
        )?;
        let presented = ack.ack_tag_bytes()?;
        if !kdf::ct_eq(&expected, &presented) {
            seed.zeroize();
            warn!(ctx = %ctx_id, "ack tag mismatch; aborting without binding kid");
            return Err(ProtocolError::TranscriptMismatch);
        }

        let session = self.sessions.ensure_session(SessionParams {
            ctx_id,
            label: transcript::HPKE_SESSION_LABEL,
            self_eph: &ZERO_EPH,
            peer_eph: &ZERO_EPH,
            secret: SessionSecret::Seed(seed),
        });
        seed.zeroize();
        let session = session?;
        self.sessions.bind_kid(&ack.kid, session.id())?;
        debug!(ctx = %ctx_id, kid = %ack.kid, "hpke handshake confirmed");
        Ok((session, ack.kid))
    }
}
