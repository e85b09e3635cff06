//! Legacy four-phase handshake.
//!
//! Responder state machine, keyed by context id:
//!   IDLE → PEER_CACHED (Invitation) → PENDING_EPH (Request)
//!        → SESSION_READY (Complete)
//!
//! Invitation and Complete are plaintext JSON signed by the initiator's
//! identity key. Request and Response are sign-then-encrypt: the inner
//! payload is signed, then the whole packet is sealed in a bootstrap
//! envelope to the peer's identity key. Ephemeral X25519 publics cross in
//! Request/Response; the shared secret and the transcript salt meet in
//! the session manager, which derives the seed.
//!
//! A Complete that finds no pending state is still acknowledged (with
//! `session_created = false`) so retransmitted Completes stay idempotent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use sage_crypto::{
    ecdh::{self, EphemeralKeyPair},
    envelope,
    identity::{IdentityKeyPair, PublicKeyBytes},
    transcript,
};
use sage_proto::handshake::{
    CompleteAck, CompletePayload, InvitationAck, InvitationPayload, RequestPayload,
    ResponsePayload, SealedPacket,
};
use sage_proto::message::{AgentRole, HandshakePhase, WireMessage};

use crate::clock::Clock;
use crate::ephemeral::EphemeralProvider;
use crate::error::ProtocolError;
use crate::resolver::{CachingResolver, DidResolver};
use crate::session::manager::{SessionManager, SessionParams, SessionSecret};
use crate::session::session::Session;
use crate::transport::Transport;

// ── Responder-side caches ────────────────────────────────────────────────────

/// Peer material cached at Invitation, used to verify Request/Complete.
#[derive(Clone)]
struct CachedPeer {
    did: String,
    verification_key: PublicKeyBytes,
    expires: SystemTime,
}

/// Ephemeral pair state between Request and Complete.
struct PendingState {
    peer_eph: [u8; 32],
    server_eph: [u8; 32],
    expires: SystemTime,
}

#[derive(Clone)]
pub struct LegacyResponderConfig {
    /// TTL for the peer cache and pending-ephemeral state.
    pub cache_ttl: Duration,
    /// Mint and return a kid in the Complete ack.
    pub issue_kids: bool,
}

impl Default for LegacyResponderConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15 * 60),
            issue_kids: true,
        }
    }
}

pub struct LegacyResponder<R: DidResolver> {
    identity: IdentityKeyPair,
    did: String,
    resolver: Arc<CachingResolver<R>>,
    sessions: Arc<SessionManager>,
    ephemerals: Arc<dyn EphemeralProvider>,
    clock: Arc<dyn Clock>,
    config: LegacyResponderConfig,
    peers: RwLock<HashMap<String, CachedPeer>>,
    pending: RwLock<HashMap<String, PendingState>>,
}

impl<R: DidResolver> LegacyResponder<R> {
    pub fn new(
        identity: IdentityKeyPair,
        did: impl Into<String>,
        resolver: Arc<CachingResolver<R>>,
        sessions: Arc<SessionManager>,
        ephemerals: Arc<dyn EphemeralProvider>,
        clock: Arc<dyn Clock>,
        config: LegacyResponderConfig,
    ) -> Self {
        Self {
            identity,
            did: did.into(),
            resolver,
            sessions,
            ephemerals,
            clock,
            config,
            peers: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatch one inbound handshake message.
    pub async fn handle(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        self.purge_expired();
        match HandshakePhase::from_task_id(&msg.task_id)? {
            HandshakePhase::Invitation => self.handle_invitation(msg).await,
            HandshakePhase::Request => self.handle_request(msg),
            HandshakePhase::Response => Err(ProtocolError::Malformed(
                "responder does not accept Response".into(),
            )),
            HandshakePhase::Complete => self.handle_complete(msg),
        }
    }

    async fn handle_invitation(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        if msg.did.is_empty() {
            return Err(ProtocolError::MissingCredential("did"));
        }
        let peer = self.resolver.resolve(&msg.context_id, &msg.did).await?;
        msg.verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;

        let payload: InvitationPayload = serde_json::from_slice(&msg.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if payload.context_id != msg.context_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }
        if payload.resp_did != self.did {
            return Err(ProtocolError::Malformed("invitation addressed elsewhere".into()));
        }

        self.peers.write().expect("peer cache poisoned").insert(
            msg.context_id.clone(),
            CachedPeer {
                did: peer.did.clone(),
                verification_key: peer.verification_key.clone(),
                expires: self.clock.now() + self.config.cache_ttl,
            },
        );
        debug!(
            ctx = %msg.context_id,
            peer = %peer.did,
            fingerprint = %peer.verification_key.fingerprint(),
            "invitation accepted"
        );

        self.signed_reply(
            &msg.context_id,
            HandshakePhase::Invitation.task_id(),
            &InvitationAck {
                context_id: msg.context_id.clone(),
                accepted: true,
            },
        )
    }

    fn handle_request(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        let peer = self.cached_peer(&msg.context_id)?;
        msg.verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;

        let ciphertext = msg.payload_bytes()?;
        let plaintext = envelope::open(&self.identity, &ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        let packet: SealedPacket = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let inner = packet
            .verify_open(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let request: RequestPayload = serde_json::from_slice(&inner)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if request.context_id != msg.context_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }

        let peer_eph = request.eph_pub_bytes()?;
        ecdh::validate_public_key(&peer_eph).map_err(|_| ProtocolError::KeyAgreementFailure)?;

        let (server_eph, server_eph_b64) = self.ephemerals.ask_ephemeral(&msg.context_id)?;
        self.pending.write().expect("pending cache poisoned").insert(
            msg.context_id.clone(),
            PendingState {
                peer_eph,
                server_eph,
                expires: self.clock.now() + self.config.cache_ttl,
            },
        );
        debug!(ctx = %msg.context_id, "request accepted, ephemeral minted");

        let response = ResponsePayload {
            context_id: msg.context_id.clone(),
            eph_pub: server_eph_b64,
            ack: true,
            ts: self.clock.unix_secs() as i64,
        };
        let inner = serde_json::to_vec(&response)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let packet = SealedPacket::build(&self.identity, &inner);
        let packet_json = serde_json::to_vec(&packet)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let peer_ed = peer
            .verification_key
            .as_array()
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let sealed = envelope::seal(&peer_ed, &packet_json)
            .map_err(|_| ProtocolError::DecryptionFailure)?;

        let mut reply = WireMessage::new(
            msg.context_id.clone(),
            HandshakePhase::Response.task_id(),
            &sealed,
            self.did.clone(),
            AgentRole::Agent,
        );
        reply.sign(&self.identity)?;
        Ok(reply)
    }

    fn handle_complete(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        let peer = self.cached_peer(&msg.context_id)?;
        msg.verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let payload: CompletePayload = serde_json::from_slice(&msg.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if payload.context_id != msg.context_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }

        // Atomic take: a concurrent duplicate Complete sees no pending
        // state and acknowledges without creating a second session.
        let pending = self
            .pending
            .write()
            .expect("pending cache poisoned")
            .remove(&msg.context_id);
        let Some(pending) = pending else {
            self.ephemerals.discard(&msg.context_id);
            debug!(ctx = %msg.context_id, "complete without pending state, acknowledging");
            return self.signed_reply(
                &msg.context_id,
                HandshakePhase::Complete.task_id(),
                &CompleteAck {
                    context_id: msg.context_id.clone(),
                    session_created: false,
                    kid: None,
                },
            );
        };

        let shared = self
            .ephemerals
            .complete(&msg.context_id, &pending.peer_eph)?;
        let session = self.sessions.ensure_session(SessionParams {
            ctx_id: &msg.context_id,
            label: transcript::LEGACY_LABEL,
            self_eph: &pending.server_eph,
            peer_eph: &pending.peer_eph,
            secret: SessionSecret::SharedSecret(shared),
        })?;
        let kid = if self.config.issue_kids {
            Some(self.sessions.issue_kid(session.id())?)
        } else {
            None
        };
        info!(ctx = %msg.context_id, peer = %peer.did, sid = %session.id(), "legacy handshake complete");

        self.signed_reply(
            &msg.context_id,
            HandshakePhase::Complete.task_id(),
            &CompleteAck {
                context_id: msg.context_id.clone(),
                session_created: true,
                kid,
            },
        )
    }

    fn cached_peer(&self, ctx_id: &str) -> Result<CachedPeer, ProtocolError> {
        let peers = self.peers.read().expect("peer cache poisoned");
        let peer = peers.get(ctx_id).ok_or(ProtocolError::SessionNotFound)?;
        if peer.expires < self.clock.now() {
            return Err(ProtocolError::SessionNotFound);
        }
        Ok(peer.clone())
    }

    fn signed_reply<T: serde::Serialize>(
        &self,
        ctx_id: &str,
        task_id: &str,
        payload: &T,
    ) -> Result<WireMessage, ProtocolError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let mut reply = WireMessage::new(ctx_id, task_id, &bytes, self.did.clone(), AgentRole::Agent);
        reply.sign(&self.identity)?;
        Ok(reply)
    }

    fn purge_expired(&self) {
        let now = self.clock.now();
        self.peers
            .write()
            .expect("peer cache poisoned")
            .retain(|_, peer| peer.expires >= now);
        let mut dropped: Vec<String> = Vec::new();
        self.pending.write().expect("pending cache poisoned").retain(|ctx, state| {
            let keep = state.expires >= now;
            if !keep {
                dropped.push(ctx.clone());
            }
            keep
        });
        for ctx in dropped {
            self.ephemerals.discard(&ctx);
            warn!(ctx = %ctx, "pending handshake expired");
        }
    }

    #[cfg(test)]
    fn has_pending(&self, ctx_id: &str) -> bool {
        self.pending
            .read()
            .expect("pending cache poisoned")
            .contains_key(ctx_id)
    }
}

// ── Initiator ────────────────────────────────────────────────────────────────

pub struct LegacyInitiator<R: DidResolver> {
    identity: IdentityKeyPair,
    did: String,
    resolver: Arc<CachingResolver<R>>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
}

impl<R: DidResolver> LegacyInitiator<R> {
    pub fn new(
        identity: IdentityKeyPair,
        did: impl Into<String>,
        resolver: Arc<CachingResolver<R>>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            did: did.into(),
            resolver,
            sessions,
            clock,
        }
    }

    /// Drive all four phases against `resp_did`. Returns the session and
    /// the kid minted by the responder, if any.
    pub async fn run(
        &self,
        transport: &dyn Transport,
        resp_did: &str,
        ctx_id: &str,
    ) -> Result<(Arc<Session>, Option<String>), ProtocolError> {
        let peer = self.resolver.resolve(ctx_id, resp_did).await?;
        let peer_ed = peer
            .verification_key
            .as_array()
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let ts = self.clock.unix_secs() as i64;

        // Phase 1 — Invitation.
        let invitation = InvitationPayload {
            context_id: ctx_id.to_string(),
            init_did: self.did.clone(),
            resp_did: resp_did.to_string(),
            ts,
        };
        let reply = transport
            .request(self.signed_message(ctx_id, HandshakePhase::Invitation, &invitation)?)
            .await?;
        reply
            .verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let ack: InvitationAck = serde_json::from_slice(&reply.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if !ack.accepted {
            return Err(ProtocolError::Malformed("invitation declined".into()));
        }

        // Phase 2 — Request, carrying our ephemeral inside the envelope.
        let eph = EphemeralKeyPair::generate();
        let eph_pub = *eph.public();
        let request = RequestPayload {
            context_id: ctx_id.to_string(),
            eph_pub: eph.public_b64(),
            ts,
        };
        let inner = serde_json::to_vec(&request)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let packet = SealedPacket::build(&self.identity, &inner);
        let packet_json = serde_json::to_vec(&packet)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let sealed = envelope::seal(&peer_ed, &packet_json)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        let mut request_msg = WireMessage::new(
            ctx_id,
            HandshakePhase::Request.task_id(),
            &sealed,
            self.did.clone(),
            AgentRole::User,
        );
        request_msg.sign(&self.identity)?;
        let response_msg = transport.request(request_msg).await?;

        // Phase 3 — Response: unseal, verify, extract the peer ephemeral.
        response_msg
            .verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let plaintext = envelope::open(&self.identity, &response_msg.payload_bytes()?)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        let packet: SealedPacket = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let inner = packet
            .verify_open(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let response: ResponsePayload = serde_json::from_slice(&inner)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if response.context_id != ctx_id {
            return Err(ProtocolError::Malformed("context mismatch".into()));
        }
        let peer_eph = response.eph_pub_bytes()?;
        ecdh::validate_public_key(&peer_eph).map_err(|_| ProtocolError::KeyAgreementFailure)?;

        // Our ephemeral scalar is consumed here and destroyed.
        let shared = eph
            .diffie_hellman(&peer_eph)
            .map_err(|_| ProtocolError::KeyAgreementFailure)?;
        let session = self.sessions.ensure_session(SessionParams {
            ctx_id,
            label: transcript::LEGACY_LABEL,
            self_eph: &eph_pub,
            peer_eph: &peer_eph,
            secret: SessionSecret::SharedSecret(shared),
        })?;

        // Phase 4 — Complete; bind the responder-minted kid locally.
        let complete = CompletePayload {
            context_id: ctx_id.to_string(),
            ts: self.clock.unix_secs() as i64,
        };
        let reply = transport
            .request(self.signed_message(ctx_id, HandshakePhase::Complete, &complete)?)
            .await?;
        reply
            .verify(&peer.verification_key.0)
            .map_err(|_| ProtocolError::SignatureInvalid)?;
        let ack: CompleteAck = serde_json::from_slice(&reply.payload_bytes()?)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let Some(kid) = &ack.kid {
            self.sessions.bind_kid(kid, session.id())?;
        }
        debug!(ctx = %ctx_id, sid = %session.id(), "legacy handshake finished");
        Ok((session, ack.kid))
    }

    fn signed_message<T: serde::Serialize>(
        &self,
        ctx_id: &str,
        phase: HandshakePhase,
        payload: &T,
    ) -> Result<WireMessage, ProtocolError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let mut msg = WireMessage::new(ctx_id, phase.task_id(), &bytes, self.did.clone(), AgentRole::User);
        msg.sign(&self.identity)?;
        Ok(msg)
    }
}
