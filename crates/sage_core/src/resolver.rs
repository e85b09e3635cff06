//! DID resolution as a capability.
//!
//! The core never talks to a registry itself; it consumes a `DidResolver`
//! injected at construction and treats its answers as authoritative.
//! `CachingResolver` wraps any resolver with a TTL cache plus singleflight
//! so N concurrent handshakes for the same agent cost one lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use sage_crypto::identity::PublicKeyBytes;

use crate::clock::Clock;
use crate::error::ProtocolError;
use crate::singleflight::Singleflight;

/// Resolved identity material for one agent.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub did: String,
    /// Ed25519 verification key from the DID document.
    pub verification_key: PublicKeyBytes,
    /// Static X25519 KEM public key, when the agent publishes one.
    pub kem_key: Option<[u8; 32]>,
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    /// Current identity verification key for `did`.
    async fn resolve_public_key(&self, did: &str) -> Result<PublicKeyBytes, ProtocolError>;

    /// Static KEM public key for `did` (HPKE handshake only).
    async fn resolve_kem_key(&self, did: &str) -> Result<[u8; 32], ProtocolError>;
}

// ── Caching wrapper ──────────────────────────────────────────────────────────

struct CacheEntry {
    identity: AgentIdentity,
    expires: SystemTime,
}

/// TTL cache + singleflight over an inner resolver.
///
/// Lookups are keyed by `(ctx_id, did)` for the singleflight so concurrent
/// invitations dedupe, while cached entries are shared across contexts.
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    flight: Singleflight<(String, String), Result<AgentIdentity, ProtocolError>>,
}

impl<R: DidResolver> CachingResolver<R> {
    pub fn new(inner: R, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            ttl,
            clock,
            cache: RwLock::new(HashMap::new()),
            flight: Singleflight::new(),
        }
    }

    /// Resolve the verification key, deduping concurrent calls that share
    /// `(ctx_id, did)`.
    pub async fn resolve(
        &self,
        ctx_id: &str,
        did: &str,
    ) -> Result<AgentIdentity, ProtocolError> {
        if did.is_empty() {
            return Err(ProtocolError::MissingCredential("did"));
        }
        if let Some(identity) = self.cached(did) {
            return Ok(identity);
        }

        let key = (ctx_id.to_string(), did.to_string());
        let did_owned = did.to_string();
        let result = self
            .flight
            .run(key, || async move {
                debug!(did = %did_owned, "resolving DID");
                let verification_key = self.inner.resolve_public_key(&did_owned).await?;
                Ok(AgentIdentity {
                    did: did_owned,
                    verification_key,
                    kem_key: None,
                })
            })
            .await?;

        self.store(result.clone());
        Ok(result)
    }

    /// Resolve the static KEM key; cached alongside the identity.
    pub async fn resolve_kem(&self, ctx_id: &str, did: &str) -> Result<[u8; 32], ProtocolError> {
        if let Some(identity) = self.cached(did) {
            if let Some(kem) = identity.kem_key {
                return Ok(kem);
            }
        }
        let mut identity = self.resolve(ctx_id, did).await?;
        let kem = self.inner.resolve_kem_key(did).await?;
        identity.kem_key = Some(kem);
        self.store(identity);
        Ok(kem)
    }

    fn cached(&self, did: &str) -> Option<AgentIdentity> {
        let cache = self.cache.read().expect("resolver cache poisoned");
        let entry = cache.get(did)?;
        if entry.expires < self.clock.now() {
            return None;
        }
        Some(entry.identity.clone())
    }

    fn store(&self, identity: AgentIdentity) {
        let mut cache = self.cache.write().expect("resolver cache poisoned");
        cache.insert(
            identity.did.clone(),
            CacheEntry {
                expires: self.clock.now() + self.ttl,
                identity,
            },
        );
    }

    /// Access the wrapped resolver.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Drop expired entries.
    pub fn purge(&self) {
        let now = self.clock.now();
        let mut cache = self.cache.write().expect("resolver cache poisoned");
        cache.retain(|_, entry| entry.expires >= now);
    }
}
