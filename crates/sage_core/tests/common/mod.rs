//! Shared fixtures: an in-memory DID resolver and loopback transports
//! that feed a responder directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use sage_core::error::ProtocolError;
use sage_core::handshake::hpke::HpkeResponder;
use sage_core::handshake::legacy::LegacyResponder;
use sage_core::resolver::DidResolver;
use sage_core::transport::Transport;
use sage_crypto::identity::PublicKeyBytes;
use sage_proto::WireMessage;

#[derive(Default)]
pub struct TestResolver {
    pub keys: HashMap<String, PublicKeyBytes>,
    pub kem_keys: HashMap<String, [u8; 32]>,
}

#[async_trait]
impl DidResolver for TestResolver {
    async fn resolve_public_key(&self, did: &str) -> Result<PublicKeyBytes, ProtocolError> {
        self.keys
            .get(did)
            .cloned()
            .ok_or_else(|| ProtocolError::ResolverFailure(format!("unknown DID {did}")))
    }

    async fn resolve_kem_key(&self, did: &str) -> Result<[u8; 32], ProtocolError> {
        self.kem_keys
            .get(did)
            .copied()
            .ok_or_else(|| ProtocolError::ResolverFailure(format!("no KEM key for {did}")))
    }
}

pub struct LegacyLoop(pub Arc<LegacyResponder<TestResolver>>);

#[async_trait]
impl Transport for LegacyLoop {
    async fn request(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        self.0.handle(msg).await
    }
}

pub struct HpkeLoop(pub Arc<HpkeResponder<TestResolver>>);

#[async_trait]
impl Transport for HpkeLoop {
    async fn request(&self, msg: WireMessage) -> Result<WireMessage, ProtocolError> {
        self.0.handle_init(msg).await
    }
}
