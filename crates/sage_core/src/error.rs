//! Protocol error taxonomy.
//!
//! One kind per externally observable rejection class. Crypto internals
//! never leak: AEAD tag failures, truncations, and bad envelopes all
//! collapse into `DecryptionFailure`; signature details into
//! `SignatureInvalid`. Variants carry at most operator-facing context
//! (a DID, a field name), never key material.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Message outside freshness window")]
    FreshnessViolation,

    #[error("Replay detected")]
    ReplayDetected,

    #[error("Transcript mismatch")]
    TranscriptMismatch,

    #[error("Key agreement failed")]
    KeyAgreementFailure,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session not found")]
    SessionNotFound,

    #[error("DID resolution failed: {0}")]
    ResolverFailure(String),

    #[error("Ephemeral key provisioning failed: {0}")]
    EphemeralFailure(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// HTTP-equivalent status for transport glue. The core itself never
    /// speaks HTTP; this keeps the mapping in one place.
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::MissingCredential(_) | Self::KeyAgreementFailure | Self::Malformed(_) => 400,
            Self::SignatureInvalid
            | Self::DecryptionFailure
            | Self::FreshnessViolation
            | Self::ReplayDetected
            | Self::TranscriptMismatch
            | Self::SessionExpired
            | Self::SessionNotFound => 401,
            Self::ResolverFailure(_) => 503,
            Self::EphemeralFailure(_) => 500,
            Self::ConfigurationError(_) => 500,
        }
    }
}

impl From<sage_proto::ProtoError> for ProtocolError {
    fn from(e: sage_proto::ProtoError) -> Self {
        Self::Malformed(e.to_string())
    }
}
