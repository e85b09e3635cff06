use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Malformed ciphertext envelope")]
    MalformedEnvelope,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
