//! sage_crypto — cryptographic primitives for SAGE agent messaging
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Fixed cipher suite per protocol version: Ed25519 identity signatures,
//!   X25519 ECDH, HKDF-SHA256, ChaCha20-Poly1305 session AEAD,
//!   HMAC-SHA256 message authentication. AES-256-GCM is used only inside
//!   the handshake bootstrap envelope.
//!
//! # Module layout
//! - `identity`   — long-term Ed25519 identity keys + fingerprints
//! - `ecdh`       — X25519 ephemeral keys with contributory-behaviour checks
//! - `aead`       — ChaCha20-Poly1305 / AES-256-GCM encrypt/decrypt helpers
//! - `kdf`        — HKDF-SHA256 / HMAC-SHA256 helpers
//! - `hpke`       — RFC 9180 HPKE base mode, export-only (DHKEM X25519)
//! - `transcript` — canonical protocol strings and transcript hashes
//! - `envelope`   — bootstrap envelope (Ephemeral-Static ECDH → AES-GCM)
//! - `error`      — unified error type

pub mod aead;
pub mod ecdh;
pub mod envelope;
pub mod error;
pub mod hpke;
pub mod identity;
pub mod kdf;
pub mod transcript;

pub use error::CryptoError;
