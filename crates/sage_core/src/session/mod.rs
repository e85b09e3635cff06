//! Session layer: per-session crypto state plus the manager that owns it.
//!
//! - `config`  — lifetime policy and knobs
//! - `covered` — covered-component canonicalisation for request signatures
//! - `session` — one session's keys, AEAD, MAC, and lifecycle
//! - `manager` — session map, key-id bindings, replay guard, background GC

pub mod config;
pub mod covered;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use config::SessionConfig;
pub use covered::CoveredComponents;
pub use manager::{SessionManager, SessionParams, SessionSecret};
pub use session::Session;
