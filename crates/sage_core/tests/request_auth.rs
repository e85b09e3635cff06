//! Per-request authentication through the session manager: covered
//! components, replay guard, freshness, and lifetime policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use sage_core::clock::{Clock, ManualClock};
use sage_core::error::ProtocolError;
use sage_core::session::config::SessionConfig;
use sage_core::session::covered::{signature_header, CoveredComponents};
use sage_core::session::manager::{SessionManager, SessionParams, SessionSecret};
use sage_core::session::session::Session;

fn manager_with(config: SessionConfig) -> (Arc<SessionManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    (
        Arc::new(SessionManager::with_clock(config, clock.clone()).unwrap()),
        clock,
    )
}

fn establish(manager: &SessionManager, seed: [u8; 32]) -> (Arc<Session>, String) {
    let session = manager
        .ensure_session(SessionParams {
            ctx_id: "ctx-req",
            label: "request-auth v1",
            self_eph: &[0u8; 32],
            peer_eph: &[0u8; 32],
            secret: SessionSecret::Seed(seed),
        })
        .unwrap();
    let kid = manager.issue_kid(session.id()).unwrap();
    (session, kid)
}

fn now_utc(clock: &ManualClock) -> DateTime<Utc> {
    DateTime::<Utc>::from(clock.now())
}

fn signed_request(
    session: &Session,
    clock: &ManualClock,
    kid: &str,
    nonce: &str,
    body: &[u8],
) -> (CoveredComponents, String) {
    let covered = CoveredComponents::for_request(
        "POST",
        "/protected",
        "agent.example",
        now_utc(clock),
        body,
        kid,
        nonce,
    );
    let tag = session.sign_covered(&covered.canonical_bytes()).unwrap();
    (covered, signature_header(&tag))
}

#[tokio::test]
async fn valid_request_authorizes_and_replay_is_rejected() {
    let (manager, clock) = manager_with(SessionConfig::default());
    let (session, kid) = establish(&manager, [11u8; 32]);

    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-1", b"{\"op\":1}");
    manager.authorize_request(&covered, &header).unwrap();

    // The identical request again: replay.
    assert_eq!(
        manager.authorize_request(&covered, &header).unwrap_err(),
        ProtocolError::ReplayDetected
    );

    // A fresh nonce passes.
    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-2", b"{\"op\":1}");
    manager.authorize_request(&covered, &header).unwrap();
}

#[tokio::test]
async fn tampered_body_fails_verification_without_breaking_the_session() {
    let (manager, clock) = manager_with(SessionConfig::default());
    let (session, kid) = establish(&manager, [12u8; 32]);

    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-1", b"original body");

    // The server rebuilds covered components from the body it received.
    let tampered = CoveredComponents::for_request(
        "POST",
        "/protected",
        "agent.example",
        now_utc(&clock),
        b"tampered body",
        &kid,
        "nonce-1b",
    );
    assert_eq!(
        manager.authorize_request(&tampered, &header).unwrap_err(),
        ProtocolError::SignatureInvalid
    );

    // Session state is otherwise unchanged: the original request still works.
    manager.authorize_request(&covered, &header).unwrap();
}

#[tokio::test]
async fn idle_timeout_expires_the_session() {
    let (manager, clock) = manager_with(SessionConfig {
        idle_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    });
    let (session, kid) = establish(&manager, [13u8; 32]);
    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-1", b"x");
    manager.authorize_request(&covered, &header).unwrap();

    clock.advance(Duration::from_millis(2_500));
    let covered = CoveredComponents::for_request(
        "POST",
        "/protected",
        "agent.example",
        now_utc(&clock),
        b"x",
        &kid,
        "nonce-2",
    );
    assert_eq!(
        manager
            .authorize_request(&covered, &signature_header(&[0u8; 32]))
            .unwrap_err(),
        ProtocolError::SessionExpired
    );
}

#[tokio::test]
async fn stale_date_header_is_rejected() {
    let (manager, clock) = manager_with(SessionConfig::default());
    let (session, kid) = establish(&manager, [14u8; 32]);

    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-1", b"x");
    clock.advance(Duration::from_secs(6 * 60));
    assert_eq!(
        manager.authorize_request(&covered, &header).unwrap_err(),
        ProtocolError::FreshnessViolation
    );
}

#[tokio::test]
async fn unknown_kid_is_rejected() {
    let (manager, clock) = manager_with(SessionConfig::default());
    let (session, _) = establish(&manager, [15u8; 32]);
    let (covered, header) = signed_request(&session, &clock, "kid-from-nowhere", "n", b"x");
    assert_eq!(
        manager.authorize_request(&covered, &header).unwrap_err(),
        ProtocolError::SessionNotFound
    );
}

#[tokio::test]
async fn removing_the_session_invalidates_its_kids_and_replay_state() {
    let (manager, clock) = manager_with(SessionConfig::default());
    let (session, kid) = establish(&manager, [16u8; 32]);
    let (covered, header) = signed_request(&session, &clock, &kid, "nonce-1", b"x");
    manager.authorize_request(&covered, &header).unwrap();

    manager.remove_session(session.id());
    assert_eq!(
        manager.authorize_request(&covered, &header).unwrap_err(),
        ProtocolError::SessionNotFound
    );
    assert!(session.is_closed());
}

#[tokio::test]
async fn gc_sweep_reclaims_expired_sessions() {
    let (manager, clock) = manager_with(SessionConfig {
        max_age: Duration::from_secs(60),
        ..SessionConfig::default()
    });
    let (_, kid) = establish(&manager, [17u8; 32]);
    assert_eq!(manager.len(), 1);

    clock.advance(Duration::from_secs(61));
    manager.gc();
    assert_eq!(manager.len(), 0);
    assert_eq!(
        manager.get_by_kid(&kid).unwrap_err(),
        ProtocolError::SessionNotFound
    );
}
