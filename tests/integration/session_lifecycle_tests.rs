//! Integration tests for session lifecycle rules against an in-process
//! engine double.

use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_session::models::peer::PeerOptions;
use probe_session::models::portal::PortalOptions;
use probe_session::models::runtime::ScriptRuntime;
use probe_session::models::script_options::{ScriptOptions, DEFAULT_SCRIPT_NAME};
use probe_session::models::snapshot_options::SnapshotOptions;
use probe_session::{AppError, Cancellable};

use super::test_helpers::{open_session, StubEngine};

fn detached_err() -> AppError {
    AppError::InvalidState("session detached".into())
}

fn released_err() -> AppError {
    AppError::InvalidState("session released".into())
}

// ── Detach ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn detach_is_idempotent() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    assert!(!session.is_detached());

    session
        .detach(&Cancellable::new())
        .await
        .expect("first detach succeeds");
    assert!(session.is_detached());

    session
        .detach(&Cancellable::new())
        .await
        .expect("second detach succeeds");
    assert_eq!(engine.detach_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn detach_cancelled_mid_flight_leaves_session_attached() {
    let engine = StubEngine::new();
    engine.set_detach_delay(Duration::from_secs(30));
    let session = open_session(&engine);

    let token = Cancellable::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = session.detach(&token).await.expect_err("detach cancelled");
    assert_eq!(err, AppError::Cancelled);
    assert!(!session.is_detached());
}

#[tokio::test]
async fn detach_with_already_cancelled_token_never_reaches_engine() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let token = Cancellable::new();
    token.cancel();
    assert_eq!(session.detach(&token).await, Err(AppError::Cancelled));
    assert_eq!(engine.detach_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn operations_after_detach_are_invalid_state() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    session
        .detach(&Cancellable::new())
        .await
        .expect("detach succeeds");

    assert_eq!(session.resume().await, Err(detached_err()));
    assert_eq!(session.enable_child_gating().await, Err(detached_err()));
    assert_eq!(session.disable_child_gating().await, Err(detached_err()));
    assert_eq!(
        session.create_script("send(1)").await.map(|_| ()),
        Err(detached_err())
    );
    assert_eq!(
        session.compile_script("send(1)", None).await.map(|_| ()),
        Err(detached_err())
    );
    assert_eq!(
        session
            .snapshot_script("lib()", &SnapshotOptions::new("", ScriptRuntime::V8))
            .await
            .map(|_| ()),
        Err(detached_err())
    );
    assert_eq!(
        session.setup_peer_connection(&PeerOptions::new()).await,
        Err(detached_err())
    );
    assert_eq!(
        session
            .join_portal("portal:27052", &PortalOptions::new())
            .await
            .map(|_| ()),
        Err(detached_err())
    );
}

#[tokio::test]
async fn engine_initiated_detach_is_observed() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    engine.emit_detached(
        session.handle(),
        probe_session::models::event::DetachReason::DeviceLost,
        None,
    );

    assert!(session.is_detached());
    assert_eq!(session.resume().await, Err(detached_err()));
    session
        .detach(&Cancellable::new())
        .await
        .expect("detaching a detached session is a no-op");
    assert_eq!(engine.detach_calls.load(Ordering::SeqCst), 0);
}

// ── Release ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn operations_after_release_are_invalid_state() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    session.release().expect("release succeeds");

    assert!(session.is_released());
    assert!(session.is_detached());
    assert_eq!(session.detach(&Cancellable::new()).await, Err(released_err()));
    assert_eq!(session.resume().await, Err(released_err()));
    assert_eq!(
        session.create_script("send(1)").await.map(|_| ()),
        Err(released_err())
    );
    assert!(matches!(session.subscribe(), Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn release_succeeds_exactly_once() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let handle = session.handle();

    session.release().expect("first release succeeds");
    assert_eq!(
        session.release(),
        Err(AppError::InvalidState("session already released".into()))
    );
    assert_eq!(*engine.released_sessions.lock().unwrap(), vec![handle]);

    drop(session);
    assert_eq!(engine.released_sessions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn release_is_refused_while_a_call_is_in_flight() {
    let engine = StubEngine::new();
    engine.set_call_delay(Duration::from_millis(200));
    let session = open_session(&engine);

    let resume = session.resume();
    tokio::pin!(resume);
    tokio::select! {
        _ = &mut resume => panic!("resume finished too early"),
        () = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    assert_eq!(
        session.release(),
        Err(AppError::InvalidState("session has operations in flight".into()))
    );
    resume.await.expect("resume completes");
    session.release().expect("release after the call succeeds");
}

#[tokio::test]
async fn dropping_an_unreleased_session_frees_the_handle() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let handle = session.handle();

    drop(session);
    assert_eq!(*engine.released_sessions.lock().unwrap(), vec![handle]);
}

// ── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn non_detach_calls_run_in_parallel() {
    let engine = StubEngine::new();
    engine.set_call_delay(Duration::from_millis(100));
    let session = open_session(&engine);

    let (a, b) = tokio::join!(session.resume(), session.enable_child_gating());
    a.expect("resume succeeds");
    b.expect("gating succeeds");
    assert_eq!(engine.peak_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn detach_waits_for_in_flight_calls() {
    let engine = StubEngine::new();
    engine.set_call_delay(Duration::from_millis(100));
    let session = open_session(&engine);

    let detach_later = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.detach(&Cancellable::new()).await
    };
    let (resumed, detached) = tokio::join!(session.resume(), detach_later);
    resumed.expect("resume succeeds");
    detached.expect("detach succeeds");

    assert_eq!(
        engine.log(),
        vec!["resume:start", "resume:end", "detach:start", "detach:end"]
    );
    assert_eq!(engine.peak_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn call_queued_behind_detach_sees_detached_session() {
    let engine = StubEngine::new();
    engine.set_detach_delay(Duration::from_millis(100));
    let session = open_session(&engine);

    let resume_later = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.resume().await
    };
    let token = Cancellable::new();
    let (detached, resumed) = tokio::join!(session.detach(&token), resume_later);
    detached.expect("detach succeeds");
    assert_eq!(resumed, Err(detached_err()));
}

// ── Scripts ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_or_empty_name_becomes_default() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let implicit = session.create_script("send(1)").await.expect("script");
    let blank = session
        .create_script_with_options("send(2)", Some(ScriptOptions::new("")))
        .await
        .expect("script");

    assert_eq!(implicit.name(), DEFAULT_SCRIPT_NAME);
    assert_eq!(blank.name(), DEFAULT_SCRIPT_NAME);
    let names: Vec<String> = engine
        .created
        .lock()
        .unwrap()
        .iter()
        .map(|o| o.name().to_owned())
        .collect();
    assert_eq!(names, vec![DEFAULT_SCRIPT_NAME, DEFAULT_SCRIPT_NAME]);
}

#[tokio::test]
async fn explicit_options_reach_the_engine() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let script = session
        .create_script_with_options(
            "send(1)",
            Some(ScriptOptions::new("tracer").with_runtime(ScriptRuntime::Qjs)),
        )
        .await
        .expect("script");

    assert_eq!(script.name(), "tracer");
    assert_eq!(script.runtime(), ScriptRuntime::Qjs);
    let created = engine.created.lock().unwrap();
    assert_eq!(created[0].runtime(), ScriptRuntime::Qjs);
    assert!(created[0].snapshot().is_none());
}

#[tokio::test]
async fn snapshot_is_passed_through_untouched() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    session
        .create_script_with_snapshot("main()", vec![9_u8, 8, 7])
        .await
        .expect("script");

    let created = engine.created.lock().unwrap();
    assert_eq!(
        created[0].snapshot().map(|s| s.to_vec()),
        Some(vec![9, 8, 7])
    );
}

#[tokio::test]
async fn compiled_payload_round_trips_through_the_engine() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let payload = session
        .compile_script("send(1)", None)
        .await
        .expect("compile succeeds");
    let script = session
        .create_script_bytes(&payload, None)
        .await
        .expect("create from bytes succeeds");
    assert_eq!(script.name(), DEFAULT_SCRIPT_NAME);

    let err = session
        .create_script_bytes(b"garbage", None)
        .await
        .expect_err("payload rejected");
    assert!(matches!(err, AppError::Engine { .. }));
}

#[tokio::test]
async fn engine_errors_are_propagated_unchanged() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let failure = AppError::engine("syntax_error", "unexpected token at 1:5");
    engine.fail_next(failure.clone());

    let err = session
        .create_script("send(")
        .await
        .expect_err("engine failure surfaces");
    assert_eq!(err, failure);
    assert!(engine.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn script_release_happens_once() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let script = session.create_script("send(1)").await.expect("script");
    let id = script.id();

    script.release().expect("first release succeeds");
    assert!(script.is_released());
    assert_eq!(
        script.release(),
        Err(AppError::InvalidState("script already released".into()))
    );
    drop(script);
    assert_eq!(*engine.released_scripts.lock().unwrap(), vec![id]);
}

#[tokio::test]
async fn dropping_an_unreleased_script_frees_it() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let script = session.create_script("send(1)").await.expect("script");
    let id = script.id();

    drop(script);
    assert_eq!(*engine.released_scripts.lock().unwrap(), vec![id]);
}

// ── Child gating, peers, portals ────────────────────────────────────────────

#[tokio::test]
async fn child_gating_toggles_reach_the_engine() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    session.enable_child_gating().await.expect("enable");
    session.disable_child_gating().await.expect("disable");
    session.resume().await.expect("resume");

    assert_eq!(
        engine.log(),
        vec![
            "enable_child_gating:start",
            "enable_child_gating:end",
            "disable_child_gating:start",
            "disable_child_gating:end",
            "resume:start",
            "resume:end",
        ]
    );
}

#[tokio::test]
async fn peer_options_reach_the_engine() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let options = PeerOptions::new().with_stun_server("stun.example.com:3478");

    session
        .setup_peer_connection(&options)
        .await
        .expect("peer connection");
    assert_eq!(*engine.peers.lock().unwrap(), vec![options]);
}

#[tokio::test]
async fn portal_membership_terminates_once() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let membership = session
        .join_portal("portal.example.com:27052", &PortalOptions::new().with_token("s3cret"))
        .await
        .expect("join portal");
    assert_eq!(membership.address(), "portal.example.com:27052");
    assert!(!membership.is_terminated());

    membership
        .terminate(&Cancellable::new())
        .await
        .expect("terminate");
    assert!(membership.is_terminated());
    assert!(matches!(
        membership.terminate(&Cancellable::new()).await,
        Err(AppError::InvalidState(_))
    ));
    assert_eq!(*engine.terminated.lock().unwrap(), vec![membership.id()]);
}

#[tokio::test]
async fn concurrent_terminates_reach_the_engine_once() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let membership = session
        .join_portal("portal.example.com:27052", &PortalOptions::new())
        .await
        .expect("join portal");
    engine.set_call_delay(Duration::from_millis(50));

    let (first, second) = (Cancellable::new(), Cancellable::new());
    let (a, b) = tokio::join!(membership.terminate(&first), membership.terminate(&second));

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.contains(&Err(AppError::InvalidState(
        "portal membership already terminated".into()
    ))));
    assert_eq!(*engine.terminated.lock().unwrap(), vec![membership.id()]);
}

#[tokio::test]
async fn failed_terminate_can_be_retried() {
    let engine = StubEngine::new();
    let session = open_session(&engine);
    let membership = session
        .join_portal("portal.example.com:27052", &PortalOptions::new())
        .await
        .expect("join portal");

    engine.fail_next(AppError::engine("unreachable", "portal went away"));
    let err = membership
        .terminate(&Cancellable::new())
        .await
        .expect_err("engine failure surfaces");
    assert!(matches!(err, AppError::Engine { .. }));
    assert!(!membership.is_terminated());

    membership
        .terminate(&Cancellable::new())
        .await
        .expect("retry succeeds");
    assert!(membership.is_terminated());
    assert_eq!(*engine.terminated.lock().unwrap(), vec![membership.id()]);
}

#[tokio::test]
async fn empty_portal_address_is_rejected() {
    let engine = StubEngine::new();
    let session = open_session(&engine);

    let err = session
        .join_portal("  ", &PortalOptions::new())
        .await
        .expect_err("empty address rejected");
    assert!(matches!(err, AppError::InvalidArgument(_)));
    assert!(engine.log().is_empty());
}
