//! Shared test helpers for session-level integration tests.
//!
//! [`StubEngine`] is an in-process [`InstrumentationEngine`] with a toy heap:
//! running a warmup bumps [`StubEngine::warmup_runs`], and the snapshot it
//! returns encodes the sources it was captured from. A script created without
//! a snapshot runs its warmup inline; one created from a snapshot restores
//! the heap image instead, which is what lets the tests observe warm starts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use probe_session::engine::{
    EngineFuture, InstrumentationEngine, MembershipHandle, ScriptHandle, SessionHandle,
};
use probe_session::models::event::{Crash, DetachReason, SessionEvent};
use probe_session::models::peer::PeerOptions;
use probe_session::models::portal::PortalOptions;
use probe_session::models::script_options::ScriptOptions;
use probe_session::models::snapshot_options::SnapshotOptions;
use probe_session::{AppError, Cancellable, Result, Session};

/// In-process engine double.
#[derive(Default)]
pub struct StubEngine {
    next_handle: AtomicU64,
    detached: Mutex<HashSet<SessionHandle>>,
    channels: Mutex<HashMap<SessionHandle, broadcast::Sender<SessionEvent>>>,
    detach_delay: Mutex<Duration>,
    call_delay: Mutex<Duration>,
    fail_next: Mutex<Option<AppError>>,
    in_flight: AtomicUsize,

    /// Number of warmups executed, by snapshot capture or cold script start.
    pub warmup_runs: AtomicUsize,
    /// Heap images restored by warm script starts, in order.
    pub restored: Mutex<Vec<Bytes>>,
    /// Number of detach requests that reached the engine.
    pub detach_calls: AtomicUsize,
    /// Highest number of calls observed running at once.
    pub peak_in_flight: AtomicUsize,
    /// Options of every script created, in order.
    pub created: Mutex<Vec<ScriptOptions>>,
    /// Ordered `op:start` / `op:end` markers.
    pub log: Mutex<Vec<String>>,
    /// Released script handles.
    pub released_scripts: Mutex<Vec<ScriptHandle>>,
    /// Released session handles.
    pub released_sessions: Mutex<Vec<SessionHandle>>,
    /// Terminated portal memberships.
    pub terminated: Mutex<Vec<MembershipHandle>>,
    /// Peer options received.
    pub peers: Mutex<Vec<PeerOptions>>,
}

impl StubEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh engine-side session.
    pub fn attach(&self) -> SessionHandle {
        SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn set_detach_delay(&self, delay: Duration) {
        *self.detach_delay.lock().unwrap() = delay;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    /// Make the next engine call fail with `err`.
    pub fn fail_next(&self, err: AppError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Simulate an engine-initiated detach, as when the target exits.
    pub fn emit_detached(
        &self,
        session: SessionHandle,
        reason: DetachReason,
        crash: Option<Crash>,
    ) {
        self.detached.lock().unwrap().insert(session);
        let _ = self
            .channel(session)
            .send(SessionEvent::detached(reason, crash));
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn channel(&self, session: SessionHandle) -> broadcast::Sender<SessionEvent> {
        self.channels
            .lock()
            .unwrap()
            .entry(session)
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_failure(&self) -> Result<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run the body of a slow call: log, track concurrency, sleep.
    async fn work(&self, op: &str, delay: Duration) -> Result<()> {
        self.take_failure()?;
        self.log.lock().unwrap().push(format!("{op}:start"));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("{op}:end"));
        Ok(())
    }

    async fn call(&self, op: &str) -> Result<()> {
        let delay = *self.call_delay.lock().unwrap();
        self.work(op, delay).await
    }
}

/// Toy heap serialization: what the warmup left behind.
pub fn heap_image(embed_source: &str, options: &SnapshotOptions) -> Bytes {
    Bytes::from(format!(
        "heap[{}]{embed_source}|{}",
        options.runtime(),
        options.warmup_script()
    ))
}

impl InstrumentationEngine for StubEngine {
    fn is_detached(&self, session: SessionHandle) -> bool {
        self.detached.lock().unwrap().contains(&session)
    }

    fn detach<'a>(&'a self, session: SessionHandle, _: &'a Cancellable) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.detach_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.detach_delay.lock().unwrap();
            self.work("detach", delay).await?;
            self.emit_detached(session, DetachReason::ApplicationRequested, None);
            Ok(())
        })
    }

    fn resume<'a>(&'a self, _: SessionHandle, _: &'a Cancellable) -> EngineFuture<'a, ()> {
        Box::pin(self.call("resume"))
    }

    fn enable_child_gating<'a>(
        &'a self,
        _: SessionHandle,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.call("enable_child_gating"))
    }

    fn disable_child_gating<'a>(
        &'a self,
        _: SessionHandle,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.call("disable_child_gating"))
    }

    fn create_script<'a>(
        &'a self,
        _: SessionHandle,
        _source: &'a str,
        options: &'a ScriptOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle> {
        Box::pin(async move {
            self.call("create_script").await?;
            match options.snapshot() {
                Some(image) => self.restored.lock().unwrap().push(image.clone()),
                None => {
                    self.warmup_runs.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.created.lock().unwrap().push(options.clone());
            Ok(ScriptHandle(self.next_id()))
        })
    }

    fn create_script_from_bytes<'a>(
        &'a self,
        _: SessionHandle,
        payload: &'a [u8],
        options: &'a ScriptOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle> {
        Box::pin(async move {
            self.call("create_script_from_bytes").await?;
            if !payload.starts_with(b"compiled:") {
                return Err(AppError::engine("invalid_argument", "not a compiled payload"));
            }
            self.created.lock().unwrap().push(options.clone());
            Ok(ScriptHandle(self.next_id()))
        })
    }

    fn compile_script<'a>(
        &'a self,
        _: SessionHandle,
        source: &'a str,
        _: &'a ScriptOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes> {
        Box::pin(async move {
            self.call("compile_script").await?;
            Ok(Bytes::from(format!("compiled:{source}")))
        })
    }

    fn snapshot_script<'a>(
        &'a self,
        _: SessionHandle,
        embed_source: &'a str,
        options: &'a SnapshotOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes> {
        Box::pin(async move {
            self.call("snapshot_script").await?;
            self.warmup_runs.fetch_add(1, Ordering::SeqCst);
            Ok(heap_image(embed_source, options))
        })
    }

    fn setup_peer_connection<'a>(
        &'a self,
        _: SessionHandle,
        options: &'a PeerOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.call("setup_peer_connection").await?;
            self.peers.lock().unwrap().push(options.clone());
            Ok(())
        })
    }

    fn join_portal<'a>(
        &'a self,
        _: SessionHandle,
        _address: &'a str,
        _: &'a PortalOptions,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, MembershipHandle> {
        Box::pin(async move {
            self.call("join_portal").await?;
            Ok(MembershipHandle(self.next_id()))
        })
    }

    fn terminate_membership<'a>(
        &'a self,
        membership: MembershipHandle,
        _: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.call("terminate_membership").await?;
            self.terminated.lock().unwrap().push(membership);
            Ok(())
        })
    }

    fn subscribe(&self, session: SessionHandle) -> broadcast::Receiver<SessionEvent> {
        self.channel(session).subscribe()
    }

    fn release_script(&self, script: ScriptHandle) {
        self.released_scripts.lock().unwrap().push(script);
    }

    fn release_session(&self, session: SessionHandle) {
        self.released_sessions.lock().unwrap().push(session);
        self.channels.lock().unwrap().remove(&session);
        self.detached.lock().unwrap().remove(&session);
    }
}

/// Attach a new session on `engine`.
pub fn open_session(engine: &Arc<StubEngine>) -> Session {
    Session::new(engine.clone(), engine.attach())
}

/// Sample crash payload.
pub fn sample_crash(pid: u32) -> Crash {
    Crash {
        pid,
        process_name: "target".into(),
        summary: "SIGSEGV at 0x0".into(),
        report: "thread 0 crashed".into(),
        parameters: std::collections::BTreeMap::new(),
    }
}
