//! Control-channel implementation of [`InstrumentationEngine`].
//!
//! [`RemoteEngine`] talks to an out-of-process engine agent over any
//! bidirectional byte stream (TCP in the CLI, [`tokio::io::duplex`] in
//! tests). Two background tasks own the halves of the stream:
//!
//! - the writer drains an [`mpsc`] queue of encoded lines into the stream;
//! - the reader decodes responses and events. Responses complete the
//!   matching pending [`oneshot`] by id; `detached` events mark the session
//!   detached and fan out on that session's [`broadcast`] channel.
//!
//! When a caller's [`Cancellable`] fires, or the call future is dropped, the
//! pending entry is removed and a `cancel` notification is queued so the
//! agent can abandon the work; a late response for that id is discarded.
//!
//! When the stream closes, or an inbound line overruns the codec limit, the
//! channel is closed for good: every pending and later call fails with
//! [`AppError::Protocol`], every session reports detached, and every
//! subscribed session receives a `Detached { reason: ConnectionTerminated }`
//! event.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cancellable::Cancellable;
use crate::engine::codec::{EngineCodec, MAX_LINE_BYTES};
use crate::engine::protocol::{
    self, decode_bytes, decode_result, encode_bytes, method, script_options_params,
    snapshot_options_params, BytesResult, Inbound, MembershipResult, Request, ScriptResult,
    SessionResult,
};
use crate::engine::{
    EngineFuture, InstrumentationEngine, MembershipHandle, ScriptHandle, SessionHandle,
};
use crate::models::event::{DetachReason, SessionEvent};
use crate::models::peer::PeerOptions;
use crate::models::portal::PortalOptions;
use crate::models::script_options::ScriptOptions;
use crate::models::snapshot_options::SnapshotOptions;
use crate::{AppError, Result};

/// Outbound queue depth.
const OUTBOUND_CAPACITY: usize = 64;

/// Buffered events per session before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 16;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// State shared between the engine handle and its reader task.
#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<PendingMap>,
    detached: Mutex<HashSet<SessionHandle>>,
    channels: Mutex<HashMap<SessionHandle, broadcast::Sender<SessionEvent>>>,
    closed: AtomicBool,
}

impl Shared {
    fn channel(&self, session: SessionHandle) -> broadcast::Sender<SessionEvent> {
        lock(&self.channels)
            .entry(session)
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    fn deliver(&self, session: SessionHandle, event: SessionEvent) {
        if matches!(event, SessionEvent::Detached { .. }) {
            lock(&self.detached).insert(session);
        }
        // No receivers is not an error: nobody subscribed yet.
        let _ = self.channel(session).send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fail_all(&self, reason: &str) {
        // Set before draining: a call that registers after the drain sees it.
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (id, tx) in drained {
            debug!(id, "failing pending engine call");
            let _ = tx.send(Err(AppError::Protocol(reason.to_owned())));
        }

        let sessions: Vec<SessionHandle> = lock(&self.channels).keys().copied().collect();
        for session in sessions {
            if lock(&self.detached).contains(&session) {
                continue;
            }
            self.deliver(
                session,
                SessionEvent::detached(DetachReason::ConnectionTerminated, None),
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`InstrumentationEngine`] backed by an NDJSON control channel.
#[derive(Debug)]
pub struct RemoteEngine {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RemoteEngine {
    /// Connect to an engine agent listening on `endpoint` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the TCP connection cannot be established.
    pub async fn connect_tcp(endpoint: &str) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| AppError::Io(format!("cannot connect to engine at {endpoint}: {e}")))?;
        stream.set_nodelay(true)?;
        info!(endpoint, "connected to engine agent");
        Ok(Self::from_stream(stream))
    }

    /// Drive the control channel over an already-connected stream.
    ///
    /// Must be called inside a tokio runtime; spawns the reader and writer
    /// tasks.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with_line_limit(stream, MAX_LINE_BYTES)
    }

    /// [`from_stream`](Self::from_stream) with a custom inbound line limit.
    ///
    /// An inbound line longer than `max_line_bytes` closes the channel.
    pub fn from_stream_with_line_limit<S>(stream: S, max_line_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        tokio::spawn(
            run_writer(write_half, outbound_rx, shutdown.clone())
                .instrument(info_span!("engine_writer")),
        );
        tokio::spawn(
            run_reader(
                read_half,
                EngineCodec::with_max_length(max_line_bytes),
                Arc::clone(&shared),
                shutdown.clone(),
            )
            .instrument(info_span!("engine_reader")),
        );

        Self {
            shared,
            outbound,
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Attach to the process with the given pid.
    ///
    /// Attaching is the engine's job; this only forwards the request and
    /// returns the handle the agent allocated.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`] if the agent refuses, or
    /// [`AppError::Cancelled`] if `cancellable` fires first.
    pub async fn attach(&self, pid: u32, cancellable: &Cancellable) -> Result<SessionHandle> {
        let value = self
            .call(method::ATTACH, json!({ "pid": pid }), cancellable)
            .await?;
        let SessionResult { session } = decode_result(method::ATTACH, value)?;
        info!(pid, %session, "attached");
        Ok(session)
    }

    /// Stop the background tasks. Pending calls fail once the reader exits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    async fn call(&self, name: &str, params: Value, cancellable: &Cancellable) -> Result<Value> {
        cancellable.ensure_usable()?;
        if self.shared.is_closed() {
            return Err(channel_closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::call(id, name, params).to_line()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        // Dropping the guard before a response arrives (caller cancelled or
        // the future was dropped) withdraws the call on the agent side too.
        let mut guard = InFlight {
            engine: self,
            id,
            settled: false,
        };

        // The reader may have drained `pending` before the insert above.
        if self.shared.is_closed() {
            guard.withdraw();
            return Err(channel_closed());
        }

        debug!(id, method = name, "engine call");
        if self.outbound.send(line).await.is_err() {
            guard.withdraw();
            return Err(channel_closed());
        }

        tokio::select! {
            biased;
            () = cancellable.cancelled() => {
                debug!(id, method = name, "engine call cancelled");
                Err(AppError::Cancelled)
            }
            outcome = rx => {
                guard.settled = true;
                outcome.unwrap_or_else(|_| {
                    Err(AppError::Protocol("control channel closed before response".into()))
                })
            }
        }
    }

    async fn call_unit(
        &self,
        name: &str,
        session: SessionHandle,
        cancellable: &Cancellable,
    ) -> Result<()> {
        self.call(name, json!({ "session": session }), cancellable)
            .await
            .map(|_| ())
    }

    fn notify(&self, name: &str, params: Value) {
        match Request::notification(name, params).to_line() {
            Ok(line) => {
                if let Err(err) = self.outbound.try_send(line) {
                    warn!(method = name, %err, "failed to queue engine notification");
                }
            }
            Err(err) => warn!(method = name, %err, "failed to encode engine notification"),
        }
    }
}

/// Pending request that has been written but not yet answered.
struct InFlight<'a> {
    engine: &'a RemoteEngine,
    id: u64,
    settled: bool,
}

impl InFlight<'_> {
    /// Forget a call the agent never saw.
    fn withdraw(&mut self) {
        lock(&self.engine.shared.pending).remove(&self.id);
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        lock(&self.engine.shared.pending).remove(&self.id);
        self.engine
            .notify(method::CANCEL, json!({ "id": self.id }));
    }
}

impl Drop for RemoteEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl InstrumentationEngine for RemoteEngine {
    fn is_detached(&self, session: SessionHandle) -> bool {
        self.shared.is_closed() || lock(&self.shared.detached).contains(&session)
    }

    fn detach<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.call_unit(method::DETACH, session, cancellable).await?;
            lock(&self.shared.detached).insert(session);
            Ok(())
        })
    }

    fn resume<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.call_unit(method::RESUME, session, cancellable))
    }

    fn enable_child_gating<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.call_unit(method::ENABLE_CHILD_GATING, session, cancellable))
    }

    fn disable_child_gating<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.call_unit(method::DISABLE_CHILD_GATING, session, cancellable))
    }

    fn create_script<'a>(
        &'a self,
        session: SessionHandle,
        source: &'a str,
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle> {
        Box::pin(async move {
            let params = json!({
                "session": session,
                "source": source,
                "options": script_options_params(options),
            });
            let value = self
                .call(method::CREATE_SCRIPT, params, cancellable)
                .await?;
            let ScriptResult { script } = decode_result(method::CREATE_SCRIPT, value)?;
            Ok(script)
        })
    }

    fn create_script_from_bytes<'a>(
        &'a self,
        session: SessionHandle,
        payload: &'a [u8],
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle> {
        Box::pin(async move {
            let params = json!({
                "session": session,
                "bytes": encode_bytes(payload),
                "options": script_options_params(options),
            });
            let value = self
                .call(method::CREATE_SCRIPT_FROM_BYTES, params, cancellable)
                .await?;
            let ScriptResult { script } = decode_result(method::CREATE_SCRIPT_FROM_BYTES, value)?;
            Ok(script)
        })
    }

    fn compile_script<'a>(
        &'a self,
        session: SessionHandle,
        source: &'a str,
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes> {
        Box::pin(async move {
            let params = json!({
                "session": session,
                "source": source,
                "options": script_options_params(options),
            });
            let value = self
                .call(method::COMPILE_SCRIPT, params, cancellable)
                .await?;
            let BytesResult { bytes } = decode_result(method::COMPILE_SCRIPT, value)?;
            decode_bytes(&bytes)
        })
    }

    fn snapshot_script<'a>(
        &'a self,
        session: SessionHandle,
        embed_source: &'a str,
        options: &'a SnapshotOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes> {
        Box::pin(async move {
            let params = json!({
                "session": session,
                "embed_script": embed_source,
                "options": snapshot_options_params(options),
            });
            let value = self
                .call(method::SNAPSHOT_SCRIPT, params, cancellable)
                .await?;
            let BytesResult { bytes } = decode_result(method::SNAPSHOT_SCRIPT, value)?;
            decode_bytes(&bytes)
        })
    }

    fn setup_peer_connection<'a>(
        &'a self,
        session: SessionHandle,
        options: &'a PeerOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let params = json!({ "session": session, "options": options });
            self.call(method::SETUP_PEER_CONNECTION, params, cancellable)
                .await
                .map(|_| ())
        })
    }

    fn join_portal<'a>(
        &'a self,
        session: SessionHandle,
        address: &'a str,
        options: &'a PortalOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, MembershipHandle> {
        Box::pin(async move {
            let params = json!({ "session": session, "address": address, "options": options });
            let value = self.call(method::JOIN_PORTAL, params, cancellable).await?;
            let MembershipResult { membership } = decode_result(method::JOIN_PORTAL, value)?;
            Ok(membership)
        })
    }

    fn terminate_membership<'a>(
        &'a self,
        membership: MembershipHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let params = json!({ "membership": membership });
            self.call(method::TERMINATE_MEMBERSHIP, params, cancellable)
                .await
                .map(|_| ())
        })
    }

    fn subscribe(&self, session: SessionHandle) -> broadcast::Receiver<SessionEvent> {
        self.shared.channel(session).subscribe()
    }

    fn release_script(&self, script: ScriptHandle) {
        self.notify(method::RELEASE_SCRIPT, json!({ "script": script }));
    }

    fn release_session(&self, session: SessionHandle) {
        self.notify(method::RELEASE_SESSION, json!({ "session": session }));
        lock(&self.shared.channels).remove(&session);
        lock(&self.shared.detached).remove(&session);
    }
}

fn channel_closed() -> AppError {
    AppError::Protocol("control channel closed".into())
}

async fn run_writer<W>(write_half: W, mut rx: mpsc::Receiver<String>, shutdown: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(write_half, EngineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                debug!("engine writer: shutdown requested, stopping");
                break;
            }

            line = rx.recv() => {
                let Some(line) = line else {
                    debug!("engine writer: outbound queue closed, stopping");
                    break;
                };
                // A peer that stops reading must not pin the writer past shutdown.
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        debug!("engine writer: shutdown during write, stopping");
                        break;
                    }
                    sent = framed.send(line) => {
                        if let Err(err) = sent {
                            warn!(%err, "engine writer: write failed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn run_reader<R>(
    read_half: R,
    codec: EngineCodec,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(read_half, codec);

    let reason = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                debug!("engine reader: shutdown requested, stopping");
                break "engine client shut down";
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("engine reader: EOF");
                        break "control channel closed";
                    }
                    // The dropped line may have been a response; its caller
                    // would wait forever, so the channel cannot continue.
                    Some(Err(AppError::Protocol(msg))) => {
                        warn!(error = msg.as_str(), "engine reader: framing error, stopping");
                        break "control channel framing error";
                    }
                    Some(Err(err)) => {
                        warn!(%err, "engine reader: stream error, stopping");
                        break "control channel failed";
                    }
                    Some(Ok(line)) => dispatch_line(&shared, &line),
                }
            }
        }
    };

    shared.fail_all(reason);
}

fn dispatch_line(shared: &Shared, line: &str) {
    match protocol::parse_inbound_line(line) {
        Ok(Some(Inbound::Response { id, outcome })) => {
            let waiter = lock(&shared.pending).remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(id, "engine reader: response for unknown or cancelled call"),
            }
        }
        Ok(Some(Inbound::Event { session, event })) => {
            info!(%session, kind = %event.kind(), "engine event");
            shared.deliver(session, event);
        }
        Ok(None) => {}
        Err(err) => warn!(%err, raw_line = line, "engine reader: parse error, skipping line"),
    }
}
