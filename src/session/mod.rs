//! Attached instrumentation sessions.
//!
//! A [`Session`] mediates every interaction with one attached target:
//! lifecycle control (detach, resume, child gating), script creation and
//! compilation, warm-start snapshots, peer and portal connections, and
//! lifecycle event subscriptions.
//!
//! # Lifecycle rules
//!
//! - Once released, every operation fails with
//!   [`AppError::InvalidState`]`("session released")`.
//! - Once detached, every operation except [`Session::detach`] fails with
//!   [`AppError::InvalidState`]`("session detached")`. Detaching an already
//!   detached session succeeds without reaching the engine.
//!
//! # Concurrency
//!
//! Each session carries a reader/writer gate. [`Session::detach`] holds the
//! exclusive permit; every other blocking call holds a shared permit and may
//! run in parallel with its siblings. Permits are awaited under the call's
//! [`Cancellable`], so a cancelled caller is never stuck behind the gate.

mod membership;
mod script;
mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};

pub use membership::PortalMembership;
pub use script::Script;
pub use subscription::{Subscription, SubscriptionHandle};

use crate::cancellable::Cancellable;
use crate::engine::{EngineFuture, InstrumentationEngine, ScriptHandle, SessionHandle};
use crate::models::event::{SessionEvent, SessionEventKind};
use crate::models::peer::PeerOptions;
use crate::models::portal::PortalOptions;
use crate::models::script_options::ScriptOptions;
use crate::models::snapshot_options::SnapshotOptions;
use crate::{AppError, Result};

struct SessionInner {
    engine: Arc<dyn InstrumentationEngine>,
    handle: SessionHandle,
    released: AtomicBool,
    gate: RwLock<()>,
}

impl SessionInner {
    fn ensure_not_released(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(AppError::InvalidState("session released".into()));
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        self.ensure_not_released()?;
        if self.engine.is_detached(self.handle) {
            return Err(AppError::InvalidState("session detached".into()));
        }
        Ok(())
    }

    async fn detach(&self, cancellable: &Cancellable) -> Result<()> {
        self.ensure_not_released()?;
        cancellable
            .run(async {
                let _permit = self.gate.write().await;
                self.ensure_not_released()?;
                if self.engine.is_detached(self.handle) {
                    debug!(session = %self.handle, "session already detached");
                    return Ok(());
                }
                self.engine.detach(self.handle, cancellable).await?;
                info!(session = %self.handle, "session detached");
                Ok(())
            })
            .await
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            warn!(session = %self.handle, "session dropped without release");
            self.engine.release_session(self.handle);
        }
    }
}

/// Live attachment context to a target process.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap an engine-side session handle obtained from an attach call.
    #[must_use]
    pub fn new(engine: Arc<dyn InstrumentationEngine>, handle: SessionHandle) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine,
                handle,
                released: AtomicBool::new(false),
                gate: RwLock::new(()),
            }),
        }
    }

    /// Engine-side handle.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    /// Whether the session has detached. Asks the engine every time.
    ///
    /// A released session reports `true`.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.is_released() || self.inner.engine.is_detached(self.inner.handle)
    }

    /// Whether [`release`](Self::release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// End the attachment and wait for the engine to confirm.
    ///
    /// Idempotent: detaching a detached session returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Cancelled`] if `cancellable` fires before completion.
    /// - [`AppError::InvalidState`] if the session or token was released.
    /// - [`AppError::Engine`] for engine-reported failures.
    pub async fn detach(&self, cancellable: &Cancellable) -> Result<()> {
        self.inner.detach(cancellable).await
    }

    /// [`detach`](Self::detach) with a deadline, using a fresh token.
    ///
    /// # Errors
    ///
    /// See [`detach_within`](Self::detach_within).
    pub async fn detach_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.detach_within(timeout, &Cancellable::new()).await
    }

    /// Run [`detach`](Self::detach) on its own task and race it against
    /// `timeout`.
    ///
    /// Exactly one outcome is reported:
    ///
    /// - the deadline fires first: `cancellable` is cancelled then released,
    ///   and [`AppError::DeadlineExceeded`] is returned;
    /// - detach succeeds: `cancellable` is released and `Ok(())` returned;
    /// - detach fails: `cancellable` is released and the failure returned.
    ///
    /// # Errors
    ///
    /// As described above.
    pub async fn detach_within(
        &self,
        timeout: Duration,
        cancellable: &Cancellable,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let token = cancellable.clone();
        let mut task = tokio::spawn(
            async move { inner.detach(&token).await }
                .instrument(info_span!("detach", session = %self.inner.handle)),
        );

        tokio::select! {
            biased;

            joined = &mut task => {
                let outcome = joined.unwrap_or_else(|err| {
                    Err(AppError::InvalidState(format!("detach task failed: {err}")))
                });
                if let Err(err) = cancellable.release() {
                    debug!(%err, "detach cancellable was released early");
                }
                outcome
            }

            () = tokio::time::sleep(timeout) => {
                cancellable.cancel();
                if let Err(err) = cancellable.release() {
                    debug!(%err, "detach cancellable was released early");
                }
                warn!(session = %self.inner.handle, ?timeout, "detach deadline exceeded");
                Err(AppError::DeadlineExceeded(format!(
                    "detach did not complete within {timeout:?}"
                )))
            }
        }
    }

    /// Resume a spawned, suspended target.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn resume(&self) -> Result<()> {
        let cancellable = Cancellable::new();
        let call = self.inner.engine.resume(self.inner.handle, &cancellable);
        self.shared_call(&cancellable, call).await
    }

    /// Start intercepting child-process creation by the target.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn enable_child_gating(&self) -> Result<()> {
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .enable_child_gating(self.inner.handle, &cancellable);
        self.shared_call(&cancellable, call).await?;
        info!(session = %self.inner.handle, "child gating enabled");
        Ok(())
    }

    /// Stop intercepting child-process creation by the target.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn disable_child_gating(&self) -> Result<()> {
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .disable_child_gating(self.inner.handle, &cancellable);
        self.shared_call(&cancellable, call).await?;
        info!(session = %self.inner.handle, "child gating disabled");
        Ok(())
    }

    /// Create a script from source with default options.
    ///
    /// # Errors
    ///
    /// See [`create_script_with_options`](Self::create_script_with_options).
    pub async fn create_script(&self, source: &str) -> Result<Script> {
        self.create_script_with_options(source, None).await
    }

    /// Compile and instantiate `source` inside the target.
    ///
    /// Missing options are synthesized; an empty name is replaced with
    /// [`DEFAULT_SCRIPT_NAME`](crate::models::script_options::DEFAULT_SCRIPT_NAME).
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error (syntax error, unreachable target, ...).
    pub async fn create_script_with_options(
        &self,
        source: &str,
        options: Option<ScriptOptions>,
    ) -> Result<Script> {
        let options = prepare(options);
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .create_script(self.inner.handle, source, &options, &cancellable);
        let handle = self.shared_call(&cancellable, call).await?;
        debug!(
            session = %self.inner.handle,
            script = %handle,
            name = options.name(),
            "script created"
        );
        Ok(self.script(handle, &options))
    }

    /// Instantiate a script from a payload produced by [`compile_script`](Self::compile_script).
    ///
    /// # Errors
    ///
    /// Same as [`create_script_with_options`](Self::create_script_with_options).
    pub async fn create_script_bytes(
        &self,
        payload: &[u8],
        options: Option<ScriptOptions>,
    ) -> Result<Script> {
        let options = prepare(options);
        let cancellable = Cancellable::new();
        let call = self.inner.engine.create_script_from_bytes(
            self.inner.handle,
            payload,
            &options,
            &cancellable,
        );
        let handle = self.shared_call(&cancellable, call).await?;
        debug!(
            session = %self.inner.handle,
            script = %handle,
            name = options.name(),
            "script created from bytes"
        );
        Ok(self.script(handle, &options))
    }

    /// Create a script that warm-starts from `snapshot`.
    ///
    /// # Errors
    ///
    /// Same as [`create_script_with_options`](Self::create_script_with_options).
    pub async fn create_script_with_snapshot(
        &self,
        source: &str,
        snapshot: impl Into<Bytes>,
    ) -> Result<Script> {
        let options = ScriptOptions::default().with_snapshot(snapshot);
        self.create_script_with_options(source, Some(options)).await
    }

    /// Compile `source` into a portable payload for [`create_script_bytes`](Self::create_script_bytes).
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn compile_script(
        &self,
        source: &str,
        options: Option<ScriptOptions>,
    ) -> Result<Bytes> {
        let options = prepare(options);
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .compile_script(self.inner.handle, source, &options, &cancellable);
        let bytes = self.shared_call(&cancellable, call).await?;
        debug!(session = %self.inner.handle, size = bytes.len(), "script compiled");
        Ok(bytes)
    }

    /// Run `embed_source` and the warmup script of `options` in an ephemeral
    /// context and return the serialized heap.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn snapshot_script(
        &self,
        embed_source: &str,
        options: &SnapshotOptions,
    ) -> Result<Bytes> {
        let cancellable = Cancellable::new();
        let call = self.inner.engine.snapshot_script(
            self.inner.handle,
            embed_source,
            options,
            &cancellable,
        );
        let bytes = self.shared_call(&cancellable, call).await?;
        info!(
            session = %self.inner.handle,
            runtime = %options.runtime(),
            size = bytes.len(),
            "snapshot captured"
        );
        Ok(bytes)
    }

    /// Establish a direct peer-to-peer transport for this session.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn setup_peer_connection(&self, options: &PeerOptions) -> Result<()> {
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .setup_peer_connection(self.inner.handle, options, &cancellable);
        self.shared_call(&cancellable, call).await?;
        info!(session = %self.inner.handle, "peer connection established");
        Ok(())
    }

    /// Join the coordination portal at `address`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] for an empty address,
    /// [`AppError::InvalidState`] on a detached or released session, otherwise
    /// the engine's error.
    pub async fn join_portal(
        &self,
        address: &str,
        options: &PortalOptions,
    ) -> Result<PortalMembership> {
        if address.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "portal address must not be empty".into(),
            ));
        }
        let cancellable = Cancellable::new();
        let call = self
            .inner
            .engine
            .join_portal(self.inner.handle, address, options, &cancellable);
        let membership = self.shared_call(&cancellable, call).await?;
        info!(session = %self.inner.handle, %membership, address, "joined portal");
        Ok(PortalMembership::new(
            Arc::clone(&self.inner.engine),
            membership,
            address.to_owned(),
        ))
    }

    /// Pull-based stream of this session's lifecycle events.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] on a released session.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.inner.ensure_not_released()?;
        let rx = self.inner.engine.subscribe(self.inner.handle);
        Ok(Subscription::new(self.inner.handle, rx))
    }

    /// Call `handler` on a dedicated task for every event named `event`.
    ///
    /// The only event currently defined is `"detached"`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] for an unknown event name,
    /// [`AppError::InvalidState`] on a released session.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let kind: SessionEventKind = event.parse()?;
        let subscription = self.subscribe()?;
        Ok(SubscriptionHandle::spawn(subscription, kind, handler))
    }

    /// Free the engine-side handle.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] if already released, or if a blocking call
    /// is still in flight.
    pub fn release(&self) -> Result<()> {
        let Ok(_permit) = self.inner.gate.try_write() else {
            return Err(AppError::InvalidState(
                "session has operations in flight".into(),
            ));
        };
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(AppError::InvalidState("session already released".into()));
        }
        self.inner.engine.release_session(self.inner.handle);
        info!(session = %self.inner.handle, "session released");
        Ok(())
    }

    /// Run one non-detach engine call under a shared permit, racing the
    /// call-scoped token, then release the token.
    async fn shared_call<T>(
        &self,
        cancellable: &Cancellable,
        call: EngineFuture<'_, T>,
    ) -> Result<T> {
        let outcome = async {
            self.inner.ensure_live()?;
            cancellable
                .run(async {
                    let _permit = self.inner.gate.read().await;
                    self.inner.ensure_live()?;
                    call.await
                })
                .await
        }
        .await;
        if let Err(err) = cancellable.release() {
            debug!(%err, "call cancellable was released early");
        }
        outcome
    }

    fn script(&self, handle: ScriptHandle, options: &ScriptOptions) -> Script {
        Script::new(
            Arc::clone(&self.inner.engine),
            handle,
            options.name().to_owned(),
            options.runtime(),
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.handle)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

fn prepare(options: Option<ScriptOptions>) -> ScriptOptions {
    let mut options = options.unwrap_or_default();
    options.ensure_name();
    options
}
