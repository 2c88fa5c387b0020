//! Instrumentation engine abstraction.
//!
//! The [`InstrumentationEngine`] trait is the seam between this crate's
//! session bookkeeping and the engine that actually injects into target
//! processes. Everything behind the trait is opaque here; the crate only
//! sequences calls and enforces lifecycle rules around them.
//!
//! [`remote::RemoteEngine`] drives an out-of-process engine agent over a
//! newline-delimited JSON control channel.

pub mod codec;
pub mod protocol;
pub mod remote;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cancellable::Cancellable;
use crate::models::event::SessionEvent;
use crate::models::peer::PeerOptions;
use crate::models::portal::PortalOptions;
use crate::models::script_options::ScriptOptions;
use crate::models::snapshot_options::SnapshotOptions;
use crate::Result;

/// Boxed future returned by every blocking engine call.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

opaque_handle!(
    /// Engine-side identifier of an attachment context.
    SessionHandle,
    "session"
);
opaque_handle!(
    /// Engine-side identifier of an instantiated script.
    ScriptHandle,
    "script"
);
opaque_handle!(
    /// Engine-side identifier of a portal membership.
    MembershipHandle,
    "membership"
);

/// Calls the crate makes into an instrumentation engine.
///
/// Every async method is a suspension point that may block for a long time
/// on the engine side. Implementations should honour the supplied
/// [`Cancellable`] where they can; callers in [`crate::session`] race each
/// call against it regardless, so an engine that ignores it still cannot
/// delay a cancelled caller.
///
/// Failures reported by the engine must be mapped to
/// [`AppError::Engine`](crate::AppError::Engine).
pub trait InstrumentationEngine: Send + Sync {
    /// Non-blocking query of whether `session` has detached.
    fn is_detached(&self, session: SessionHandle) -> bool;

    /// End the attachment. Resolves once the engine confirms.
    fn detach<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Resume a spawned, suspended target.
    fn resume<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Start intercepting child-process creation by the target.
    fn enable_child_gating<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Stop intercepting child-process creation by the target.
    fn disable_child_gating<'a>(
        &'a self,
        session: SessionHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Compile and instantiate `source` inside the target.
    ///
    /// `options` always carries a non-empty name.
    fn create_script<'a>(
        &'a self,
        session: SessionHandle,
        source: &'a str,
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle>;

    /// Instantiate a script from a payload produced by [`compile_script`](Self::compile_script).
    fn create_script_from_bytes<'a>(
        &'a self,
        session: SessionHandle,
        payload: &'a [u8],
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ScriptHandle>;

    /// Compile `source` without instantiating it.
    fn compile_script<'a>(
        &'a self,
        session: SessionHandle,
        source: &'a str,
        options: &'a ScriptOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes>;

    /// Evaluate `embed_source` then the warmup script of `options` in an
    /// ephemeral context and serialize the resulting heap.
    fn snapshot_script<'a>(
        &'a self,
        session: SessionHandle,
        embed_source: &'a str,
        options: &'a SnapshotOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, Bytes>;

    /// Establish a direct peer-to-peer transport for the session.
    fn setup_peer_connection<'a>(
        &'a self,
        session: SessionHandle,
        options: &'a PeerOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Join the portal listening at `address`.
    fn join_portal<'a>(
        &'a self,
        session: SessionHandle,
        address: &'a str,
        options: &'a PortalOptions,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, MembershipHandle>;

    /// Leave a portal joined with [`join_portal`](Self::join_portal).
    fn terminate_membership<'a>(
        &'a self,
        membership: MembershipHandle,
        cancellable: &'a Cancellable,
    ) -> EngineFuture<'a, ()>;

    /// Stream of lifecycle events for `session`.
    fn subscribe(&self, session: SessionHandle) -> broadcast::Receiver<SessionEvent>;

    /// Free the engine resources behind a script handle.
    fn release_script(&self, script: ScriptHandle);

    /// Free the engine resources behind a session handle.
    fn release_session(&self, session: SessionHandle);
}
