//! Cooperative cancellation for blocking engine calls.
//!
//! A [`Cancellable`] guards one in-flight operation. It moves one way from
//! `Active` to either `Cancelled` or `Released`:
//!
//! - [`Cancellable::cancel`] may be called from any task, any number of times.
//!   Every call racing the token through [`Cancellable::run`] returns
//!   [`AppError::Cancelled`] promptly instead of waiting for the engine.
//! - [`Cancellable::release`] frees the token once the guarded operation has
//!   completed. It succeeds exactly once.
//!
//! Clones share state, so one clone can be handed to a spawned task while
//! the caller keeps another for cancelling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, Result};

/// Observable lifecycle state of a [`Cancellable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellableState {
    /// Guarding an operation; neither cancelled nor released.
    Active,
    /// Cancellation was requested. Sticky: a later release keeps this state.
    Cancelled,
    /// Released without ever being cancelled.
    Released,
}

#[derive(Debug, Default)]
struct Inner {
    token: CancellationToken,
    released: AtomicBool,
}

/// Shared cancellation handle for a single engine operation.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    inner: Arc<Inner>,
}

impl Cancellable {
    /// Create a new active token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; a no-op once released.
    pub fn cancel(&self) {
        if self.is_released() {
            debug!("cancel requested on a released cancellable, ignoring");
            return;
        }
        self.inner.token.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether [`release`](Self::release) has succeeded.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CancellableState {
        if self.is_cancelled() {
            CancellableState::Cancelled
        } else if self.is_released() {
            CancellableState::Released
        } else {
            CancellableState::Active
        }
    }

    /// Release the token after the guarded operation completed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidState`] if the token was already released.
    pub fn release(&self) -> Result<()> {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(AppError::InvalidState(
                "cancellable already released".into(),
            ));
        }
        Ok(())
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Underlying token, for engines that propagate cancellation natively.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Check the token can still guard a new call.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidState`] if released, or
    /// [`AppError::Cancelled`] if cancellation was already requested.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_released() {
            return Err(AppError::InvalidState(
                "cancellable has been released".into(),
            ));
        }
        if self.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Race `fut` against cancellation of this token.
    ///
    /// Cancellation wins ties, so a token cancelled before the call starts
    /// never lets `fut` run.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cancelled`] when the token fires first, otherwise
    /// whatever `fut` returns.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_usable()?;
        tokio::select! {
            biased;
            () = self.cancelled() => Err(AppError::Cancelled),
            result = fut => result,
        }
    }
}
