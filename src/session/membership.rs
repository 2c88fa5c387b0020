//! Handle to a portal membership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::cancellable::Cancellable;
use crate::engine::{InstrumentationEngine, MembershipHandle};
use crate::{AppError, Result};

/// Membership of a session in a coordination portal.
pub struct PortalMembership {
    engine: Arc<dyn InstrumentationEngine>,
    handle: MembershipHandle,
    address: String,
    terminated: AtomicBool,
}

impl PortalMembership {
    pub(crate) fn new(
        engine: Arc<dyn InstrumentationEngine>,
        handle: MembershipHandle,
        address: String,
    ) -> Self {
        Self {
            engine,
            handle,
            address,
            terminated: AtomicBool::new(false),
        }
    }

    /// Engine-side handle.
    #[must_use]
    pub fn id(&self) -> MembershipHandle {
        self.handle
    }

    /// Portal address this membership was joined at.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether [`terminate`](Self::terminate) has succeeded or is in flight.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Leave the portal.
    ///
    /// Only one caller reaches the engine; a failed attempt can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidState`] if already terminated or another
    /// termination is in flight, [`AppError::Cancelled`] if `cancellable`
    /// fires, or the engine's error.
    pub async fn terminate(&self, cancellable: &Cancellable) -> Result<()> {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::InvalidState(
                "portal membership already terminated".into(),
            ));
        }
        let outcome = cancellable
            .run(self.engine.terminate_membership(self.handle, cancellable))
            .await;
        if let Err(err) = outcome {
            self.terminated.store(false, Ordering::Release);
            return Err(err);
        }
        info!(membership = %self.handle, address = self.address, "left portal");
        Ok(())
    }
}

impl std::fmt::Debug for PortalMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalMembership")
            .field("handle", &self.handle)
            .field("address", &self.address)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
