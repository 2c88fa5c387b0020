//! Handle to a script instantiated inside a target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{InstrumentationEngine, ScriptHandle};
use crate::models::runtime::ScriptRuntime;
use crate::{AppError, Result};

/// A running instrumentation script.
///
/// Owns its engine-side handle: [`release`](Self::release) frees it exactly
/// once. Dropping an unreleased script frees it as a last resort and logs a
/// warning.
pub struct Script {
    engine: Arc<dyn InstrumentationEngine>,
    handle: ScriptHandle,
    name: String,
    runtime: ScriptRuntime,
    released: AtomicBool,
}

impl Script {
    pub(crate) fn new(
        engine: Arc<dyn InstrumentationEngine>,
        handle: ScriptHandle,
        name: String,
        runtime: ScriptRuntime,
    ) -> Self {
        Self {
            engine,
            handle,
            name,
            runtime,
            released: AtomicBool::new(false),
        }
    }

    /// Engine-side handle.
    #[must_use]
    pub fn id(&self) -> ScriptHandle {
        self.handle
    }

    /// Name the script was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime flavor the script was created with.
    #[must_use]
    pub fn runtime(&self) -> ScriptRuntime {
        self.runtime
    }

    /// Whether [`release`](Self::release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Free the engine-side handle.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidState`] if the script was already released.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(AppError::InvalidState("script already released".into()));
        }
        self.engine.release_script(self.handle);
        debug!(script = %self.handle, name = self.name, "script released");
        Ok(())
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("runtime", &self.runtime)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            warn!(script = %self.handle, name = self.name, "script dropped without release");
            self.engine.release_script(self.handle);
        }
    }
}
