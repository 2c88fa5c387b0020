//! Options for capturing a warm-start snapshot.

use crate::models::runtime::ScriptRuntime;

/// Warmup script and runtime used to build a snapshot.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotOptions {
    warmup_script: String,
    runtime: ScriptRuntime,
}

impl SnapshotOptions {
    /// Create options from a warmup script and the runtime it targets.
    #[must_use]
    pub fn new(warmup_script: impl Into<String>, runtime: ScriptRuntime) -> Self {
        Self {
            warmup_script: warmup_script.into(),
            runtime,
        }
    }

    /// Source executed to build the captured heap state.
    #[must_use]
    pub fn warmup_script(&self) -> &str {
        &self.warmup_script
    }

    /// Runtime the snapshot is captured under.
    #[must_use]
    pub fn runtime(&self) -> ScriptRuntime {
        self.runtime
    }
}
