//! Script instantiation options.

use bytes::Bytes;

use crate::models::runtime::{ScriptRuntime, SnapshotTransport};

/// Name given to scripts whose options carry no (or an empty) name.
pub const DEFAULT_SCRIPT_NAME: &str = "probe-session";

/// Configuration bundle controlling how a script is instantiated.
///
/// Freely mutable until handed to a script-creation call, which only reads
/// it. The snapshot is held as [`Bytes`], so the blob stays alive and
/// unmoved for as long as any call borrowing these options is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOptions {
    name: String,
    runtime: ScriptRuntime,
    snapshot: Option<Bytes>,
    snapshot_transport: SnapshotTransport,
}

impl ScriptOptions {
    /// Create options with the given script name and default everything else.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime: ScriptRuntime::default(),
            snapshot: None,
            snapshot_transport: SnapshotTransport::default(),
        }
    }

    /// Script name; may be empty until a default is substituted.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the script name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Runtime flavor the script will execute under.
    #[must_use]
    pub fn runtime(&self) -> ScriptRuntime {
        self.runtime
    }

    /// Select the runtime flavor.
    pub fn set_runtime(&mut self, runtime: ScriptRuntime) {
        self.runtime = runtime;
    }

    /// Snapshot to warm-start from, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Bytes> {
        self.snapshot.as_ref()
    }

    /// Take ownership of a snapshot blob.
    pub fn set_snapshot(&mut self, snapshot: impl Into<Bytes>) {
        self.snapshot = Some(snapshot.into());
    }

    /// Drop any previously set snapshot.
    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// Delivery mode for the snapshot payload.
    #[must_use]
    pub fn snapshot_transport(&self) -> SnapshotTransport {
        self.snapshot_transport
    }

    /// Select the delivery mode for the snapshot payload.
    pub fn set_snapshot_transport(&mut self, transport: SnapshotTransport) {
        self.snapshot_transport = transport;
    }

    /// Builder form of [`set_runtime`](Self::set_runtime).
    #[must_use]
    pub fn with_runtime(mut self, runtime: ScriptRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Builder form of [`set_snapshot`](Self::set_snapshot).
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: impl Into<Bytes>) -> Self {
        self.set_snapshot(snapshot);
        self
    }

    /// Builder form of [`set_snapshot_transport`](Self::set_snapshot_transport).
    #[must_use]
    pub fn with_snapshot_transport(mut self, transport: SnapshotTransport) -> Self {
        self.snapshot_transport = transport;
        self
    }

    /// Substitute [`DEFAULT_SCRIPT_NAME`] when the name is empty.
    pub(crate) fn ensure_name(&mut self) {
        if self.name.is_empty() {
            self.name = DEFAULT_SCRIPT_NAME.to_owned();
        }
    }
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_NAME)
    }
}
