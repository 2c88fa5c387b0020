//! Runtime flavor and snapshot transport enumerations.

use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which scripting runtime variant executes a script.
///
/// A snapshot is only valid for the runtime it was captured under; the
/// engine, not this crate, reports a mismatch.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRuntime {
    /// Engine-chosen runtime.
    #[default]
    Default,
    /// Lightweight interpreter runtime.
    Qjs,
    /// JIT-compiling runtime.
    V8,
}

impl ScriptRuntime {
    /// Wire name of the runtime.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Qjs => "qjs",
            Self::V8 => "v8",
        }
    }
}

impl Display for ScriptRuntime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How snapshot bytes are physically delivered to the engine.
///
/// An optimization knob only: both variants produce the same script.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTransport {
    /// Bytes travel inline with the create-script request.
    #[default]
    Inline,
    /// Bytes are staged in shared memory and referenced by the request.
    SharedMemory,
}

impl SnapshotTransport {
    /// Wire name of the transport.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::SharedMemory => "shared_memory",
        }
    }
}

impl Display for SnapshotTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
