//! Asynchronous session lifecycle events.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Why a session ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The host asked for the detach.
    ApplicationRequested,
    /// The target replaced its image (e.g. `exec`).
    ProcessReplaced,
    /// The target process died.
    ProcessTerminated,
    /// The control connection to the engine dropped.
    ConnectionTerminated,
    /// The device hosting the target went away.
    DeviceLost,
}

impl DetachReason {
    /// Whether a crash report may accompany this reason.
    #[must_use]
    pub fn is_crash_related(self) -> bool {
        matches!(self, Self::ProcessTerminated)
    }
}

/// Crash report delivered with a crash-related detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    /// Process id of the crashed target.
    pub pid: u32,
    /// Process name of the crashed target.
    pub process_name: String,
    /// One-line summary.
    pub summary: String,
    /// Full human-readable report.
    pub report: String,
    /// Extra engine-supplied key/value details.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Event names a session can be subscribed to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionEventKind {
    /// `"detached"`.
    Detached,
}

impl SessionEventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
        }
    }
}

impl Display for SessionEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEventKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detached" => Ok(Self::Detached),
            other => Err(AppError::InvalidArgument(format!(
                "unknown session event '{other}'"
            ))),
        }
    }
}

/// Typed session event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended.
    Detached {
        /// Why it ended.
        reason: DetachReason,
        /// Crash report; only present for crash-related reasons.
        crash: Option<Crash>,
    },
}

impl SessionEvent {
    /// Build a detached event, discarding `crash` unless `reason` is crash-related.
    #[must_use]
    pub fn detached(reason: DetachReason, crash: Option<Crash>) -> Self {
        Self::Detached {
            reason,
            crash: crash.filter(|_| reason.is_crash_related()),
        }
    }

    /// Kind of this event.
    #[must_use]
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Detached { .. } => SessionEventKind::Detached,
        }
    }
}
