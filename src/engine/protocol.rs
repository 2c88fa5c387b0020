//! Wire envelopes for the engine control channel.
//!
//! Every message is one JSON object per line.
//!
//! | Direction       | Shape                                                   |
//! |-----------------|---------------------------------------------------------|
//! | client → engine | `{"id": n, "method": "...", "params": {...}}`           |
//! | client → engine | `{"method": "cancel", "params": {"id": n}}` (no reply)  |
//! | engine → client | `{"id": n, "result": ...}`                              |
//! | engine → client | `{"id": n, "error": {"code": "...", "message": "..."}}` |
//! | engine → client | `{"event": "detached", "session": s, "params": {...}}`  |
//!
//! Byte payloads (compiled scripts, snapshots) are standard base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::SessionHandle;
use crate::models::event::{Crash, DetachReason, SessionEvent};
use crate::models::script_options::ScriptOptions;
use crate::models::snapshot_options::SnapshotOptions;
use crate::{AppError, Result};

/// Method names understood by the engine agent.
pub mod method {
    /// Attach to a process by pid.
    pub const ATTACH: &str = "attach";
    /// Cancel an in-flight request (notification).
    pub const CANCEL: &str = "cancel";
    /// End an attachment.
    pub const DETACH: &str = "session.detach";
    /// Resume a suspended target.
    pub const RESUME: &str = "session.resume";
    /// Enable child gating.
    pub const ENABLE_CHILD_GATING: &str = "session.enable_child_gating";
    /// Disable child gating.
    pub const DISABLE_CHILD_GATING: &str = "session.disable_child_gating";
    /// Create a script from source.
    pub const CREATE_SCRIPT: &str = "session.create_script";
    /// Create a script from a compiled payload.
    pub const CREATE_SCRIPT_FROM_BYTES: &str = "session.create_script_from_bytes";
    /// Compile a script without instantiating it.
    pub const COMPILE_SCRIPT: &str = "session.compile_script";
    /// Capture a warm-start snapshot.
    pub const SNAPSHOT_SCRIPT: &str = "session.snapshot_script";
    /// Establish a peer connection.
    pub const SETUP_PEER_CONNECTION: &str = "session.setup_peer_connection";
    /// Join a portal.
    pub const JOIN_PORTAL: &str = "session.join_portal";
    /// Free a session handle (notification).
    pub const RELEASE_SESSION: &str = "session.release";
    /// Free a script handle (notification).
    pub const RELEASE_SCRIPT: &str = "script.release";
    /// Leave a portal.
    pub const TERMINATE_MEMBERSHIP: &str = "portal_membership.terminate";
}

/// Outbound message (client → engine).
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    /// Correlation id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Method name from [`method`].
    pub method: &'a str,
    /// Method-specific payload.
    pub params: Value,
}

impl<'a> Request<'a> {
    /// Request expecting a correlated response.
    #[must_use]
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            id: Some(id),
            method,
            params,
        }
    }

    /// Fire-and-forget notification.
    #[must_use]
    pub fn notification(method: &'a str, params: Value) -> Self {
        Self {
            id: None,
            method,
            params,
        }
    }

    /// Serialize to a single NDJSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Protocol(format!("failed to serialise request: {e}")))
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Engine error code.
    pub code: String,
    /// Engine error message.
    pub message: String,
}

impl From<WireError> for AppError {
    fn from(err: WireError) -> Self {
        if err.code == "cancelled" {
            return Self::Cancelled;
        }
        Self::Engine {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    session: Option<SessionHandle>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct DetachedParams {
    reason: DetachReason,
    #[serde(default)]
    crash: Option<Crash>,
}

/// Decoded inbound message (engine → client).
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to the request with the same id.
    Response {
        /// Correlation id.
        id: u64,
        /// Result payload or mapped engine error.
        outcome: Result<Value>,
    },
    /// Pushed lifecycle event.
    Event {
        /// Session the event concerns.
        session: SessionHandle,
        /// Typed payload.
        event: SessionEvent,
    },
}

/// Parse one NDJSON line from the engine.
///
/// Returns `Ok(None)` for blank lines and for events this client does not
/// know; unknown events are logged at `DEBUG`.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] for malformed JSON or envelopes that are
/// neither a response nor an event.
pub fn parse_inbound_line(line: &str) -> Result<Option<Inbound>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)?;

    if let Some(event) = envelope.event {
        let session = envelope.session.ok_or_else(|| {
            AppError::Protocol(format!("missing required field: `session` in {event} event"))
        })?;
        return match event.as_str() {
            "detached" => {
                let params: DetachedParams = serde_json::from_value(envelope.params)
                    .map_err(|e| AppError::Protocol(format!("invalid detached params: {e}")))?;
                Ok(Some(Inbound::Event {
                    session,
                    event: SessionEvent::detached(params.reason, params.crash),
                }))
            }
            other => {
                debug!(event = other, %session, "skipping unknown engine event");
                Ok(None)
            }
        };
    }

    let id = envelope
        .id
        .ok_or_else(|| AppError::Protocol("envelope has neither `id` nor `event`".into()))?;

    let outcome = match (envelope.error, envelope.result) {
        (Some(err), _) => Err(err.into()),
        (None, result) => Ok(result.unwrap_or(Value::Null)),
    };

    Ok(Some(Inbound::Response { id, outcome }))
}

/// Encode a byte payload for the wire.
#[must_use]
pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 byte payload from the wire.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if `encoded` is not valid base64.
pub fn decode_bytes(encoded: &str) -> Result<Bytes> {
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| AppError::Protocol(format!("invalid base64 payload: {e}")))
}

/// Wire form of [`ScriptOptions`].
#[must_use]
pub fn script_options_params(options: &ScriptOptions) -> Value {
    json!({
        "name": options.name(),
        "runtime": options.runtime(),
        "snapshot": options.snapshot().map(|s| encode_bytes(s)),
        "snapshot_transport": options.snapshot_transport(),
    })
}

/// Wire form of [`SnapshotOptions`].
#[must_use]
pub fn snapshot_options_params(options: &SnapshotOptions) -> Value {
    json!({
        "warmup_script": options.warmup_script(),
        "runtime": options.runtime(),
    })
}

/// `{"bytes": "<base64>"}` result body.
#[derive(Debug, Deserialize)]
pub struct BytesResult {
    /// Base64 payload.
    pub bytes: String,
}

/// `{"session": n}` result body.
#[derive(Debug, Deserialize)]
pub struct SessionResult {
    /// New session handle.
    pub session: SessionHandle,
}

/// `{"script": n}` result body.
#[derive(Debug, Deserialize)]
pub struct ScriptResult {
    /// New script handle.
    pub script: crate::engine::ScriptHandle,
}

/// `{"membership": n}` result body.
#[derive(Debug, Deserialize)]
pub struct MembershipResult {
    /// New membership handle.
    pub membership: crate::engine::MembershipHandle,
}

/// Deserialize a typed result body.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] naming `method` if the body does not match.
pub fn decode_result<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| AppError::Protocol(format!("unexpected {method} result: {e}")))
}
