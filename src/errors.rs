//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure an engine call can surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// The caller cancelled the operation through its [`Cancellable`](crate::Cancellable).
    Cancelled,
    /// A caller-side deadline expired before the operation completed.
    DeadlineExceeded(String),
    /// Failure reported by the instrumentation engine itself.
    Engine {
        /// Engine-defined error code (e.g. `invalid_argument`, `not_supported`).
        code: String,
        /// Human-readable message supplied by the engine.
        message: String,
    },
    /// Operation attempted on a detached or released object.
    InvalidState(String),
    /// Argument rejected before reaching the engine.
    InvalidArgument(String),
    /// Control channel framing or envelope failure.
    Protocol(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Build an [`AppError::Engine`] from a code and message.
    #[must_use]
    pub fn engine(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this error means "aborted by the caller".
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error means "the caller-side deadline expired".
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled: operation was cancelled"),
            Self::DeadlineExceeded(msg) => write!(f, "deadline exceeded: {msg}"),
            Self::Engine { code, message } => write!(f, "engine: [{code}] {message}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}
