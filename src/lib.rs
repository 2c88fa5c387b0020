#![forbid(unsafe_code)]

//! Session lifecycle, script and warm-start snapshot management for a
//! dynamic instrumentation engine.

pub mod cancellable;
pub mod config;
pub mod engine;
pub mod errors;
pub mod models;
pub mod session;
pub mod snapshot_manager;

pub use cancellable::{Cancellable, CancellableState};
pub use config::EngineConfig;
pub use errors::{AppError, Result};
pub use session::{PortalMembership, Script, Session, Subscription, SubscriptionHandle};
