//! Domain model module declarations.
//!
//! Pure value types: none of them hold engine resources, and none keep a
//! reference back to a [`Session`](crate::session::Session).

pub mod event;
pub mod peer;
pub mod portal;
pub mod runtime;
pub mod script_options;
pub mod snapshot_options;
