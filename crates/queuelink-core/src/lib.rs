//! # queuelink-core
//!
//! Shared vocabulary for the queuelink job client.
//!
//! Everything in this crate is transport-agnostic and free of I/O:
//!
//! - **Branded IDs**: [`SessionHash`] and [`EventId`] newtypes
//! - **Status vocabulary**: [`Stage`], [`Status`], and the [`JobEvent`] family
//!   delivered to listeners
//! - **Message interpreter**: [`message::interpret`] maps one raw wire message
//!   plus the job's last stage to a normalized [`message::Interpreted`] event
//! - **Diff reconstruction**: [`diff::apply_diff`] and the per-event
//!   [`diff::DiffReconstructor`]
//! - **Listener registry**: ordered per-kind callback lists with
//!   reference-identity removal
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod constants;
pub mod diff;
pub mod ids;
pub mod listeners;
pub mod logging;
pub mod message;
pub mod status;
pub mod version;

pub use diff::{DiffError, DiffReconstructor, apply_diff};
pub use ids::{EventId, SessionHash};
pub use listeners::{Listener, ListenerRegistry};
pub use message::{Interpreted, InterpretedKind, WireMessage, interpret};
pub use status::{DataEvent, EventKind, JobEvent, LogEvent, Stage, Status};
