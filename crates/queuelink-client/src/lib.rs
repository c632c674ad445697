//! # queuelink-client
//!
//! Client for queued remote job services.
//!
//! A [`Client`] connects to one app, resolves its descriptor, and creates
//! [`Job`]s. Each job picks a transport per its descriptor entry:
//!
//! | Transport | Path |
//! |-----------|------|
//! | direct | `POST {root}/run/{name}` |
//! | socket | dedicated WebSocket to `/queue/join` |
//! | stream | dedicated event stream to `/queue/join`, payload POSTed to `/queue/data` |
//! | shared stream | `POST /queue/join`, then one [`StreamMultiplexer`] per client |
//!
//! Whatever the transport, listeners see the same `status` / `data` / `log`
//! vocabulary from `queuelink-core`.

#![deny(unsafe_code)]

pub mod admin;
pub mod api_info;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod http;
pub mod job;
pub mod mux;
mod predict;
pub mod selector;
pub mod session;
pub mod sse;
pub mod upload;

pub use admin::{DuplicateOptions, HubClient, SpaceState, SpaceStatus, SpaceStatusCallback};
pub use api_info::{ApiInfo, ApiParameter, EndpointInfo};
pub use config::{AppConfig, JobRef, Protocol};
pub use endpoint::{Endpoint, SpaceRef};
pub use errors::{ClientError, Result};
pub use job::{Job, JobRequest};
pub use mux::StreamMultiplexer;
pub use selector::{Transport, select_transport};
pub use session::{Client, ClientOptions, SubmitOptions};
pub use upload::{Blob, HttpUploader, InputValue, Uploader};

pub use queuelink_core::{
    DataEvent, EventId, EventKind, JobEvent, Listener, LogEvent, SessionHash, Stage, Status,
};
