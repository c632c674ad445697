//! Job status and the events delivered to listeners.
//!
//! A job moves along `pending → generating* → complete | error`. `complete`
//! and `error` are terminal: once either has been delivered, nothing else is
//! delivered for that job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Stage
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle stage of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Queued, waiting for a worker.
    #[default]
    Pending,
    /// Running and streaming partial outputs.
    Generating,
    /// Finished successfully (terminal).
    Complete,
    /// Failed (terminal).
    Error,
}

impl Stage {
    /// Whether no further transitions may follow this stage.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Position along the lifecycle; terminal stages share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Generating => 1,
            Self::Complete | Self::Error => 2,
        }
    }

    /// Wire / display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// A status record as delivered to `status` listeners.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Lifecycle stage.
    pub stage: Stage,
    /// Whether the job went through the queue.
    pub queue: bool,
    /// Service-provided status code, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    /// Service-reported success flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Queue size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Position in the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    /// Estimated seconds until completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    /// Progress trackers reported by the running job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_data: Option<Value>,
    /// Human-readable message (errors, busy notices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set when the failure came from a broken transport.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broken: bool,
}

impl Status {
    /// A bare status at `stage`.
    pub fn new(stage: Stage, queue: bool) -> Self {
        Self {
            stage,
            queue,
            ..Self::default()
        }
    }

    /// An `error` status carrying `message`.
    pub fn error(message: impl Into<String>, queue: bool) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(Stage::Error, queue)
        }
    }

    /// An `error` status for a transport failure.
    pub fn broken(message: impl Into<String>, queue: bool) -> Self {
        Self {
            broken: true,
            ..Self::error(message, queue)
        }
    }

    /// Whether this status ends the job.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener events
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of event a listener subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// [`JobEvent::Status`]
    Status,
    /// [`JobEvent::Data`]
    Data,
    /// [`JobEvent::Log`]
    Log,
}

/// Output payload snapshot: one value per declared output slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Output slot values.
    pub data: Vec<Value>,
}

/// A log line emitted by the running job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Level name as sent by the service (e.g. `"info"`, `"warning"`).
    pub level: String,
    /// Log text.
    pub log: String,
}

/// Event delivered to job listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    /// Status transition.
    Status(Status),
    /// Output snapshot.
    Data(DataEvent),
    /// Job log line.
    Log(LogEvent),
}

impl JobEvent {
    /// The listener kind this event is routed to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status(_) => EventKind::Status,
            Self::Data(_) => EventKind::Data,
            Self::Log(_) => EventKind::Log,
        }
    }
}
