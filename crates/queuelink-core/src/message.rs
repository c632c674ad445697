//! # Message Interpreter
//!
//! Maps one raw wire message plus the job's last known stage to a normalized
//! [`Interpreted`] event. Pure and table-driven: the only state it sees is the
//! `last_stage` argument.
//!
//! Message kind names are defined by the service and matched verbatim.

use serde::Deserialize;
use serde_json::Value;

use crate::constants::{QUEUE_FULL_MSG, UNEXPECTED_ERROR_MSG};
use crate::status::{LogEvent, Stage, Status};

/// One inbound wire message, tagged by its `msg` field.
///
/// Unrecognized kinds deserialize to [`WireMessage::Unknown`]; use
/// [`WireMessage::kind_name`] on the raw value to recover the name.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum WireMessage {
    /// The service asks for the job payload.
    SendData {
        /// Event id assigned to the job (legacy stream transport).
        #[serde(default)]
        event_id: Option<String>,
    },
    /// The service asks for the session hash.
    SendHash,
    /// The queue is at capacity.
    QueueFull {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Service success flag.
        #[serde(default)]
        success: Option<bool>,
    },
    /// Keep-alive.
    Heartbeat,
    /// Service-side failure unrelated to the job's own output.
    UnexpectedError {
        /// Error text.
        #[serde(default)]
        message: Option<String>,
    },
    /// Queue position update.
    Estimation {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Total queue size.
        #[serde(default)]
        queue_size: Option<u64>,
        /// Position of this job.
        #[serde(default)]
        rank: Option<u64>,
        /// Estimated seconds until this job starts.
        #[serde(default)]
        rank_eta: Option<f64>,
        /// Service success flag.
        #[serde(default)]
        success: Option<bool>,
    },
    /// Progress tracker update.
    Progress {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Progress trackers.
        #[serde(default)]
        progress_data: Option<Value>,
        /// Service success flag.
        #[serde(default)]
        success: Option<bool>,
    },
    /// Log line from the running job.
    Log {
        /// Log text.
        #[serde(default)]
        log: String,
        /// Level name.
        #[serde(default)]
        level: String,
    },
    /// Intermediate output of a generator job.
    ProcessGenerating {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Whether the step succeeded.
        #[serde(default)]
        success: bool,
        /// Output object (`{"data": [...], ...}` or `{"error": ...}`).
        #[serde(default)]
        output: Value,
        /// Progress trackers.
        #[serde(default)]
        progress_data: Option<Value>,
        /// Average job duration in seconds.
        #[serde(default)]
        average_duration: Option<f64>,
    },
    /// Final output.
    ProcessCompleted {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Whether the job succeeded.
        #[serde(default)]
        success: bool,
        /// Output object.
        #[serde(default)]
        output: Value,
        /// Progress trackers.
        #[serde(default)]
        progress_data: Option<Value>,
    },
    /// A worker picked the job up.
    ProcessStarts {
        /// Service status code.
        #[serde(default)]
        code: Option<Value>,
        /// Queue rank at start.
        #[serde(default)]
        rank: Option<u64>,
        /// Estimated run time in seconds.
        #[serde(default)]
        eta: Option<f64>,
        /// Service success flag.
        #[serde(default)]
        success: Option<bool>,
    },
    /// Any kind this client does not know.
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Parse a raw JSON message.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// The `msg` field of a raw message, if present.
    pub fn kind_name(value: &Value) -> Option<&str> {
        value.get("msg").and_then(Value::as_str)
    }

    /// The `event_id` field of a raw message, if present.
    pub fn event_id(value: &Value) -> Option<&str> {
        value.get("event_id").and_then(Value::as_str)
    }
}

/// Normalized event kind produced by [`interpret`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpretedKind {
    /// The service wants the payload.
    DataRequest,
    /// The service wants the session hash.
    HashRequest,
    /// Non-terminal status update (may carry an `error` stage).
    Update,
    /// Partial output.
    Generating,
    /// Final status; delivered after the accompanying data.
    Complete,
    /// Job log line.
    Log,
    /// Keep-alive.
    Heartbeat,
    /// Fatal service-side failure.
    UnexpectedError,
    /// Unrecognized message kind.
    None,
}

/// Result of interpreting one wire message.
#[derive(Clone, Debug, PartialEq)]
pub struct Interpreted {
    /// Event kind.
    pub kind: InterpretedKind,
    /// Status carried by the message.
    pub status: Option<Status>,
    /// Output object (`{"data": [...]}`) carried by the message.
    pub data: Option<Value>,
    /// Log line carried by the message.
    pub log: Option<LogEvent>,
}

impl Interpreted {
    fn bare(kind: InterpretedKind) -> Self {
        Self {
            kind,
            status: None,
            data: None,
            log: None,
        }
    }

    fn with_status(kind: InterpretedKind, status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::bare(kind)
        }
    }
}

/// Every queued message reports `queue: true`.
const QUEUED: bool = true;

/// Interpret one wire message given the job's last known stage.
pub fn interpret(message: &WireMessage, last_stage: Option<Stage>) -> Interpreted {
    use InterpretedKind as K;

    match message {
        WireMessage::SendData { .. } => Interpreted::bare(K::DataRequest),
        WireMessage::SendHash => Interpreted::bare(K::HashRequest),
        WireMessage::QueueFull { code, success } => Interpreted::with_status(
            K::Update,
            Status {
                code: code.clone(),
                success: *success,
                ..Status::error(QUEUE_FULL_MSG, QUEUED)
            },
        ),
        WireMessage::Heartbeat => Interpreted::bare(K::Heartbeat),
        WireMessage::UnexpectedError { message } => Interpreted::with_status(
            K::UnexpectedError,
            Status {
                success: Some(false),
                ..Status::error(
                    message.clone().unwrap_or_else(|| UNEXPECTED_ERROR_MSG.to_owned()),
                    QUEUED,
                )
            },
        ),
        WireMessage::Estimation {
            code,
            queue_size,
            rank,
            rank_eta,
            success,
        } => Interpreted::with_status(
            K::Update,
            Status {
                code: code.clone(),
                size: *queue_size,
                position: *rank,
                eta: *rank_eta,
                success: *success,
                ..Status::new(last_stage.unwrap_or(Stage::Pending), QUEUED)
            },
        ),
        WireMessage::Progress {
            code,
            progress_data,
            success,
        } => Interpreted::with_status(
            K::Update,
            Status {
                code: code.clone(),
                progress_data: progress_data.clone(),
                success: *success,
                ..Status::new(Stage::Pending, QUEUED)
            },
        ),
        WireMessage::Log { log, level } => Interpreted {
            log: Some(LogEvent {
                level: level.clone(),
                log: log.clone(),
            }),
            ..Interpreted::bare(K::Log)
        },
        WireMessage::ProcessGenerating {
            code,
            success,
            output,
            progress_data,
            average_duration,
        } => Interpreted {
            kind: K::Generating,
            status: Some(Status {
                code: code.clone(),
                progress_data: progress_data.clone(),
                eta: *average_duration,
                message: if *success { None } else { output_error(output) },
                ..Status::new(
                    if *success { Stage::Generating } else { Stage::Error },
                    QUEUED,
                )
            }),
            data: success.then(|| output.clone()),
            log: None,
        },
        WireMessage::ProcessCompleted {
            code,
            success,
            output,
            progress_data,
        } => {
            if output.get("error").is_some() {
                return Interpreted::with_status(
                    K::Update,
                    Status {
                        code: code.clone(),
                        success: Some(*success),
                        message: output_error(output),
                        ..Status::new(Stage::Error, QUEUED)
                    },
                );
            }
            Interpreted {
                kind: K::Complete,
                status: Some(Status {
                    code: code.clone(),
                    progress_data: progress_data.clone(),
                    ..Status::new(
                        if *success { Stage::Complete } else { Stage::Error },
                        QUEUED,
                    )
                }),
                data: success.then(|| output.clone()),
                log: None,
            }
        }
        WireMessage::ProcessStarts {
            code,
            rank,
            eta,
            success,
        } => Interpreted::with_status(
            K::Update,
            Status {
                code: code.clone(),
                size: *rank,
                position: Some(0),
                eta: *eta,
                success: *success,
                ..Status::new(Stage::Pending, QUEUED)
            },
        ),
        WireMessage::Unknown => {
            Interpreted::with_status(K::None, Status::new(Stage::Error, QUEUED))
        }
    }
}

/// Extract `output.error` as display text.
fn output_error(output: &Value) -> Option<String> {
    match output.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn run(raw: Value, last: Option<Stage>) -> Interpreted {
        interpret(&WireMessage::from_value(&raw).unwrap(), last)
    }

    #[test]
    fn send_data_and_hash_requests() {
        assert_eq!(run(json!({"msg": "send_data"}), None).kind, InterpretedKind::DataRequest);
        assert_eq!(run(json!({"msg": "send_hash"}), None).kind, InterpretedKind::HashRequest);
    }

    #[test]
    fn send_data_keeps_event_id() {
        let msg = WireMessage::from_value(&json!({"msg": "send_data", "event_id": "E9"})).unwrap();
        assert_matches!(msg, WireMessage::SendData { event_id: Some(ref id) } if id == "E9");
    }

    #[test]
    fn queue_full_is_error_update() {
        let out = run(json!({"msg": "queue_full", "code": 7}), None);
        assert_eq!(out.kind, InterpretedKind::Update);
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Error);
        assert_eq!(status.message.as_deref(), Some(QUEUE_FULL_MSG));
        assert_eq!(status.code, Some(json!(7)));
    }

    #[test]
    fn estimation_reuses_last_stage() {
        let raw = json!({"msg": "estimation", "queue_size": 4, "rank": 2, "rank_eta": 1.5});
        let out = run(raw.clone(), Some(Stage::Generating));
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Generating);
        assert_eq!(status.size, Some(4));
        assert_eq!(status.position, Some(2));
        assert_eq!(status.eta, Some(1.5));

        assert_eq!(run(raw, None).status.unwrap().stage, Stage::Pending);
    }

    #[test]
    fn progress_is_pending_update() {
        let out = run(json!({"msg": "progress", "progress_data": [{"index": 1}]}), None);
        assert_eq!(out.kind, InterpretedKind::Update);
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Pending);
        assert_eq!(status.progress_data, Some(json!([{"index": 1}])));
    }

    #[test]
    fn log_carries_level_and_text() {
        let out = run(json!({"msg": "log", "log": "loading", "level": "info"}), None);
        assert_eq!(out.kind, InterpretedKind::Log);
        assert_eq!(
            out.log,
            Some(LogEvent {
                level: "info".into(),
                log: "loading".into()
            })
        );
    }

    #[test]
    fn generating_success_carries_output() {
        let out = run(
            json!({"msg": "process_generating", "success": true, "output": {"data": ["a"]}, "average_duration": 2.0}),
            None,
        );
        assert_eq!(out.kind, InterpretedKind::Generating);
        assert_eq!(out.status.as_ref().unwrap().stage, Stage::Generating);
        assert_eq!(out.status.unwrap().eta, Some(2.0));
        assert_eq!(out.data, Some(json!({"data": ["a"]})));
    }

    #[test]
    fn generating_failure_is_error_without_data() {
        let out = run(
            json!({"msg": "process_generating", "success": false, "output": {"error": "boom"}}),
            None,
        );
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Error);
        assert_eq!(status.message.as_deref(), Some("boom"));
        assert!(out.data.is_none());
    }

    #[test]
    fn completed_success() {
        let out = run(
            json!({"msg": "process_completed", "success": true, "output": {"data": [1]}}),
            None,
        );
        assert_eq!(out.kind, InterpretedKind::Complete);
        assert_eq!(out.status.unwrap().stage, Stage::Complete);
        assert_eq!(out.data, Some(json!({"data": [1]})));
    }

    #[test]
    fn completed_with_error_field_is_error_update() {
        let out = run(
            json!({"msg": "process_completed", "success": true, "output": {"error": "bad input"}}),
            None,
        );
        assert_eq!(out.kind, InterpretedKind::Update);
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Error);
        assert_eq!(status.message.as_deref(), Some("bad input"));
        assert!(out.data.is_none());
    }

    #[test]
    fn completed_with_null_error_still_fails() {
        let out = run(
            json!({"msg": "process_completed", "success": false, "output": {"error": null}}),
            None,
        );
        assert_eq!(out.kind, InterpretedKind::Update);
        assert_eq!(out.status.unwrap().message, None);
    }

    #[test]
    fn process_starts_is_pending_at_front() {
        let out = run(json!({"msg": "process_starts", "rank": 3, "eta": 4.0}), None);
        let status = out.status.unwrap();
        assert_eq!(status.stage, Stage::Pending);
        assert_eq!(status.size, Some(3));
        assert_eq!(status.position, Some(0));
        assert_eq!(status.eta, Some(4.0));
    }

    #[test]
    fn unexpected_error_uses_wire_message_or_default() {
        let out = run(json!({"msg": "unexpected_error", "message": "oom"}), None);
        assert_eq!(out.kind, InterpretedKind::UnexpectedError);
        assert_eq!(out.status.unwrap().message.as_deref(), Some("oom"));

        let out = run(json!({"msg": "unexpected_error"}), None);
        assert_eq!(out.status.unwrap().message.as_deref(), Some(UNEXPECTED_ERROR_MSG));
    }

    #[test]
    fn heartbeat() {
        assert_eq!(run(json!({"msg": "heartbeat"}), None).kind, InterpretedKind::Heartbeat);
    }

    #[test]
    fn unknown_kind_is_none_with_error_status() {
        let raw = json!({"msg": "close_stream", "event_id": "E1"});
        assert_eq!(WireMessage::kind_name(&raw), Some("close_stream"));
        let out = run(raw, None);
        assert_eq!(out.kind, InterpretedKind::None);
        assert_eq!(out.status.unwrap().stage, Stage::Error);
    }

    #[test]
    fn missing_msg_field_is_a_parse_error() {
        assert!(WireMessage::from_value(&json!({"event_id": "E1"})).is_err());
    }

    #[test]
    fn event_id_helper() {
        assert_eq!(WireMessage::event_id(&json!({"event_id": "E2"})), Some("E2"));
        assert_eq!(WireMessage::event_id(&json!({"msg": "heartbeat"})), None);
    }
}
