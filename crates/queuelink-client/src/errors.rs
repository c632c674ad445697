//! Client error types.
//!
//! Job failures are delivered as `error` statuses to the job's listeners and
//! never surface here, except through [`ClientError::Job`] from the
//! single-shot predict wrapper.

use queuelink_core::Status;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL could not be parsed or built.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The service answered with a non-success HTTP status.
    #[error("service error ({status}): {message}")]
    Status {
        /// HTTP status code (0 if no response).
        status: u16,
        /// Error description.
        message: String,
    },

    /// The service configuration could not be fetched.
    #[error("could not get config: {0}")]
    Config(String),

    /// No endpoint matches the given name or index.
    #[error("there is no endpoint matching {0}")]
    UnknownEndpoint(String),

    /// Predict was called on an endpoint that may run forever.
    #[error("cannot call predict on {0}: it may run forever, use submit instead")]
    ContinuousEndpoint(String),

    /// File upload failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The service version does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Hub API call failed or was given invalid arguments.
    #[error("hub error: {0}")]
    Hub(String),

    /// The hosted space never reached a running state.
    #[error("space unavailable ({detail}): {message}")]
    SpaceUnavailable {
        /// Runtime stage reported by the hub.
        detail: String,
        /// Human-readable explanation.
        message: String,
    },

    /// The job ended with an `error` status.
    #[error("job failed: {}", .0.message.as_deref().unwrap_or("unknown error"))]
    Job(Status),

    /// The job ended without delivering a result.
    #[error("job ended without a result")]
    NoResult,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use queuelink_core::constants::QUEUE_FULL_MSG;

    #[test]
    fn job_error_shows_status_message() {
        let err = ClientError::Job(Status::error(QUEUE_FULL_MSG, true));
        assert_eq!(err.to_string(), format!("job failed: {QUEUE_FULL_MSG}"));
    }

    #[test]
    fn job_error_without_message() {
        let err = ClientError::Job(Status::new(queuelink_core::Stage::Error, false));
        assert_eq!(err.to_string(), "job failed: unknown error");
    }

    #[test]
    fn status_error_display() {
        let err = ClientError::Status {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(err.to_string(), "service error (404): not found");
    }

    #[test]
    fn json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ClientError::from(json_err);
        assert!(err.to_string().starts_with("JSON error"));
    }
}
