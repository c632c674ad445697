//! Unqueued request/response execution.

use serde_json::Value;
use tracing::debug;

use queuelink_core::{Stage, Status};

use super::{JobInner, Payload};
use crate::http::post_data;

pub(super) async fn run(job: &JobInner, payload: Payload) {
    let _ = job.emit_status(Status::new(Stage::Pending, false));

    let shared = &job.shared;
    let url = format!("{}/run{}", shared.config.root, job.route);
    let response = tokio::select! {
        () = job.cancel.cancelled() => return,
        response = post_data(
            &shared.http,
            &url,
            &payload,
            shared.token.as_deref(),
            shared.request_timeout(),
        ) => response,
    };
    debug!(url, status = response.status, "direct call answered");

    if response.is_ok() {
        let data = match response.body.get("data") {
            Some(Value::Array(slots)) => slots.clone(),
            _ => Vec::new(),
        };
        let _ = job.emit_data(data);
        let _ = job.emit_status(Status {
            eta: response.body.get("average_duration").and_then(Value::as_f64),
            ..Status::new(Stage::Complete, false)
        });
    } else {
        let message = response
            .error_message()
            .unwrap_or_else(|| format!("service answered {}", response.status));
        let _ = job.emit_status(Status::error(message, false));
    }
}
