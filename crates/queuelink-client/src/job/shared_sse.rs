//! Jobs riding the session's shared event stream.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use queuelink_core::constants::QUEUE_FULL_MSG;
use queuelink_core::{DiffReconstructor, EventId, Stage, Status};

use super::{JobInner, Payload, Step};
use crate::http::post_data;

pub(super) async fn run(job: &JobInner, payload: Payload) {
    let _ = job.emit_status(Status::new(Stage::Pending, true));

    let shared = &job.shared;
    let url = format!("{}/queue/join", shared.config.root);
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

    match response.status {
        200 => {}
        503 => {
            warn!(fn_index = job.fn_index, "queue is full");
            let _ = job.emit_status(Status::error(QUEUE_FULL_MSG, true));
            return;
        }
        status => {
            warn!(fn_index = job.fn_index, status, "queue join refused");
            job.fail_broken();
            return;
        }
    }
    let Some(event_id) = response.body.get("event_id").and_then(Value::as_str) else {
        warn!(fn_index = job.fn_index, "queue join answered without an event id");
        job.fail_unexpected();
        return;
    };
    let event_id = EventId::from(event_id);
    job.set_event_id(event_id.clone());
    debug!(fn_index = job.fn_index, event_id = %event_id, "joined queue");
    let mux = shared.mux();
    if job.cancel.is_cancelled() {
        mux.unregister(&event_id);
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    mux.register(event_id.clone(), tx);

    let mut diffs = job.transport.uses_diffs().then(DiffReconstructor::new);
    loop {
        let message = tokio::select! {
            () = job.cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(raw) = message else {
            // Sink dropped by the multiplexer.
            if !job.is_terminal() {
                job.fail_broken();
            }
            break;
        };
        if job.process(&raw, diffs.as_mut()) == Step::Close || job.is_terminal() {
            break;
        }
    }

    if let Some(diffs) = diffs.as_mut() {
        diffs.discard(&event_id);
    }
    mux.unregister(&event_id);
}
