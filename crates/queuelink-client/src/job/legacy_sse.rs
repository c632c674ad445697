//! Dedicated event stream per job.
//!
//! The stream is opened on `/queue/join`; the payload is POSTed to
//! `/queue/data` when the service asks for it.

use tokio_stream::StreamExt;
use tracing::{debug, warn};
use url::Url;

use queuelink_core::{EventId, Stage, Status, WireMessage};

use super::{JobInner, Payload, Step};
use crate::http::post_data;
use crate::sse::open_event_stream;

pub(super) async fn run(job: &JobInner, mut payload: Payload) {
    let _ = job.emit_status(Status::new(Stage::Pending, true));

    let shared = &job.shared;
    let root = &shared.config.root;
    let url = match Url::parse_with_params(
        &format!("{root}/queue/join"),
        &[
            ("fn_index", job.fn_index.to_string()),
            ("session_hash", shared.session_hash.to_string()),
        ],
    ) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "invalid queue url");
            job.fail_broken();
            return;
        }
    };

    let opened = tokio::select! {
        () = job.cancel.cancelled() => return,
        opened = open_event_stream(&shared.http, url.as_str(), shared.token.as_deref()) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!(fn_index = job.fn_index, error = %e, "could not open job stream");
            job.fail_broken();
            return;
        }
    };

    let data_url = format!("{root}/queue/data");
    loop {
        let item = tokio::select! {
            () = job.cancel.cancelled() => return,
            item = stream.next() => item,
        };
        let raw = match item {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                warn!(fn_index = job.fn_index, error = %e, "job stream read failed");
                job.fail_broken();
                return;
            }
            None => {
                debug!(fn_index = job.fn_index, "job stream ended");
                if !job.is_terminal() {
                    job.fail_broken();
                }
                return;
            }
        };

        match job.process(&raw, None) {
            Step::Continue | Step::SendHash => {}
            Step::SendData => {
                if let Some(event_id) = WireMessage::event_id(&raw) {
                    job.set_event_id(EventId::from(event_id));
                    payload.event_id = Some(event_id.to_owned());
                }
                let response = tokio::select! {
                    () = job.cancel.cancelled() => return,
                    response = post_data(
                        &shared.http,
                        &data_url,
                        &payload,
                        shared.token.as_deref(),
                        shared.request_timeout(),
                    ) => response,
                };
                if !response.is_ok() {
                    warn!(status = response.status, "payload POST refused");
                    job.fail_broken();
                    return;
                }
            }
            Step::Close => return,
        }
    }
}
