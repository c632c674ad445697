//! # SSE Parser
//!
//! Server-Sent Events reader for the job event streams.
//!
//! Both stream transports (the per-job legacy stream and the shared
//! multiplexed stream) receive `data: {json}` lines over a long-lived HTTP
//! response. This module handles:
//! - Line buffering from chunked responses
//! - `data:` extraction, with multi-line data joined into one payload per event
//! - Comment and non-data field filtering
//! - Surfacing read errors so callers can report a broken connection

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::errors::{ClientError, Result};

/// Boxed stream of parsed JSON messages.
///
/// Ends on EOF; yields one `Err` and then ends on a read error.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Parse SSE lines from a byte stream and yield one payload per event.
///
/// `data:` lines of one event are joined with `\n` and yielded at the blank
/// line ending the event. A pending event is flushed at EOF. A read error is
/// yielded once and ends the stream.
pub fn parse_sse_lines<S, E>(byte_stream: S) -> impl Stream<Item = std::result::Result<String, E>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), EventBuffer::default(), false),
        |(mut stream, mut buffer, mut event, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        continue;
                    };

                    if let Some(data) = event.push_line(line) {
                        return Some((Ok(data), (stream, buffer, event, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (stream, buffer, event, true))),
                    None => {
                        if let Ok(line) = std::str::from_utf8(&buffer) {
                            let line = line.trim_end_matches('\r');
                            if !line.is_empty() {
                                let _ = event.push_line(line);
                            }
                        }
                        buffer.clear();
                        return event
                            .dispatch()
                            .map(|d| (Ok(d), (stream, buffer, event, true)));
                    }
                }
            }
        },
    )
}

/// `data:` lines of the event being read.
#[derive(Debug, Default)]
struct EventBuffer {
    data: Option<String>,
}

impl EventBuffer {
    /// Feed one line; returns the event payload when `line` ends the event.
    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = extract_sse_data(line) {
            match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_owned()),
            }
        }
        None
    }

    /// Take the accumulated payload, skipping events with blank data.
    fn dispatch(&mut self) -> Option<String> {
        self.data.take().filter(|data| !data.trim().is_empty())
    }
}

/// Value of a `data` field line, without the single optional leading space.
///
/// Returns `None` for comments and other fields.
fn extract_sse_data(line: &str) -> Option<&str> {
    if line.starts_with(':') {
        return None;
    }
    let rest = line.strip_prefix("data")?;
    if rest.is_empty() {
        return Some("");
    }
    let value = rest.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Parse JSON from an SSE data string, warning on failure.
pub fn parse_sse_data(data: &str) -> Option<Value> {
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            let preview: String = data.chars().take(100).collect();
            warn!(error = %e, data_preview = %preview, "failed to parse SSE data");
            None
        }
    }
}

/// Open an event stream with `GET url`.
///
/// A non-2xx response is an error. Messages that are not valid JSON are
/// skipped with a warning.
pub async fn open_event_stream(
    http: &reqwest::Client,
    url: &str,
    token: Option<&str>,
) -> Result<EventStream> {
    let mut request = http
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            message: format!("event stream at {url} refused"),
        });
    }
    debug!(url, "event stream open");

    let lines = parse_sse_lines(response.bytes_stream());
    let messages = lines.filter_map(|item| match item {
        Ok(data) => parse_sse_data(&data).map(Ok),
        Err(e) => Some(Err(ClientError::Http(e))),
    });
    Ok(Box::pin(messages))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
