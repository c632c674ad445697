//! # Stream Multiplexer
//!
//! One shared event stream per client session, carrying messages for every
//! outstanding job on the shared-stream transports.
//!
//! - Messages are routed by `event_id` to the sink registered for that id.
//! - Messages without an `event_id` are broadcast to every sink.
//! - Messages for an id with no sink yet are buffered and replayed, in
//!   arrival order, when the sink registers.
//! - An id unregistered before its `process_completed` is retired: its late
//!   messages are dropped, and the retirement ends with that completion.
//! - The stream closes once every registered id has seen `process_completed`
//!   (or unregistered), and reopens on the next registration.
//! - A read error, a refused connection, or EOF with ids still outstanding
//!   broadcasts a synthetic `unexpected_error` and closes the stream.
//!
//! Dispatch goes through each job's unbounded channel, and the reader yields
//! to the scheduler after every message, so a burst of completions never
//! runs job logic inline on the reader task.
//!
//! Ordering: each sink receives its messages in connection order. Every job
//! drains its own channel on its own task, so on a multi-threaded runtime
//! listeners of two different jobs may observe their events interleaved
//! differently from the connection. On a current-thread runtime delivery
//! follows the connection order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use queuelink_core::constants::BROKEN_CONNECTION_MSG;
use queuelink_core::{EventId, WireMessage};

use crate::sse::open_event_stream;

/// Receiving end of a job's raw message feed.
pub type MessageSink = mpsc::UnboundedSender<Value>;

/// Shared stream demultiplexer.
pub struct StreamMultiplexer {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    state: Arc<Mutex<MuxState>>,
}

#[derive(Default)]
struct MuxState {
    callbacks: HashMap<EventId, MessageSink>,
    pending: HashMap<EventId, Vec<Value>>,
    unclosed: HashSet<EventId>,
    /// Ids that left before their `process_completed` arrived.
    retired: HashSet<EventId>,
    stream: Option<OpenStream>,
    generation: u64,
}

struct OpenStream {
    generation: u64,
    cancel: CancellationToken,
}

impl MuxState {
    fn is_current(&self, generation: u64) -> bool {
        self.stream.as_ref().is_some_and(|s| s.generation == generation)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(generation = stream.generation, "closing shared stream");
            stream.cancel.cancel();
        }
    }
}

impl StreamMultiplexer {
    /// Create a multiplexer reading `GET url`. Nothing is opened until the
    /// first registration.
    pub fn new(http: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
            state: Arc::new(Mutex::new(MuxState::default())),
        }
    }

    /// Register `sink` for `event_id`.
    ///
    /// Buffered messages for the id are replayed into the sink first, in
    /// order, then the sink is registered; the stream is opened if closed.
    pub fn register(&self, event_id: EventId, sink: MessageSink) {
        let mut state = self.state.lock();
        if let Some(buffered) = state.pending.remove(&event_id) {
            debug!(event_id = %event_id, count = buffered.len(), "replaying buffered messages");
            for message in buffered {
                let _ = sink.send(message);
            }
        }
        let _ = state.retired.remove(&event_id);
        let _ = state.callbacks.insert(event_id.clone(), sink);
        let _ = state.unclosed.insert(event_id);
        if state.stream.is_none() {
            self.open(&mut state);
        }
    }

    /// Drop every trace of `event_id`; closes the stream if nothing else is
    /// outstanding.
    ///
    /// Also valid for an id that never registered. Unless its
    /// `process_completed` has already been routed, the id is retired and
    /// later messages for it are dropped instead of buffered.
    pub fn unregister(&self, event_id: &EventId) {
        let mut state = self.state.lock();
        let registered = state.callbacks.remove(event_id).is_some();
        let _ = state.pending.remove(event_id);
        let outstanding = state.unclosed.remove(event_id);
        if outstanding || !registered {
            debug!(event_id = %event_id, "retiring event id");
            let _ = state.retired.insert(event_id.clone());
        }
        if state.unclosed.is_empty() {
            state.close();
        }
    }

    /// Whether the shared stream is currently open (or opening).
    pub fn is_open(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    /// Number of buffered messages for an unregistered id.
    pub fn pending_count(&self, event_id: &EventId) -> usize {
        self.state.lock().pending.get(event_id).map_or(0, Vec::len)
    }

    /// Whether `event_id` has been retired and its messages are dropped.
    pub fn is_retired(&self, event_id: &EventId) -> bool {
        self.state.lock().retired.contains(event_id)
    }

    /// Number of ids still awaiting completion.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unclosed.len()
    }

    fn open(&self, state: &mut MuxState) {
        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.stream = Some(OpenStream {
            generation,
            cancel: cancel.clone(),
        });
        debug!(generation, url = %self.url, "opening shared stream");

        let reader = StreamReader {
            http: self.http.clone(),
            url: self.url.clone(),
            token: self.token.clone(),
            state: self.state.clone(),
            generation,
            cancel,
        };
        let _ = tokio::spawn(reader.run());
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.state.lock().close();
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamMultiplexer")
            .field("url", &self.url)
            .field("open", &state.stream.is_some())
            .field("callbacks", &state.callbacks.len())
            .field("pending", &state.pending.len())
            .field("unclosed", &state.unclosed.len())
            .field("retired", &state.retired.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader task
// ─────────────────────────────────────────────────────────────────────────────

struct StreamReader {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    state: Arc<Mutex<MuxState>>,
    generation: u64,
    cancel: CancellationToken,
}

impl StreamReader {
    async fn run(self) {
        let opened = tokio::select! {
            () = self.cancel.cancelled() => return,
            opened = open_event_stream(&self.http, &self.url, self.token.as_deref()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "shared stream could not be opened");
                self.fail();
                return;
            }
        };

        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(message)) => {
                    if !self.dispatch(message) {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "shared stream errored");
                    self.fail();
                    return;
                }
                None => {
                    let outstanding = self.state.lock().unclosed.len();
                    if outstanding > 0 {
                        warn!(outstanding, "shared stream ended with jobs outstanding");
                        self.fail();
                    } else {
                        let mut state = self.state.lock();
                        if state.is_current(self.generation) {
                            state.close();
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Route one message. Returns `false` once this stream has been closed.
    fn dispatch(&self, message: Value) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(self.generation) {
            return false;
        }

        let Some(id) = WireMessage::event_id(&message).map(EventId::from) else {
            for sink in state.callbacks.values() {
                let _ = sink.send(message.clone());
            }
            return true;
        };

        if state.retired.contains(&id) {
            if WireMessage::kind_name(&message) == Some("process_completed") {
                let _ = state.retired.remove(&id);
            }
            debug!(event_id = %id, "dropping message for retired event");
            return true;
        }

        let Some(sink) = state.callbacks.get(&id).cloned() else {
            debug!(event_id = %id, "buffering message for unregistered event");
            state.pending.entry(id).or_default().push(message);
            return true;
        };

        if WireMessage::kind_name(&message) == Some("process_completed") {
            let _ = state.unclosed.remove(&id);
            if state.unclosed.is_empty() {
                state.close();
            }
        }
        let _ = sink.send(message);
        state.is_current(self.generation)
    }

    /// Broadcast a broken-connection error and close, if still current.
    fn fail(&self) {
        let mut state = self.state.lock();
        if !state.is_current(self.generation) {
            return;
        }
        let broken = json!({ "msg": "unexpected_error", "message": BROKEN_CONNECTION_MSG });
        for sink in state.callbacks.values() {
            let _ = sink.send(broken.clone());
        }
        state.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn sse_body(messages: &[Value]) -> String {
        messages.iter().map(|m| format!("data: {m}\n\n")).collect()
    }

    async fn mount_stream(server: &MockServer, messages: &[Value], times: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path("/queue/data"))
            .and(query_param("session_hash", "s1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body(messages), "text/event-stream"),
            );
        match times {
            Some(n) => mock.up_to_n_times(n).mount(server).await,
            None => mock.mount(server).await,
        }
    }

    fn mux_for(server: &MockServer) -> StreamMultiplexer {
        let url = format!("{}/queue/data?session_hash=s1", server.uri());
        StreamMultiplexer::new(reqwest::Client::new(), url, None)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("sink closed")
    }

    fn id(s: &str) -> EventId {
        EventId::from(s)
    }

    #[tokio::test]
    async fn routes_by_event_id_and_closes_when_done() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[
                json!({"msg": "process_starts", "event_id": "E1"}),
                json!({"msg": "process_completed", "event_id": "E1", "success": true, "output": {"data": []}}),
            ],
            None,
        )
        .await;

        let mux = mux_for(&server);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.register(id("E1"), tx);
        assert!(mux.is_open());

        assert_eq!(next(&mut rx).await["msg"], "process_starts");
        assert_eq!(next(&mut rx).await["msg"], "process_completed");
        assert!(!mux.is_open());
        assert_eq!(mux.outstanding(), 0);
    }

    #[tokio::test]
    async fn buffers_early_messages_and_replays_in_order() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[
                json!({"msg": "estimation", "event_id": "E2", "rank": 1}),
                json!({"msg": "process_starts", "event_id": "E2"}),
                json!({"msg": "process_completed", "event_id": "E1", "success": true, "output": {"data": []}}),
            ],
            Some(1),
        )
        .await;
        mount_stream(&server, &[], None).await;

        let mux = mux_for(&server);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        mux.register(id("E1"), tx1);
        assert_eq!(next(&mut rx1).await["msg"], "process_completed");
        assert_eq!(mux.pending_count(&id("E2")), 2);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mux.register(id("E2"), tx2);
        assert_eq!(mux.pending_count(&id("E2")), 0);
        assert_eq!(next(&mut rx2).await["msg"], "estimation");
        assert_eq!(next(&mut rx2).await["msg"], "process_starts");
    }

    #[tokio::test]
    async fn reopens_for_next_job_and_reports_eof_as_broken() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[json!({"msg": "process_completed", "event_id": "E1", "success": true, "output": {"data": []}})],
            Some(1),
        )
        .await;
        mount_stream(&server, &[json!({"msg": "heartbeat"})], None).await;

        let mux = mux_for(&server);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        mux.register(id("E1"), tx1);
        let _ = next(&mut rx1).await;
        assert!(!mux.is_open());
        mux.unregister(&id("E1"));

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mux.register(id("E2"), tx2);
        assert!(mux.is_open());

        assert_eq!(next(&mut rx2).await, json!({"msg": "heartbeat"}));
        let broken = next(&mut rx2).await;
        assert_eq!(broken["msg"], "unexpected_error");
        assert_eq!(broken["message"], BROKEN_CONNECTION_MSG);
        assert!(!mux.is_open());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn broadcasts_messages_without_event_id() {
        let server = MockServer::start().await;
        mount_stream(&server, &[json!({"msg": "heartbeat"})], None).await;

        let mux = mux_for(&server);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mux.register(id("A"), tx1);
        mux.register(id("B"), tx2);

        assert_eq!(next(&mut rx1).await["msg"], "heartbeat");
        assert_eq!(next(&mut rx2).await["msg"], "heartbeat");
    }

    #[tokio::test]
    async fn refused_stream_is_broken_for_everyone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mux = mux_for(&server);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.register(id("E1"), tx);

        let message = next(&mut rx).await;
        assert_eq!(message["msg"], "unexpected_error");
        assert!(!mux.is_open());
    }

    #[tokio::test]
    async fn unregister_last_job_closes_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("", "text/event-stream")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let mux = mux_for(&server);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        mux.register(id("A"), tx1);
        mux.register(id("B"), tx2);
        mux.unregister(&id("A"));
        assert!(mux.is_open());
        mux.unregister(&id("B"));
        assert!(!mux.is_open());
    }

    #[tokio::test]
    async fn retired_ids_drop_late_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue/data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        sse_body(&[
                            json!({"msg": "process_generating", "event_id": "A", "success": true, "output": {"data": [1]}}),
                            json!({"msg": "process_completed", "event_id": "A", "success": true, "output": {"data": [2]}}),
                            json!({"msg": "process_starts", "event_id": "B"}),
                        ]),
                        "text/event-stream",
                    )
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let mux = mux_for(&server);
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        mux.register(id("A"), tx_a);
        mux.register(id("B"), tx_b);
        mux.unregister(&id("A"));
        assert!(mux.is_retired(&id("A")));
        assert!(mux.is_open());

        assert_eq!(next(&mut rx_b).await["msg"], "process_starts");
        assert_eq!(mux.pending_count(&id("A")), 0);
        assert!(!mux.is_retired(&id("A")));
    }

    #[tokio::test]
    async fn unregister_before_register_retires_id() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[
                json!({"msg": "estimation", "event_id": "C", "rank": 0}),
                json!({"msg": "heartbeat"}),
            ],
            None,
        )
        .await;

        let mux = mux_for(&server);
        mux.unregister(&id("C"));
        assert!(mux.is_retired(&id("C")));
        assert!(!mux.is_open());

        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.register(id("D"), tx);
        assert_eq!(next(&mut rx).await["msg"], "heartbeat");
        assert_eq!(mux.pending_count(&id("C")), 0);
        assert!(mux.is_retired(&id("C")));
    }

    #[tokio::test]
    async fn interleaved_jobs_each_see_connection_order() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[
                json!({"msg": "estimation", "event_id": "A", "rank": 2}),
                json!({"msg": "estimation", "event_id": "B", "rank": 5}),
                json!({"msg": "estimation", "event_id": "A", "rank": 1}),
                json!({"msg": "estimation", "event_id": "B", "rank": 4}),
                json!({"msg": "estimation", "event_id": "A", "rank": 0}),
            ],
            None,
        )
        .await;

        let mux = mux_for(&server);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        mux.register(id("A"), tx_a);
        mux.register(id("B"), tx_b);

        let mut ranks_a = Vec::new();
        for _ in 0..3 {
            ranks_a.push(next(&mut rx_a).await["rank"].clone());
        }
        let mut ranks_b = Vec::new();
        for _ in 0..2 {
            ranks_b.push(next(&mut rx_b).await["rank"].clone());
        }
        assert_eq!(ranks_a, vec![json!(2), json!(1), json!(0)]);
        assert_eq!(ranks_b, vec![json!(5), json!(4)]);
    }
}
