//! # Job Session
//!
//! One submitted job: its listener registry, its state machine, and the
//! driver task running it over the selected transport.
//!
//! ```text
//! idle ─start─▶ awaiting-upload ─▶ pending ─▶ generating* ─▶ complete | error
//! ```
//!
//! Delivery rules enforced here, whatever the transport:
//! - `complete` and `error` are terminal and sticky: after either, no status
//!   or data event is delivered.
//! - Stages never move backwards; a late `pending`-stage update observed
//!   while generating is reported at the current stage.
//! - A `complete` status waits for its accompanying data and is delivered
//!   right after it.

mod direct;
mod legacy_sse;
mod shared_sse;
mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use queuelink_core::constants::{BROKEN_CONNECTION_MSG, UNEXPECTED_ERROR_MSG};
use queuelink_core::{
    DataEvent, DiffReconstructor, EventId, EventKind, InterpretedKind, JobEvent, Listener,
    ListenerRegistry, LogEvent, Stage, Status, WireMessage, interpret,
};
use queuelink_settings::UnknownMessagePolicy;

use crate::selector::Transport;
use crate::session::ClientShared;
use crate::upload::{InputValue, handle_blobs};

// ─────────────────────────────────────────────────────────────────────────────
// Public handle
// ─────────────────────────────────────────────────────────────────────────────

/// Inputs and extras for one submission.
#[derive(Clone, Debug, Default)]
pub struct JobRequest {
    /// One value per declared input.
    pub data: Vec<InputValue>,
    /// Event payload forwarded to the service untouched.
    pub event_data: Option<Value>,
    /// Id of the UI trigger, when submitting on behalf of one.
    pub trigger_id: Option<u64>,
}

impl JobRequest {
    /// A request with only input data.
    pub fn new(data: Vec<InputValue>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Handle to one submitted job. Cheap to clone.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        fn_index: usize,
        route: String,
        transport: Transport,
        request: JobRequest,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                shared,
                fn_index,
                route,
                transport,
                listeners: ListenerRegistry::new(),
                delivery: ReentrantMutex::new(()),
                state: Mutex::new(JobState::default()),
                request: Mutex::new(Some(request)),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
            }),
        }
    }

    /// Register `listener` for `kind`. Returns `self` for chaining.
    pub fn on(&self, kind: EventKind, listener: &Listener) -> &Self {
        self.inner.listeners.add(kind, listener.clone());
        self
    }

    /// Unregister every registration of `listener` under `kind`.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> &Self {
        self.inner.listeners.remove(kind, listener);
        self
    }

    /// Unregister all listeners of all kinds. Idempotent.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
    }

    /// Launch the job. Later calls are no-ops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(fn_index = self.inner.fn_index, "job already started");
            return;
        }
        let inner = self.inner.clone();
        let _ = tokio::spawn(async move {
            let _done = inner.finished.clone().drop_guard();
            inner.drive().await;
        });
    }

    /// Cancel the job.
    ///
    /// A terminal `complete` status is delivered immediately; the transport is
    /// then torn down and the service asked to reset the job. Reset failures
    /// are logged, never reported to listeners.
    pub async fn cancel(&self) {
        let inner = &self.inner;
        let _ = inner.emit_status(Status::new(Stage::Complete, false));
        inner.cancel.cancel();

        let shared = &inner.shared;
        let body = if inner.transport == Transport::WebSocket {
            json!({ "fn_index": inner.fn_index, "session_hash": shared.session_hash })
        } else {
            json!({ "event_id": inner.event_id() })
        };
        let url = format!("{}/reset", shared.config.root);
        let mut request = shared
            .http
            .post(&url)
            .json(&body)
            .timeout(shared.request_timeout());
        if let Some(token) = &shared.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(fn_index = inner.fn_index, "job reset");
            }
            Ok(response) => warn!(
                status = response.status().as_u16(),
                "reset endpoint refused; subsequent results may be unreliable"
            ),
            Err(e) => warn!(
                error = %e,
                "reset endpoint could not be called; subsequent results may be unreliable"
            ),
        }
    }

    /// Wait until the driver task has exited.
    pub async fn finished(&self) {
        self.inner.finished.cancelled().await;
    }

    /// Function index of the job.
    pub fn fn_index(&self) -> usize {
        self.inner.fn_index
    }

    /// Transport the job runs over.
    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    /// Event id assigned by the service, once known.
    pub fn event_id(&self) -> Option<EventId> {
        self.inner.event_id()
    }

    /// Last stage delivered to listeners.
    pub fn stage(&self) -> Option<Stage> {
        self.inner.state.lock().last_stage
    }

    /// Whether a terminal status has been delivered.
    pub fn is_terminal(&self) -> bool {
        self.inner.is_terminal()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("fn_index", &self.inner.fn_index)
            .field("transport", &self.inner.transport)
            .field("stage", &self.stage())
            .field("listeners", &self.inner.listeners)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct JobState {
    last_stage: Option<Stage>,
    terminal: bool,
    /// `complete` status held back until its data has been delivered.
    held_complete: Option<Status>,
    event_id: Option<EventId>,
}

/// What the transport should do after a message has been processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Keep reading.
    Continue,
    /// Reply with the session hash.
    SendHash,
    /// Reply with the payload.
    SendData,
    /// Tear the transport down.
    Close,
}

/// Body sent to the service for every submission.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct Payload {
    pub data: Vec<Value>,
    pub event_data: Option<Value>,
    pub fn_index: usize,
    pub trigger_id: Option<u64>,
    pub session_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

pub(crate) struct JobInner {
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) fn_index: usize,
    pub(crate) route: String,
    pub(crate) transport: Transport,
    listeners: ListenerRegistry,
    /// Serializes delivery so no event can slip past a terminal status.
    delivery: ReentrantMutex<()>,
    state: Mutex<JobState>,
    request: Mutex<Option<JobRequest>>,
    started: AtomicBool,
    pub(crate) cancel: CancellationToken,
    finished: CancellationToken,
}

impl JobInner {
    async fn drive(&self) {
        let Some(request) = self.request.lock().take() else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let shared = &self.shared;

        let uploaded = tokio::select! {
            () = self.cancel.cancelled() => return,
            uploaded = handle_blobs(
                shared.uploader.as_ref(),
                &shared.config.root,
                request.data,
                shared.token.as_deref(),
            ) => uploaded,
        };
        let data = match uploaded {
            Ok(data) => data,
            Err(e) => {
                warn!(fn_index = self.fn_index, error = %e, "upload failed");
                self.fail_broken();
                return;
            }
        };

        let payload = Payload {
            data,
            event_data: request.event_data,
            fn_index: self.fn_index,
            trigger_id: request.trigger_id,
            session_hash: shared.session_hash.to_string(),
            event_id: None,
        };
        debug!(fn_index = self.fn_index, transport = ?self.transport, "submitting job");

        match self.transport {
            Transport::Direct => direct::run(self, payload).await,
            Transport::WebSocket => websocket::run(self, payload).await,
            Transport::Sse => legacy_sse::run(self, payload).await,
            Transport::SseV1 | Transport::SseV2 => shared_sse::run(self, payload).await,
        }
    }

    fn queued(&self) -> bool {
        self.transport.is_queued()
    }

    pub(crate) fn event_id(&self) -> Option<EventId> {
        self.state.lock().event_id.clone()
    }

    pub(crate) fn set_event_id(&self, event_id: EventId) {
        self.state.lock().event_id = Some(event_id);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.lock().terminal
    }

    // ── Delivery ─────────────────────────────────────────────────────────

    /// Deliver a status. Returns `false` if it was suppressed because the
    /// job is already terminal.
    pub(crate) fn emit_status(&self, mut status: Status) -> bool {
        let _delivery = self.delivery.lock();
        {
            let mut state = self.state.lock();
            if state.terminal {
                return false;
            }
            if let Some(last) = state.last_stage {
                if !status.is_terminal() && status.stage.rank() < last.rank() {
                    status.stage = last;
                }
            }
            state.last_stage = Some(status.stage);
            state.terminal = status.is_terminal();
        }
        self.listeners.fire(&JobEvent::Status(status));
        true
    }

    /// Deliver an output snapshot unless the job is terminal.
    pub(crate) fn emit_data(&self, data: Vec<Value>) -> bool {
        let _delivery = self.delivery.lock();
        if self.is_terminal() {
            return false;
        }
        self.listeners.fire(&JobEvent::Data(DataEvent { data }));
        true
    }

    fn emit_log(&self, log: LogEvent) {
        let _delivery = self.delivery.lock();
        self.listeners.fire(&JobEvent::Log(log));
    }

    /// Fail with a broken-connection status.
    pub(crate) fn fail_broken(&self) {
        let _ = self.emit_status(Status::broken(BROKEN_CONNECTION_MSG, self.queued()));
    }

    /// Fail after a local processing error.
    pub(crate) fn fail_unexpected(&self) {
        let _ = self.emit_status(Status::error(UNEXPECTED_ERROR_MSG, self.queued()));
    }

    // ── Message processing ───────────────────────────────────────────────

    /// Process one raw wire message.
    ///
    /// `diffs` is given on the diff-capable transport; intermediate outputs
    /// are then rebuilt into full snapshots before delivery.
    pub(crate) fn process(&self, raw: &Value, diffs: Option<&mut DiffReconstructor>) -> Step {
        use InterpretedKind as K;

        let message = match WireMessage::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                error!(fn_index = self.fn_index, error = %e, "malformed wire message");
                self.fail_unexpected();
                return Step::Close;
            }
        };
        let last_stage = self.state.lock().last_stage;
        let interpreted = interpret(&message, last_stage);
        debug!(fn_index = self.fn_index, kind = ?interpreted.kind, "wire message");

        match interpreted.kind {
            K::Heartbeat => return Step::Continue,
            K::HashRequest => return Step::SendHash,
            K::DataRequest => return Step::SendData,
            K::Log => {
                if let Some(log) = interpreted.log {
                    self.emit_log(log);
                }
                return Step::Continue;
            }
            K::None => return self.unknown_message(raw),
            K::UnexpectedError => {
                let status = interpreted
                    .status
                    .unwrap_or_else(|| Status::error(UNEXPECTED_ERROR_MSG, self.queued()));
                warn!(
                    fn_index = self.fn_index,
                    message = status.message.as_deref().unwrap_or_default(),
                    "unexpected error from service"
                );
                let _ = self.emit_status(status);
                return Step::Close;
            }
            K::Update => {
                if let Some(status) = interpreted.status {
                    if self.state.lock().held_complete.is_none() {
                        let is_error = status.stage == Stage::Error;
                        let _ = self.emit_status(status);
                        if is_error {
                            return Step::Close;
                        }
                    }
                }
            }
            K::Complete => {
                self.state.lock().held_complete = interpreted.status;
            }
            K::Generating => {
                if let Some(status) = interpreted.status {
                    let failed = status.stage == Stage::Error;
                    let _ = self.emit_status(status);
                    if failed {
                        return Step::Close;
                    }
                }
            }
        }

        if let Some(mut output) = interpreted.data {
            if interpreted.kind == K::Generating {
                if let (Some(diffs), Some(event_id)) = (diffs, self.event_id()) {
                    if let Err(e) = diffs.apply(&event_id, &mut output) {
                        error!(fn_index = self.fn_index, error = %e, "could not apply output diff");
                        self.fail_unexpected();
                        return Step::Close;
                    }
                }
            }
            let slots = match output.get_mut("data").map(Value::take) {
                Some(Value::Array(slots)) => slots,
                _ => Vec::new(),
            };
            let _ = self.emit_data(slots);
        } else if interpreted.kind == K::Complete {
            // A failed completion carries no data; nothing will follow it.
            let held = self.state.lock().held_complete.take();
            if let Some(status) = held {
                let _ = self.emit_status(status);
            }
            return Step::Close;
        }

        let held = self.state.lock().held_complete.take();
        if let Some(status) = held {
            let _ = self.emit_status(status);
            return Step::Close;
        }

        if self.is_terminal() {
            Step::Close
        } else {
            Step::Continue
        }
    }

    fn unknown_message(&self, raw: &Value) -> Step {
        let kind = WireMessage::kind_name(raw).unwrap_or("<missing>");
        match self.shared.settings.protocol.unknown_messages {
            UnknownMessagePolicy::Ignore => Step::Continue,
            UnknownMessagePolicy::Warn => {
                warn!(fn_index = self.fn_index, kind, "ignoring unknown message kind");
                Step::Continue
            }
            UnknownMessagePolicy::Fail => {
                warn!(fn_index = self.fn_index, kind, "failing job on unknown message kind");
                let _ = self.emit_status(Status::error(
                    format!("Unknown message kind: {kind}"),
                    self.queued(),
                ));
                Step::Close
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
