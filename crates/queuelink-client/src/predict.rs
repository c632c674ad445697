//! Single-shot request/response on top of a [`Job`].
//!
//! Resolves with the latest output snapshot once the job completes, in
//! whichever order the data and the terminal status arrive.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use queuelink_core::{EventKind, JobEvent, Listener, Stage};

use crate::errors::{ClientError, Result};
use crate::job::Job;

#[derive(Default)]
struct Tracker {
    data: Option<Vec<Value>>,
    complete: bool,
    tx: Option<oneshot::Sender<Result<Vec<Value>>>>,
}

impl Tracker {
    fn settle(&mut self, outcome: Result<Vec<Value>>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    fn on_event(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Data(data) => {
                if self.complete {
                    self.settle(Ok(data.data.clone()));
                } else {
                    self.data = Some(data.data.clone());
                }
            }
            JobEvent::Status(status) => match status.stage {
                Stage::Error => self.settle(Err(ClientError::Job(status.clone()))),
                Stage::Complete => {
                    self.complete = true;
                    if let Some(data) = self.data.take() {
                        self.settle(Ok(data));
                    }
                }
                _ => {}
            },
            JobEvent::Log(_) => {}
        }
    }
}

/// Start `job` and wait for its result.
///
/// Listeners registered here are removed before returning.
pub(crate) async fn run(job: Job) -> Result<Vec<Value>> {
    let (tx, mut rx) = oneshot::channel();
    let tracker = Arc::new(Mutex::new(Tracker {
        tx: Some(tx),
        ..Tracker::default()
    }));
    let listener: Listener = {
        let tracker = tracker.clone();
        Arc::new(move |event: &JobEvent| tracker.lock().on_event(event))
    };
    let _ = job
        .on(EventKind::Data, &listener)
        .on(EventKind::Status, &listener);
    job.start();

    let outcome = tokio::select! {
        biased;
        outcome = &mut rx => outcome.ok(),
        () = job.finished() => rx.try_recv().ok(),
    };
    job.destroy();
    debug!(fn_index = job.fn_index(), settled = outcome.is_some(), "predict finished");
    outcome.unwrap_or(Err(ClientError::NoResult))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use queuelink_core::{DataEvent, Status};
    use serde_json::json;

    fn tracked() -> (Tracker, oneshot::Receiver<Result<Vec<Value>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Tracker {
                tx: Some(tx),
                ..Tracker::default()
            },
            rx,
        )
    }

    fn data(v: Value) -> JobEvent {
        JobEvent::Data(DataEvent { data: vec![v] })
    }

    fn status(stage: Stage) -> JobEvent {
        JobEvent::Status(Status::new(stage, true))
    }

    #[test]
    fn data_then_complete() {
        let (mut t, mut rx) = tracked();
        t.on_event(&data(json!(1)));
        t.on_event(&data(json!(2)));
        assert!(rx.try_recv().is_err());
        t.on_event(&status(Stage::Complete));
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![json!(2)]);
    }

    #[test]
    fn complete_then_data() {
        let (mut t, mut rx) = tracked();
        t.on_event(&status(Stage::Pending));
        t.on_event(&status(Stage::Complete));
        assert!(rx.try_recv().is_err());
        t.on_event(&data(json!("late")));
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![json!("late")]);
    }

    #[test]
    fn error_rejects() {
        let (mut t, mut rx) = tracked();
        t.on_event(&JobEvent::Status(Status::error("boom", true)));
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_matches!(err, ClientError::Job(ref s) if s.message.as_deref() == Some("boom"));
        assert_eq!(err.to_string(), "job failed: boom");
    }

    #[test]
    fn settles_once() {
        let (mut t, mut rx) = tracked();
        t.on_event(&data(json!(1)));
        t.on_event(&status(Stage::Complete));
        t.on_event(&JobEvent::Status(Status::error("late", true)));
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![json!(1)]);
    }
}
