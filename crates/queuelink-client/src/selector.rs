//! Transport selection.

use crate::config::{AppConfig, Protocol};

/// Execution path for one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Single request/response call, bypassing the queue.
    Direct,
    /// Dedicated socket to `/queue/join`.
    WebSocket,
    /// Dedicated event stream to `/queue/join`.
    Sse,
    /// Shared multiplexed event stream.
    SseV1,
    /// Shared multiplexed event stream with diff-compressed outputs.
    SseV2,
}

impl Transport {
    /// Whether the job joins the shared multiplexed stream.
    pub fn is_shared_stream(self) -> bool {
        matches!(self, Self::SseV1 | Self::SseV2)
    }

    /// Whether intermediate outputs arrive as diffs.
    pub fn uses_diffs(self) -> bool {
        self == Self::SseV2
    }

    /// Whether queue statuses are reported (`queue: true`).
    pub fn is_queued(self) -> bool {
        self != Self::Direct
    }
}

/// Pick the transport for job `fn_index`.
pub fn select_transport(config: &AppConfig, fn_index: usize) -> Transport {
    if config.skip_queue(fn_index) {
        return Transport::Direct;
    }
    match config.protocol {
        Protocol::Ws => Transport::WebSocket,
        Protocol::Sse => Transport::Sse,
        Protocol::SseV1 => Transport::SseV1,
        Protocol::SseV2 => Transport::SseV2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> AppConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unqueued_job_goes_direct() {
        let cfg = config(json!({"enable_queue": true, "protocol": "sse_v2", "dependencies": [{"queue": false}]}));
        assert_eq!(select_transport(&cfg, 0), Transport::Direct);
    }

    #[test]
    fn disabled_queue_goes_direct_unless_forced() {
        let cfg = config(json!({"enable_queue": false, "protocol": "sse", "dependencies": [{}, {"queue": true}]}));
        assert_eq!(select_transport(&cfg, 0), Transport::Direct);
        assert_eq!(select_transport(&cfg, 1), Transport::Sse);
    }

    #[test]
    fn protocol_picks_stream_variant() {
        for (protocol, expected) in [
            ("ws", Transport::WebSocket),
            ("sse", Transport::Sse),
            ("sse_v1", Transport::SseV1),
            ("sse_v2", Transport::SseV2),
        ] {
            let cfg = config(json!({"enable_queue": true, "protocol": protocol}));
            assert_eq!(select_transport(&cfg, 0), expected, "protocol {protocol}");
        }
    }

    #[test]
    fn transport_traits() {
        assert!(Transport::SseV1.is_shared_stream());
        assert!(!Transport::Sse.is_shared_stream());
        assert!(Transport::SseV2.uses_diffs());
        assert!(!Transport::SseV1.uses_diffs());
        assert!(!Transport::Direct.is_queued());
    }
}
