//! Service-facing message constants.
//!
//! These strings are shown to end users through `error` statuses and are
//! kept identical to what the service's own frontends display.

/// Reported when the queue rejects a job for capacity (HTTP 503 or `queue_full`).
pub const QUEUE_FULL_MSG: &str = "This application is too busy. Keep trying!";

/// Reported for any transport-level failure.
pub const BROKEN_CONNECTION_MSG: &str = "Connection errored out.";

/// Reported when processing a message fails locally or the service sends
/// `unexpected_error` without a message.
pub const UNEXPECTED_ERROR_MSG: &str = "An Unexpected Error Occurred!";

/// Version assumed for services whose config omits one.
pub const DEFAULT_SERVICE_VERSION: &str = "2.0.0";

/// Services older than this expect the session hash on socket open.
pub const SOCKET_HASH_ON_OPEN_BELOW: &str = "3.6";

/// Services older than this have no `/info` endpoint.
pub const INFO_ENDPOINT_SINCE: &str = "3.30";
