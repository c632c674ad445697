//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is accepted and missing fields take their default value.

use serde::{Deserialize, Serialize};

/// Root settings for the job client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// HTTP client tuning.
    pub http: HttpSettings,
    /// Upload batching.
    pub upload: UploadSettings,
    /// Wire protocol handling.
    pub protocol: ProtocolSettings,
    /// Hub API used for endpoint resolution and admin helpers.
    pub hub: HubSettings,
    /// Logging defaults.
    pub logging: LoggingSettings,
}

/// HTTP client tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Timeout for plain request/response calls, in milliseconds.
    /// Streams are not subject to it.
    pub request_timeout_ms: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            user_agent: concat!("queuelink/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Upload batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    /// Files sent per multipart request.
    pub chunk_size: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self { chunk_size: 1000 }
    }
}

/// What to do with wire messages whose kind the client does not know.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownMessagePolicy {
    /// Drop silently.
    Ignore,
    /// Drop and log a warning.
    #[default]
    Warn,
    /// Fail the job with an `error` status.
    Fail,
}

/// Wire protocol handling.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// Handling of unrecognized message kinds.
    pub unknown_messages: UnknownMessagePolicy,
}

/// Hub API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Base URL of the hub API.
    pub base_url: String,
    /// Delay between space status polls, in milliseconds.
    pub status_poll_interval_ms: u64,
    /// Sleep timeout applied to duplicated spaces, in seconds.
    pub default_sleep_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            base_url: "https://huggingface.co".to_string(),
            status_poll_interval_ms: 1000,
            default_sleep_timeout_secs: 300,
        }
    }
}

/// Logging defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
