//! JSON POST helper and HTTP client construction.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use queuelink_core::constants::BROKEN_CONNECTION_MSG;
use queuelink_settings::HttpSettings;

/// Body and status of a JSON POST.
///
/// Network failures and unparseable bodies are folded into a synthetic
/// `{"error": ...}` body, so callers only branch on status. Status 500 stands
/// in for network failures and unparseable success bodies.
#[derive(Clone, Debug, PartialEq)]
pub struct PostResponse {
    /// Parsed response body.
    pub body: Value,
    /// HTTP status code.
    pub status: u16,
}

impl PostResponse {
    /// Whether the service answered 200.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// The `error` field of the body as text, if any.
    pub fn error_message(&self) -> Option<String> {
        match self.body.get("error")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn broken() -> Self {
        Self {
            body: json!({ "error": BROKEN_CONNECTION_MSG }),
            status: 500,
        }
    }
}

/// Build the shared `reqwest` client.
///
/// No overall timeout is set here, since event streams stay open for the
/// lifetime of a job; request/response calls apply
/// [`HttpSettings::request_timeout_ms`] per request.
///
/// If the configured client cannot be built (for instance an invalid user
/// agent), the error is logged and a default client is returned.
pub fn build_http_client(settings: &HttpSettings) -> reqwest::Client {
    let built = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
        .user_agent(settings.user_agent.clone())
        .build();
    match built {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "could not build configured HTTP client, using defaults");
            reqwest::Client::default()
        }
    }
}

/// POST `body` as JSON to `url`.
pub async fn post_data<B: Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
    token: Option<&str>,
    timeout: Duration,
) -> PostResponse {
    let mut request = http.post(url).json(body).timeout(timeout);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url, error = %e, "POST failed");
            return PostResponse::broken();
        }
    };
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => PostResponse {
            body,
            status: status.as_u16(),
        },
        // Keep error statuses; 503 means a full queue.
        Err(e) => PostResponse {
            body: json!({ "error": format!("Could not parse server response: {e}") }),
            status: if status.is_success() { 500 } else { status.as_u16() },
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
