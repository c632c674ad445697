//! Hub administration: space lifecycle polling, hardware, sleep timeout,
//! duplication.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::endpoint::SpaceRef;
use crate::errors::{ClientError, Result};

/// Hardware tiers a space can run on.
pub const HARDWARE_TYPES: &[&str] = &[
    "cpu-basic",
    "cpu-upgrade",
    "t4-small",
    "t4-medium",
    "a10g-small",
    "a10g-large",
    "a100-large",
];

/// Tier used when neither the caller nor the original space names one.
pub const DEFAULT_HARDWARE: &str = "cpu-basic";

// ─────────────────────────────────────────────────────────────────────────────
// Space status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a hosted space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceState {
    /// Stopped or asleep; waking up.
    Sleeping,
    /// Being built.
    Building,
    /// Serving requests.
    Running,
    /// Paused by its owner.
    Paused,
    /// Reported an unknown runtime stage.
    SpaceError,
    /// Its status could not be fetched.
    Error,
}

/// Coarse load progress matching a [`SpaceState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Still coming up.
    Pending,
    /// Ready.
    Complete,
    /// Will not come up without intervention.
    Error,
}

/// One observation of a space's lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStatus {
    /// Lifecycle state.
    pub status: SpaceState,
    /// Load progress.
    pub load_status: LoadStatus,
    /// Human-readable explanation.
    pub message: String,
    /// Raw runtime stage reported by the hub.
    pub detail: String,
    /// Whether the space accepts discussions (reported when it is unusable).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discussions_enabled: Option<bool>,
}

impl SpaceStatus {
    fn new(status: SpaceState, load_status: LoadStatus, message: &str, detail: &str) -> Self {
        Self {
            status,
            load_status,
            message: message.to_string(),
            detail: detail.to_string(),
            discussions_enabled: None,
        }
    }

    /// Whether polling should continue.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, SpaceState::Sleeping | SpaceState::Building)
    }
}

/// Receives each space status observation.
pub type SpaceStatusCallback = Arc<dyn Fn(&SpaceStatus) + Send + Sync>;

#[derive(Deserialize)]
struct Runtime {
    #[serde(default)]
    stage: String,
    #[serde(default)]
    hardware: Option<HardwareInfo>,
}

#[derive(Deserialize)]
struct HardwareInfo {
    current: Option<String>,
}

#[derive(Deserialize)]
struct SpaceInfo {
    id: String,
    runtime: Runtime,
}

/// Options for [`HubClient::duplicate_space`].
#[derive(Clone, Debug, Default)]
pub struct DuplicateOptions {
    /// Make the copy private.
    pub private: bool,
    /// Hardware tier for the copy; defaults to the original's.
    pub hardware: Option<String>,
    /// Sleep timeout in seconds; defaults to the configured value.
    pub timeout_secs: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub client
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticated access to the hub API.
#[derive(Clone, Debug)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HubClient {
    /// Create a client against `base_url`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}{path}", self.base_url)))
    }

    fn post(&self, path: &str, body: &Value) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(format!("{}{path}", self.base_url)).json(body))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn require_token(&self) -> Result<()> {
        if self.token.is_none() {
            return Err(ClientError::Hub("a hub token is required".into()));
        }
        Ok(())
    }

    /// Name of the account owning the token.
    pub async fn whoami(&self) -> Result<String> {
        self.require_token()?;
        let response = self.get("/api/whoami-v2").send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Hub(format!(
                "could not identify token owner: {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        body.get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Hub("whoami answered without a name".into()))
    }

    /// Current hardware tier of `space_id`.
    pub async fn get_space_hardware(&self, space_id: &str) -> Result<Option<String>> {
        let response = self
            .get(&format!("/api/spaces/{space_id}/runtime"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Hub("space hardware could not be obtained".into()));
        }
        let runtime: Runtime = response.json().await?;
        Ok(runtime.hardware.and_then(|h| h.current))
    }

    /// Request hardware tier `hardware` for `space_id`.
    pub async fn set_space_hardware(&self, space_id: &str, hardware: &str) -> Result<()> {
        if !HARDWARE_TYPES.contains(&hardware) {
            return Err(ClientError::Hub(format!(
                "invalid hardware type '{hardware}', valid types are: {}",
                HARDWARE_TYPES.join(", ")
            )));
        }
        let response = self
            .post(
                &format!("/api/spaces/{space_id}/hardware"),
                &json!({ "hardware": hardware }),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Hub("space hardware could not be set".into()));
        }
        info!(space = space_id, hardware, "space hardware set");
        Ok(())
    }

    /// Set the idle time after which `space_id` goes to sleep.
    pub async fn set_space_timeout(&self, space_id: &str, seconds: u64) -> Result<()> {
        let response = self
            .post(
                &format!("/api/spaces/{space_id}/sleeptime"),
                &json!({ "seconds": seconds }),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Hub("space sleep timeout could not be set".into()));
        }
        debug!(space = space_id, seconds, "space sleep timeout set");
        Ok(())
    }

    /// Whether `space_id` accepts discussions. Failures count as disabled.
    pub async fn discussions_enabled(&self, space_id: &str) -> bool {
        let url = format!("{}/api/spaces/{space_id}/discussions", self.base_url);
        match self.authorize(self.http.head(&url)).send().await {
            Ok(response) => !response
                .headers()
                .get("x-error-message")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|msg| {
                    let msg = msg.to_ascii_lowercase();
                    msg.contains("discussion") && msg.contains("disabled")
                }),
            Err(e) => {
                debug!(space = space_id, error = %e, "discussions check failed");
                false
            }
        }
    }

    async fn observe(&self, space: &SpaceRef) -> SpaceStatus {
        let path = match space {
            SpaceRef::Name(id) => format!("/api/spaces/{id}"),
            SpaceRef::Subdomain(sub) => format!("/api/spaces/by-subdomain/{sub}"),
        };
        let fetched = async {
            let response = self.get(&path).send().await?;
            if response.status() != reqwest::StatusCode::OK {
                return Ok(None);
            }
            response.json::<SpaceInfo>().await.map(Some)
        }
        .await;
        let info = match fetched {
            Ok(Some(info)) => info,
            Ok(None) => {
                return SpaceStatus::new(
                    SpaceState::Error,
                    LoadStatus::Error,
                    "Could not get space status",
                    "NOT_FOUND",
                );
            }
            Err(e) => {
                warn!(space = space.as_str(), error = %e, "space status fetch failed");
                return SpaceStatus::new(
                    SpaceState::Error,
                    LoadStatus::Error,
                    "Could not get space status",
                    "NOT_FOUND",
                );
            }
        };

        let stage = info.runtime.stage.as_str();
        let mut status = match stage {
            "STOPPED" | "SLEEPING" => SpaceStatus::new(
                SpaceState::Sleeping,
                LoadStatus::Pending,
                "Space is asleep. Waking it up...",
                stage,
            ),
            "BUILDING" => SpaceStatus::new(
                SpaceState::Building,
                LoadStatus::Pending,
                "Space is building...",
                stage,
            ),
            "RUNNING" | "RUNNING_BUILDING" => {
                SpaceStatus::new(SpaceState::Running, LoadStatus::Complete, "", stage)
            }
            "PAUSED" => SpaceStatus::new(
                SpaceState::Paused,
                LoadStatus::Error,
                "This space has been paused by the author. If you would like to try this demo, consider duplicating the space.",
                stage,
            ),
            _ => SpaceStatus::new(
                SpaceState::SpaceError,
                LoadStatus::Error,
                "This space is experiencing an issue.",
                stage,
            ),
        };
        if status.load_status == LoadStatus::Error {
            status.discussions_enabled = Some(self.discussions_enabled(&info.id).await);
        }
        status
    }

    /// Poll `space` until it is running or will not come up.
    ///
    /// Each observation is reported to `callback`; the last one is returned.
    pub async fn check_space_status(
        &self,
        space: &SpaceRef,
        interval: Duration,
        callback: Option<&SpaceStatusCallback>,
    ) -> SpaceStatus {
        loop {
            let status = self.observe(space).await;
            debug!(space = space.as_str(), state = ?status.status, detail = %status.detail, "space status");
            if let Some(callback) = callback {
                callback(&status);
            }
            if !status.is_transient() {
                return status;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Duplicate `space_id` into the token owner's namespace.
    ///
    /// Returns the reference to connect to. An existing copy is reused.
    pub async fn duplicate_space(
        &self,
        space_id: &str,
        options: &DuplicateOptions,
        default_timeout_secs: u64,
    ) -> Result<String> {
        if let Some(hardware) = &options.hardware {
            if !HARDWARE_TYPES.contains(&hardware.as_str()) {
                return Err(ClientError::Hub(format!(
                    "invalid hardware type '{hardware}', valid types are: {}",
                    HARDWARE_TYPES.join(", ")
                )));
            }
        }
        let user = self.whoami().await?;
        let space_name = space_id
            .split('/')
            .nth(1)
            .ok_or_else(|| ClientError::Hub(format!("'{space_id}' is not an owner/name id")))?;
        let target = format!("{user}/{space_name}");

        let mut body = json!({ "repository": target });
        if options.private {
            body["private"] = Value::Bool(true);
        }
        let response = self
            .post(&format!("/api/spaces/{space_id}/duplicate"), &body)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            info!(space = %target, "space already duplicated");
            return Ok(target);
        }
        if !response.status().is_success() {
            return Err(ClientError::Hub(format!(
                "could not duplicate {space_id}: {}",
                response.status()
            )));
        }
        let created: Value = response.json().await?;

        let hardware = match &options.hardware {
            Some(hardware) => hardware.clone(),
            None => self
                .get_space_hardware(space_id)
                .await?
                .unwrap_or_else(|| DEFAULT_HARDWARE.to_string()),
        };
        self.set_space_hardware(&target, &hardware).await?;
        self.set_space_timeout(&target, options.timeout_secs.unwrap_or(default_timeout_secs))
            .await?;
        info!(from = space_id, to = %target, "space duplicated");

        Ok(created
            .get("url")
            .and_then(Value::as_str)
            .map_or(target, str::to_string))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
