//! # Client Session
//!
//! Top-level handle to one remote app. Resolves the app's endpoint and
//! descriptor, owns the session hash and the name → index map, and creates
//! [`Job`]s.
//!
//! ```text
//! Client::connect ─▶ resolve_endpoint ─▶ resolve_config ─┬─▶ Client
//!                                                        └─ (space) check_space_status ─▶ retry
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use queuelink_core::SessionHash;
use queuelink_settings::{ClientSettings, get_settings};

use crate::admin::{DuplicateOptions, HubClient, SpaceState, SpaceStatusCallback};
use crate::api_info::{ApiInfo, fetch_api_info};
use crate::config::{AppConfig, JobRef, map_names_to_ids, resolve_config};
use crate::endpoint::{Endpoint, SpaceRef, fetch_jwt, resolve_endpoint};
use crate::errors::{ClientError, Result};
use crate::http::build_http_client;
use crate::job::{Job, JobRequest};
use crate::mux::StreamMultiplexer;
use crate::predict;
use crate::selector::select_transport;
use crate::upload::{HttpUploader, InputValue, Uploader};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Options for [`Client::connect`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Hub or app access token.
    pub token: Option<String>,
    /// Settings; the global settings are used when absent.
    pub settings: Option<ClientSettings>,
    /// Receives space lifecycle observations while waiting for a space.
    pub status_callback: Option<SpaceStatusCallback>,
    /// Blob uploader; a multipart HTTP uploader is used when absent.
    pub uploader: Option<Arc<dyn Uploader>>,
}

impl ClientOptions {
    /// Set the access token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use explicit settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Report space lifecycle observations to `callback`.
    #[must_use]
    pub fn with_status_callback(mut self, callback: SpaceStatusCallback) -> Self {
        self.status_callback = Some(callback);
        self
    }

    /// Upload blobs through `uploader`.
    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }
}

/// Extras for [`Client::prepare`] and [`Client::submit`] beyond input data.
#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    /// Event payload forwarded to the service.
    pub event_data: Option<Value>,
    /// UI trigger id.
    pub trigger_id: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by a client and every job it creates.
pub(crate) struct ClientShared {
    pub(crate) http: reqwest::Client,
    pub(crate) settings: ClientSettings,
    pub(crate) endpoint: Endpoint,
    pub(crate) config: AppConfig,
    pub(crate) api_map: HashMap<String, usize>,
    pub(crate) session_hash: SessionHash,
    pub(crate) token: Option<String>,
    pub(crate) jwt: Option<String>,
    pub(crate) uploader: Arc<dyn Uploader>,
    mux: OnceLock<StreamMultiplexer>,
    api_info: RwLock<Option<Arc<ApiInfo>>>,
}

impl ClientShared {
    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.http.request_timeout_ms)
    }

    /// The session's shared stream, created on first use.
    pub(crate) fn mux(&self) -> &StreamMultiplexer {
        self.mux.get_or_init(|| {
            let url = format!(
                "{}/queue/data?session_hash={}",
                self.config.root, self.session_hash
            );
            StreamMultiplexer::new(self.http.clone(), url, self.token.clone())
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Connection to one remote app. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("root", &self.shared.config.root)
            .field("protocol", &self.shared.config.protocol)
            .field("session_hash", &self.shared.session_hash)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the app named by `reference`: a URL, a bare host, or a hub
    /// space id (`owner/name`).
    ///
    /// When the descriptor cannot be fetched and the app is a hub space, the
    /// space is polled until it runs, then the fetch is retried.
    pub async fn connect(reference: &str, options: ClientOptions) -> Result<Self> {
        let settings = options
            .settings
            .clone()
            .unwrap_or_else(|| get_settings().clone());
        let http = build_http_client(&settings.http);
        let token = options.token.as_deref();
        let hub_base = settings.hub.base_url.trim_end_matches('/');

        let endpoint = resolve_endpoint(&http, hub_base, reference, token).await?;
        let base = endpoint.http_base();

        let config = match resolve_config(&http, &base, token).await {
            Ok(config) => config,
            Err(e) => {
                let Some(space) = endpoint.space.clone() else {
                    return Err(e);
                };
                warn!(space = space.as_str(), error = %e, "config fetch failed; checking space status");
                let hub = HubClient::new(http.clone(), hub_base, options.token.clone());
                let status = hub
                    .check_space_status(
                        &space,
                        Duration::from_millis(settings.hub.status_poll_interval_ms),
                        options.status_callback.as_ref(),
                    )
                    .await;
                if status.status != SpaceState::Running {
                    return Err(ClientError::SpaceUnavailable {
                        detail: status.detail,
                        message: status.message,
                    });
                }
                resolve_config(&http, &base, token).await?
            }
        };

        let jwt = match (token, &endpoint.space) {
            (Some(token), Some(SpaceRef::Name(space_id))) => {
                fetch_jwt(&http, hub_base, space_id, token).await
            }
            _ => None,
        };

        let client = Self::build(http, settings, endpoint, config, jwt, options);
        info!(
            root = %client.shared.config.root,
            protocol = ?client.shared.config.protocol,
            session_hash = %client.shared.session_hash,
            "connected"
        );
        if !client.shared.config.auth_required {
            if let Err(e) = client.view_api().await {
                debug!(error = %e, "api info unavailable");
            }
        }
        Ok(client)
    }

    /// Build a client from an already-resolved endpoint and descriptor.
    pub fn from_parts(endpoint: Endpoint, config: AppConfig, options: ClientOptions) -> Self {
        let settings = options
            .settings
            .clone()
            .unwrap_or_else(|| get_settings().clone());
        let http = build_http_client(&settings.http);
        Self::build(http, settings, endpoint, config, None, options)
    }

    fn build(
        http: reqwest::Client,
        settings: ClientSettings,
        endpoint: Endpoint,
        config: AppConfig,
        jwt: Option<String>,
        options: ClientOptions,
    ) -> Self {
        let timeout = Duration::from_millis(settings.http.request_timeout_ms);
        let uploader = options.uploader.unwrap_or_else(|| {
            Arc::new(HttpUploader::new(
                http.clone(),
                settings.upload.chunk_size,
                timeout,
            ))
        });
        let api_map = map_names_to_ids(&config.dependencies);
        Self {
            shared: Arc::new(ClientShared {
                http,
                settings,
                endpoint,
                config,
                api_map,
                session_hash: SessionHash::generate(),
                token: options.token,
                jwt,
                uploader,
                mux: OnceLock::new(),
                api_info: RwLock::new(None),
            }),
        }
    }

    /// Duplicate hub space `space_id` into the token owner's namespace and
    /// connect to the copy.
    pub async fn duplicate(
        space_id: &str,
        duplicate: DuplicateOptions,
        options: ClientOptions,
    ) -> Result<Self> {
        let settings = options
            .settings
            .clone()
            .unwrap_or_else(|| get_settings().clone());
        let Some(token) = options.token.clone() else {
            return Err(ClientError::Hub("duplicating a space needs a hub token".into()));
        };
        let hub = HubClient::new(
            build_http_client(&settings.http),
            settings.hub.base_url.clone(),
            Some(token),
        );
        let target = hub
            .duplicate_space(space_id, &duplicate, settings.hub.default_sleep_timeout_secs)
            .await?;
        Self::connect(&target, options).await
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// The service descriptor.
    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    /// Where the app lives.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// The session correlation id sent with every submission.
    pub fn session_hash(&self) -> &SessionHash {
        &self.shared.session_hash
    }

    /// Hub API access with this client's token.
    pub fn hub(&self) -> HubClient {
        HubClient::new(
            self.shared.http.clone(),
            self.shared.settings.hub.base_url.clone(),
            self.shared.token.clone(),
        )
    }

    /// Resolve a job reference to its function index.
    pub fn resolve_fn_index(&self, endpoint: &JobRef) -> Result<usize> {
        endpoint
            .resolve(&self.shared.api_map)
            .filter(|i| *i < self.shared.config.dependencies.len())
            .ok_or_else(|| ClientError::UnknownEndpoint(endpoint.to_string()))
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Create a job without starting it, so listeners can be attached first.
    pub fn prepare(&self, endpoint: impl Into<JobRef>, request: JobRequest) -> Result<Job> {
        let endpoint = endpoint.into();
        let fn_index = self.resolve_fn_index(&endpoint)?;
        let transport = select_transport(&self.shared.config, fn_index);
        debug!(endpoint = %endpoint, fn_index, transport = ?transport, "job prepared");
        Ok(Job::new(
            self.shared.clone(),
            fn_index,
            endpoint.route(),
            transport,
            request,
        ))
    }

    /// Create a job from input data plus extras, without starting it.
    pub fn prepare_with(
        &self,
        endpoint: impl Into<JobRef>,
        data: Vec<InputValue>,
        options: SubmitOptions,
    ) -> Result<Job> {
        self.prepare(
            endpoint,
            JobRequest {
                data,
                event_data: options.event_data,
                trigger_id: options.trigger_id,
            },
        )
    }

    /// Create and start a job.
    ///
    /// Events emitted before listeners are attached are lost; use
    /// [`Client::prepare`] and [`Job::start`] to attach them first.
    pub fn submit(&self, endpoint: impl Into<JobRef>, data: Vec<InputValue>) -> Result<Job> {
        let job = self.prepare(endpoint, JobRequest::new(data))?;
        job.start();
        Ok(job)
    }

    /// Run a job to completion and return its output.
    ///
    /// Rejects with [`ClientError::Job`] when the job ends in `error`.
    pub async fn predict(
        &self,
        endpoint: impl Into<JobRef>,
        data: Vec<InputValue>,
    ) -> Result<Vec<Value>> {
        self.predict_with(endpoint, JobRequest::new(data)).await
    }

    /// [`Client::predict`] with event data and trigger id.
    pub async fn predict_with(
        &self,
        endpoint: impl Into<JobRef>,
        request: JobRequest,
    ) -> Result<Vec<Value>> {
        let endpoint = endpoint.into();
        let fn_index = self.resolve_fn_index(&endpoint)?;
        if self.shared.config.dependencies[fn_index].types.continuous {
            return Err(ClientError::ContinuousEndpoint(endpoint.to_string()));
        }
        predict::run(self.prepare(endpoint, request)?).await
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// API description of the app, fetched once per client.
    pub async fn view_api(&self) -> Result<Arc<ApiInfo>> {
        let cached = self.shared.api_info.read().clone();
        if let Some(info) = cached {
            return Ok(info);
        }
        let shared = &self.shared;
        let info = Arc::new(
            fetch_api_info(&shared.http, &shared.config, &shared.api_map, shared.token.as_deref())
                .await?,
        );
        *shared.api_info.write() = Some(info.clone());
        Ok(info)
    }

    /// Forget the cached API description.
    pub fn reset_api_info(&self) {
        *self.shared.api_info.write() = None;
    }

    /// Call server function `fn_name` of component `component_id`.
    pub async fn component_server(
        &self,
        component_id: u64,
        fn_name: &str,
        data: Value,
    ) -> Result<Value> {
        let shared = &self.shared;
        let root = shared.config.component_root(component_id).trim_end_matches('/');
        let url = format!("{root}/component_server/");
        let body = json!({
            "data": data,
            "component_id": component_id,
            "fn_name": fn_name,
            "session_hash": shared.session_hash,
        });
        let mut request = shared
            .http
            .post(&url)
            .json(&body)
            .timeout(shared.request_timeout());
        if let Some(token) = &shared.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
