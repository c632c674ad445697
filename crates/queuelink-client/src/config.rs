//! Service descriptor and job references.
//!
//! The descriptor is fetched once from `GET {base}/config` and treated as
//! mostly opaque: only the fields the client acts on are typed, everything
//! else is kept in [`AppConfig::extra`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use queuelink_core::constants::DEFAULT_SERVICE_VERSION;

use crate::errors::{ClientError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Streaming protocol advertised by the service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// One dedicated socket per job.
    #[default]
    Ws,
    /// One dedicated event stream per job.
    Sse,
    /// Shared event stream, full outputs.
    SseV1,
    /// Shared event stream, diff-compressed intermediate outputs.
    SseV2,
}

/// Per-job type flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyTypes {
    /// The job may run forever.
    pub continuous: bool,
    /// The job streams intermediate outputs.
    pub generator: bool,
}

/// One callable job ("dependency") declared by the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependency {
    /// Public name, without leading slash.
    pub api_name: Option<String>,
    /// Explicit queue flag; `None` defers to [`AppConfig::enable_queue`].
    pub queue: Option<bool>,
    /// Type flags.
    pub types: DependencyTypes,
}

/// Component properties the client reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentProps {
    /// Root URL of a component served from another host.
    pub root_url: Option<String>,
}

/// A UI component declared by the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Component {
    /// Component id.
    pub id: u64,
    /// Component properties.
    pub props: ComponentProps,
}

/// Service descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base HTTP URL every request is made against.
    pub root: String,
    /// Mount path of the app on its host.
    pub path: String,
    /// Service version string.
    pub version: Option<String>,
    /// Streaming protocol.
    pub protocol: Protocol,
    /// Service-wide queue flag.
    pub enable_queue: bool,
    /// Whether the service requires login.
    pub auth_required: bool,
    /// Callable jobs, indexed by function index.
    pub dependencies: Vec<Dependency>,
    /// UI components.
    pub components: Vec<Component>,
    /// Every other descriptor field, untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AppConfig {
    /// Service version, defaulting to `2.0.0` when absent.
    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_SERVICE_VERSION)
    }

    /// Whether job `fn_index` bypasses the queue.
    ///
    /// The job's own flag wins; a missing or null flag falls back to the
    /// service-wide setting.
    pub fn skip_queue(&self, fn_index: usize) -> bool {
        let queued = self
            .dependencies
            .get(fn_index)
            .and_then(|dep| dep.queue)
            .unwrap_or(self.enable_queue);
        !queued
    }

    /// Root URL for a component, falling back to [`AppConfig::root`].
    pub fn component_root(&self, component_id: u64) -> &str {
        self.components
            .iter()
            .find(|c| c.id == component_id)
            .and_then(|c| c.props.root_url.as_deref())
            .unwrap_or(&self.root)
    }
}

/// Build the api-name → function-index map.
pub fn map_names_to_ids(dependencies: &[Dependency]) -> HashMap<String, usize> {
    dependencies
        .iter()
        .enumerate()
        .filter_map(|(i, dep)| dep.api_name.as_ref().map(|name| (name.clone(), i)))
        .collect()
}

/// Join a host and a mount path.
///
/// An absolute `root` wins unless `prioritize_base` is set.
pub fn resolve_root(base: &str, root: &str, prioritize_base: bool) -> String {
    if root.starts_with("http://") || root.starts_with("https://") {
        if prioritize_base {
            base.to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{base}{root}")
    }
}

/// Fetch the descriptor from `GET {base_url}/config`.
pub async fn resolve_config(
    http: &reqwest::Client,
    base_url: &str,
    token: Option<&str>,
) -> Result<AppConfig> {
    let url = format!("{base_url}/config");
    let mut request = http.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| ClientError::Config(e.to_string()))?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(ClientError::Config(format!("{url} returned {status}")));
    }
    let mut config: AppConfig = response.json().await?;
    config.root = base_url.to_string();
    debug!(
        root = %config.root,
        version = config.version_or_default(),
        protocol = ?config.protocol,
        dependencies = config.dependencies.len(),
        "resolved service config"
    );
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────────────────
// Job references
// ─────────────────────────────────────────────────────────────────────────────

/// A job named by function index or by api name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobRef {
    /// Function index.
    Index(usize),
    /// Api name, with or without leading slash.
    Name(String),
}

impl JobRef {
    /// Resolve to a function index through `api_map`.
    pub fn resolve(&self, api_map: &HashMap<String, usize>) -> Option<usize> {
        match self {
            Self::Index(i) => Some(*i),
            Self::Name(name) => api_map.get(name.strip_prefix('/').unwrap_or(name)).copied(),
        }
    }

    /// Route used by the direct call path (`/predict` for bare indices).
    pub fn route(&self) -> String {
        match self {
            Self::Index(_) => "/predict".to_string(),
            Self::Name(name) if name.starts_with('/') => name.clone(),
            Self::Name(name) => format!("/{name}"),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "fn_index {i}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

impl From<usize> for JobRef {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<&str> for JobRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for JobRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(value: Value) -> AppConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn descriptor_defaults() {
        let cfg = config(json!({}));
        assert_eq!(cfg.protocol, Protocol::Ws);
        assert_eq!(cfg.version_or_default(), "2.0.0");
        assert!(!cfg.enable_queue);
        assert_eq!(cfg.path, "");
    }

    #[test]
    fn protocol_names() {
        assert_eq!(config(json!({"protocol": "sse_v2"})).protocol, Protocol::SseV2);
        assert_eq!(config(json!({"protocol": "sse_v1"})).protocol, Protocol::SseV1);
        assert_eq!(config(json!({"protocol": "sse"})).protocol, Protocol::Sse);
    }

    #[test]
    fn unknown_fields_are_kept() {
        let cfg = config(json!({"theme": "dark", "mode": "blocks"}));
        assert_eq!(cfg.extra["theme"], "dark");
    }

    #[test]
    fn skip_queue_rules() {
        let cfg = config(json!({
            "enable_queue": true,
            "dependencies": [{"queue": false}, {"queue": null}, {"queue": true}]
        }));
        assert!(cfg.skip_queue(0));
        assert!(!cfg.skip_queue(1));
        assert!(!cfg.skip_queue(2));
        assert!(!cfg.skip_queue(9));

        let cfg = config(json!({
            "enable_queue": false,
            "dependencies": [{"queue": null}, {"queue": true}]
        }));
        assert!(cfg.skip_queue(0));
        assert!(!cfg.skip_queue(1));
    }

    #[test]
    fn names_map_to_indices() {
        let cfg = config(json!({
            "dependencies": [{"api_name": "predict"}, {}, {"api_name": "chat"}]
        }));
        let map = map_names_to_ids(&cfg.dependencies);
        assert_eq!(map.len(), 2);
        assert_eq!(JobRef::from("/chat").resolve(&map), Some(2));
        assert_eq!(JobRef::from("predict").resolve(&map), Some(0));
        assert_eq!(JobRef::from("missing").resolve(&map), None);
        assert_eq!(JobRef::from(1).resolve(&map), Some(1));
    }

    #[test]
    fn routes() {
        assert_eq!(JobRef::Index(3).route(), "/predict");
        assert_eq!(JobRef::from("chat").route(), "/chat");
        assert_eq!(JobRef::from("/chat").route(), "/chat");
    }

    #[test]
    fn component_root_falls_back() {
        let mut cfg = config(json!({
            "components": [{"id": 1, "props": {"root_url": "https://other"}}, {"id": 2}]
        }));
        cfg.root = "https://main".into();
        assert_eq!(cfg.component_root(1), "https://other");
        assert_eq!(cfg.component_root(2), "https://main");
        assert_eq!(cfg.component_root(3), "https://main");
    }

    #[test]
    fn resolve_root_rules() {
        assert_eq!(resolve_root("host", "/app", false), "host/app");
        assert_eq!(resolve_root("host", "https://x", false), "https://x");
        assert_eq!(resolve_root("host", "https://x", true), "host");
    }

    #[tokio::test]
    async fn fetches_config_and_sets_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .and(header("authorization", "Bearer hf_x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": "4.1.0",
                "protocol": "sse_v1",
                "enable_queue": true
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let cfg = resolve_config(&http, &server.uri(), Some("hf_x")).await.unwrap();
        assert_eq!(cfg.root, server.uri());
        assert_eq!(cfg.protocol, Protocol::SseV1);
        assert_eq!(cfg.version_or_default(), "4.1.0");
    }

    #[tokio::test]
    async fn config_failure_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = resolve_config(&http, &server.uri(), None).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
