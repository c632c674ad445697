//! API introspection.
//!
//! The service describes its endpoints at `GET {root}/info`. The raw
//! description is mapped to display type strings per parameter and return
//! value, keyed by endpoint name (`named_endpoints`) or function index
//! (`unnamed_endpoints`).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use queuelink_core::constants::{BROKEN_CONNECTION_MSG, INFO_ENDPOINT_SINCE};
use queuelink_core::version::is_older_than;

use crate::config::{AppConfig, DependencyTypes};
use crate::errors::{ClientError, Result};

/// Display type of a file value returned by the service.
const FILE_DATA_TYPE: &str =
    "{ name: string; data: string; size?: number; is_file?: boolean; orig_name?: string}";

// ─────────────────────────────────────────────────────────────────────────────
// Raw description
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RawParam {
    label: Option<String>,
    component: String,
    #[serde(rename = "type")]
    type_info: Value,
    serializer: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RawEndpoint {
    parameters: Vec<RawParam>,
    returns: Vec<RawParam>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawApiInfo {
    named_endpoints: BTreeMap<String, RawEndpoint>,
    unnamed_endpoints: BTreeMap<String, RawEndpoint>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Public description
// ─────────────────────────────────────────────────────────────────────────────

/// One parameter or return value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiParameter {
    /// Component label.
    pub label: Option<String>,
    /// Component class name.
    pub component: String,
    /// Display type, when one is known.
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
}

/// One endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Inputs, in call order.
    pub parameters: Vec<ApiParameter>,
    /// Outputs, in slot order.
    pub returns: Vec<ApiParameter>,
    /// Type flags of the backing job.
    #[serde(rename = "type")]
    pub types: Option<DependencyTypes>,
}

/// Every endpoint of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Endpoints keyed by `/name`.
    pub named_endpoints: BTreeMap<String, EndpointInfo>,
    /// Endpoints keyed by function index.
    pub unnamed_endpoints: BTreeMap<String, EndpointInfo>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Signature {
    Parameter,
    Return,
}

fn get_type(
    type_info: &Value,
    component: &str,
    serializer: &str,
    signature: Signature,
) -> Option<String> {
    let declared = type_info.get("type").and_then(Value::as_str);
    if let Some(primitive @ ("string" | "boolean" | "number")) = declared {
        return Some(primitive.to_string());
    }
    let is_param = signature == Signature::Parameter;
    let type_name = match serializer {
        "JSONSerializable" | "StringSerializable" => "any".to_string(),
        "ListStringSerializable" => "string[]".to_string(),
        _ if component == "Image" => {
            let image = if is_param { "Blob | File | Buffer" } else { "string" };
            image.to_string()
        }
        "FileSerializable" => match (declared == Some("array"), is_param) {
            (true, true) => "(Blob | File | Buffer)[]".to_string(),
            (true, false) => format!("{FILE_DATA_TYPE}[]"),
            (false, true) => "Blob | File | Buffer".to_string(),
            (false, false) => FILE_DATA_TYPE.to_string(),
        },
        "GallerySerializable" => {
            if is_param {
                "[(Blob | File | Buffer), (string | null)][]".to_string()
            } else {
                format!("[{FILE_DATA_TYPE}, (string | null))][]")
            }
        }
        _ => return None,
    };
    Some(type_name)
}

fn get_description(type_info: &Value, serializer: &str) -> Option<String> {
    match serializer {
        "GallerySerializable" => Some("array of [file, label] tuples".into()),
        "ListStringSerializable" => Some("array of strings".into()),
        "FileSerializable" => Some("array of files or single file".into()),
        _ => type_info
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn transform_params(params: Vec<RawParam>, signature: Signature) -> Vec<ApiParameter> {
    params
        .into_iter()
        .map(|p| ApiParameter {
            type_name: get_type(&p.type_info, &p.component, &p.serializer, signature),
            description: get_description(&p.type_info, &p.serializer),
            label: p.label,
            component: p.component,
        })
        .collect()
}

fn transform_endpoints(
    raw: BTreeMap<String, RawEndpoint>,
    config: &AppConfig,
    api_map: &HashMap<String, usize>,
) -> BTreeMap<String, EndpointInfo> {
    raw.into_iter()
        .map(|(key, endpoint)| {
            let fn_index = key
                .parse::<usize>()
                .ok()
                .filter(|i| *i < config.dependencies.len())
                .or_else(|| api_map.get(key.trim_start_matches('/')).copied());
            let info = EndpointInfo {
                parameters: transform_params(endpoint.parameters, Signature::Parameter),
                returns: transform_params(endpoint.returns, Signature::Return),
                types: fn_index
                    .and_then(|i| config.dependencies.get(i))
                    .map(|dep| dep.types),
            };
            (key, info)
        })
        .collect()
}

/// Map a raw `/info` body to an [`ApiInfo`].
pub fn transform_api_info(
    body: Value,
    config: &AppConfig,
    api_map: &HashMap<String, usize>,
) -> Result<ApiInfo> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("api") => {
            map.remove("api").unwrap_or_default()
        }
        other => other,
    };
    let mut raw: RawApiInfo = serde_json::from_value(body)?;
    if !raw.unnamed_endpoints.contains_key("0") {
        if let Some(predict) = raw.named_endpoints.get("/predict").cloned() {
            let _ = raw.unnamed_endpoints.insert("0".into(), predict);
        }
    }
    Ok(ApiInfo {
        named_endpoints: transform_endpoints(raw.named_endpoints, config, api_map),
        unnamed_endpoints: transform_endpoints(raw.unnamed_endpoints, config, api_map),
    })
}

/// Fetch and transform the API description of `config`'s service.
pub async fn fetch_api_info(
    http: &reqwest::Client,
    config: &AppConfig,
    api_map: &HashMap<String, usize>,
    token: Option<&str>,
) -> Result<ApiInfo> {
    let version = config.version_or_default();
    if is_older_than(version, INFO_ENDPOINT_SINCE) {
        return Err(ClientError::Unsupported(format!(
            "API introspection needs service version {INFO_ENDPOINT_SINCE} or later, found {version}"
        )));
    }

    let url = format!("{}/info", config.root);
    let mut request = http.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            message: BROKEN_CONNECTION_MSG.to_string(),
        });
    }
    let body: Value = response.json().await?;
    debug!(url, "fetched api info");
    transform_api_info(body, config, api_map)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::map_names_to_ids;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(root: &str, version: &str) -> AppConfig {
        serde_json::from_value(json!({
            "root": root,
            "version": version,
            "dependencies": [
                {"api_name": "predict"},
                {"api_name": "chat", "types": {"generator": true}}
            ]
        }))
        .unwrap()
    }

    fn body() -> Value {
        json!({
            "named_endpoints": {
                "/predict": {
                    "parameters": [
                        {"label": "Input", "component": "Textbox", "serializer": "StringSerializable",
                         "type": {"type": "string", "description": "text"}},
                        {"label": "Photo", "component": "Image", "serializer": "ImgSerializable",
                         "type": {"type": "object"}}
                    ],
                    "returns": [
                        {"label": "Files", "component": "File", "serializer": "FileSerializable",
                         "type": {"type": "array"}}
                    ]
                },
                "/chat": {
                    "parameters": [
                        {"label": "History", "component": "Chatbot", "serializer": "JSONSerializable",
                         "type": {"type": "array", "description": "pairs"}}
                    ],
                    "returns": []
                }
            },
            "unnamed_endpoints": {}
        })
    }

    #[test]
    fn maps_types_and_descriptions() {
        let cfg = config("http://x", "4.0.0");
        let map = map_names_to_ids(&cfg.dependencies);
        let info = transform_api_info(body(), &cfg, &map).unwrap();

        let predict = &info.named_endpoints["/predict"];
        assert_eq!(predict.parameters[0].type_name.as_deref(), Some("string"));
        assert_eq!(predict.parameters[0].description.as_deref(), Some("text"));
        assert_eq!(predict.parameters[1].type_name.as_deref(), Some("Blob | File | Buffer"));
        assert_eq!(
            predict.returns[0].type_name.as_deref(),
            Some(format!("{FILE_DATA_TYPE}[]").as_str())
        );
        assert_eq!(
            predict.returns[0].description.as_deref(),
            Some("array of files or single file")
        );

        let chat = &info.named_endpoints["/chat"];
        assert_eq!(chat.parameters[0].type_name.as_deref(), Some("any"));
        assert_eq!(chat.types.map(|t| t.generator), Some(true));
    }

    #[test]
    fn predict_is_mirrored_and_wrapper_unwrapped() {
        let cfg = config("http://x", "4.0.0");
        let map = map_names_to_ids(&cfg.dependencies);
        let info = transform_api_info(json!({"api": body()}), &cfg, &map).unwrap();
        assert_eq!(info.unnamed_endpoints["0"], info.named_endpoints["/predict"]);
    }

    #[tokio::test]
    async fn fetches_info_from_recent_services() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .mount(&server)
            .await;

        let cfg = config(&server.uri(), "4.2.0");
        let map = map_names_to_ids(&cfg.dependencies);
        let info = fetch_api_info(&reqwest::Client::new(), &cfg, &map, None).await.unwrap();
        assert_eq!(info.named_endpoints.len(), 2);
    }

    #[tokio::test]
    async fn old_services_are_unsupported() {
        let cfg = config("http://127.0.0.1:1", "3.4");
        let err = fetch_api_info(&reqwest::Client::new(), &cfg, &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unsupported(_)));
    }

    #[tokio::test]
    async fn failed_fetch_reports_broken_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let cfg = config(&server.uri(), "4.2.0");
        let err = fetch_api_info(&reqwest::Client::new(), &cfg, &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(BROKEN_CONNECTION_MSG));
    }
}
