//! App reference resolution.
//!
//! An app is referenced either by URL (`https://host/path`), by bare host
//! (`owner-name.hf.space`), or by hub space id (`owner/name`). Space ids are
//! resolved to a host through the hub API.

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{ClientError, Result};

/// Suffix of hosts served directly by the hub.
const SPACE_HOST_SUFFIX: &str = ".hf.space";

/// How a hosted space is identified on the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceRef {
    /// `owner/name`
    Name(String),
    /// Subdomain of a hub-served host.
    Subdomain(String),
}

impl SpaceRef {
    /// The identifier text.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Name(s) | Self::Subdomain(s) => s,
        }
    }
}

/// Where an app lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// `http` or `https`.
    pub http_protocol: String,
    /// `ws` or `wss`.
    pub ws_protocol: String,
    /// Host, port and mount path, without trailing slash.
    pub host: String,
    /// Hub space, when the app is hosted there.
    pub space: Option<SpaceRef>,
}

impl Endpoint {
    /// Base HTTP URL (`{http_protocol}://{host}`).
    pub fn http_base(&self) -> String {
        format!("{}://{}", self.http_protocol, self.host)
    }

    /// Parse a full URL or bare host.
    pub fn from_url(reference: &str) -> Result<Self> {
        let trimmed = reference.trim().trim_end_matches('/');
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            let space = trimmed
                .strip_suffix(SPACE_HOST_SUFFIX)
                .map(|sub| SpaceRef::Subdomain(sub.to_string()));
            return Ok(Self {
                http_protocol: "https".into(),
                ws_protocol: "wss".into(),
                host: trimmed.to_string(),
                space,
            });
        }

        let url = Url::parse(trimmed)?;
        let host_name = url
            .host_str()
            .ok_or_else(|| ClientError::Config(format!("no host in {reference}")))?;
        let mut host = match url.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };
        host.push_str(url.path().trim_end_matches('/'));

        let secure = url.scheme() == "https";
        let space = host_name
            .strip_suffix(SPACE_HOST_SUFFIX)
            .map(|sub| SpaceRef::Subdomain(sub.to_string()));
        Ok(Self {
            http_protocol: url.scheme().to_string(),
            ws_protocol: if secure { "wss" } else { "ws" }.into(),
            host,
            space,
        })
    }
}

/// Whether `reference` looks like a hub space id (`owner/name`).
pub fn is_space_name(reference: &str) -> bool {
    let mut parts = reference.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.contains(':') && !name.is_empty()
    )
}

#[derive(Deserialize)]
struct HostResponse {
    host: String,
}

#[derive(Deserialize)]
struct JwtResponse {
    token: Option<String>,
}

/// Resolve an app reference to an [`Endpoint`].
pub async fn resolve_endpoint(
    http: &reqwest::Client,
    hub_base: &str,
    reference: &str,
    token: Option<&str>,
) -> Result<Endpoint> {
    if !is_space_name(reference) {
        return Endpoint::from_url(reference);
    }

    let url = format!("{hub_base}/api/spaces/{reference}/host");
    let mut request = http.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            message: format!("could not resolve space {reference}"),
        });
    }
    let HostResponse { host } = response.json().await?;
    debug!(space = reference, host = %host, "resolved space host");

    let mut endpoint = Endpoint::from_url(&host)?;
    endpoint.space = Some(SpaceRef::Name(reference.to_string()));
    Ok(endpoint)
}

/// Fetch a signed access token for a private space.
///
/// Failures are logged and yield `None`.
pub async fn fetch_jwt(
    http: &reqwest::Client,
    hub_base: &str,
    space_id: &str,
    token: &str,
) -> Option<String> {
    let url = format!("{hub_base}/api/spaces/{space_id}/jwt");
    let result = async {
        let response = http.get(&url).bearer_auth(token).send().await?;
        response.json::<JwtResponse>().await
    }
    .await;
    match result {
        Ok(JwtResponse { token }) => token.filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(space = space_id, error = %e, "could not fetch space jwt");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
