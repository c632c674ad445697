//! Binary input handling.
//!
//! Job inputs are an [`InputValue`] tree. Before a job is sent, every
//! [`Blob`] leaf is uploaded through an [`Uploader`] and replaced by a file
//! descriptor the service understands.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::debug;

use crate::errors::{ClientError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Input tree
// ─────────────────────────────────────────────────────────────────────────────

/// Raw file content to upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    /// File bytes.
    pub data: Bytes,
    /// Original file name.
    pub name: Option<String>,
    /// MIME type.
    pub mime_type: Option<String>,
}

impl Blob {
    /// A blob with no name or type.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            name: None,
            mime_type: None,
        }
    }

    /// Set the original file name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// File descriptor sent in place of this blob once uploaded as `path`.
    pub fn descriptor(&self, path: &str) -> Value {
        json!({
            "path": path,
            "orig_name": self.name,
            "size": self.data.len(),
            "mime_type": self.mime_type,
        })
    }
}

/// One job input: plain JSON, a blob, or a container of inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum InputValue {
    /// Opaque JSON, passed through untouched.
    Json(Value),
    /// File content to upload.
    Blob(Blob),
    /// Ordered list.
    Array(Vec<InputValue>),
    /// Keyed map.
    Object(BTreeMap<String, InputValue>),
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Blob> for InputValue {
    fn from(blob: Blob) -> Self {
        Self::Blob(blob)
    }
}

impl InputValue {
    /// Every blob in walk order (arrays by index, objects by key).
    pub fn blobs(&self) -> Vec<&Blob> {
        let mut out = Vec::new();
        self.collect_blobs(&mut out);
        out
    }

    fn collect_blobs<'a>(&'a self, out: &mut Vec<&'a Blob>) {
        match self {
            Self::Json(_) => {}
            Self::Blob(blob) => out.push(blob),
            Self::Array(items) => items.iter().for_each(|v| v.collect_blobs(out)),
            Self::Object(map) => map.values().for_each(|v| v.collect_blobs(out)),
        }
    }

    /// Convert to JSON, replacing blobs in walk order with the next handle.
    ///
    /// Blobs left without a handle become `null`.
    pub fn into_payload(self, handles: &mut impl Iterator<Item = String>) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Blob(blob) => handles
                .next()
                .map_or(Value::Null, |path| blob.descriptor(&path)),
            Self::Array(items) => {
                Value::Array(items.into_iter().map(|v| v.into_payload(handles)).collect())
            }
            Self::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_payload(handles)))
                    .collect(),
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Uploader
// ─────────────────────────────────────────────────────────────────────────────

/// Transfers blobs to the service and returns one remote handle per blob.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `blobs` under `root`.
    async fn upload(
        &self,
        root: &str,
        blobs: Vec<Blob>,
        token: Option<&str>,
        upload_id: Option<&str>,
    ) -> Result<Vec<String>>;
}

/// Multipart uploader posting to `{root}/upload`.
#[derive(Clone, Debug)]
pub struct HttpUploader {
    http: reqwest::Client,
    chunk_size: usize,
    timeout: Duration,
}

impl HttpUploader {
    /// Create an uploader sending at most `chunk_size` files per request.
    pub fn new(http: reqwest::Client, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            http,
            chunk_size: chunk_size.max(1),
            timeout,
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        root: &str,
        blobs: Vec<Blob>,
        token: Option<&str>,
        upload_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let url = match upload_id {
            Some(id) => format!("{root}/upload?upload_id={id}"),
            None => format!("{root}/upload"),
        };
        let mut handles = Vec::with_capacity(blobs.len());

        for chunk in blobs.chunks(self.chunk_size) {
            let mut form = reqwest::multipart::Form::new();
            for blob in chunk {
                let mut part = reqwest::multipart::Part::bytes(blob.data.to_vec())
                    .file_name(blob.name.clone().unwrap_or_else(|| "blob".to_string()));
                if let Some(mime) = &blob.mime_type {
                    part = part.mime_str(mime)?;
                }
                form = form.part("files", part);
            }

            let mut request = self.http.post(&url).multipart(form).timeout(self.timeout);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| ClientError::Upload(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Upload(format!("{url} returned {status}")));
            }
            let paths: Vec<String> = response.json().await?;
            debug!(count = paths.len(), "uploaded files");
            handles.extend(paths);
        }

        if handles.len() != blobs.len() {
            return Err(ClientError::Upload(format!(
                "expected {} handles, got {}",
                blobs.len(),
                handles.len()
            )));
        }
        Ok(handles)
    }
}

/// Upload every blob in `data` and return the JSON payload.
pub async fn handle_blobs(
    uploader: &dyn Uploader,
    root: &str,
    data: Vec<InputValue>,
    token: Option<&str>,
) -> Result<Vec<Value>> {
    let blobs: Vec<Blob> = data
        .iter()
        .flat_map(InputValue::blobs)
        .cloned()
        .collect();

    let handles = if blobs.is_empty() {
        Vec::new()
    } else {
        uploader.upload(root, blobs, token, None).await?
    };

    let mut handles = handles.into_iter();
    Ok(data
        .into_iter()
        .map(|value| value.into_payload(&mut handles))
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records calls and hands out `f0`, `f1`, ...
    #[derive(Default)]
    struct RecordingUploader {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(
            &self,
            _root: &str,
            blobs: Vec<Blob>,
            _token: Option<&str>,
            _upload_id: Option<&str>,
        ) -> Result<Vec<String>> {
            self.calls.lock().push(blobs.len());
            Ok((0..blobs.len()).map(|i| format!("f{i}")).collect())
        }
    }

    fn sample() -> Vec<InputValue> {
        let mut object = BTreeMap::new();
        let _ = object.insert("b".to_string(), InputValue::Blob(Blob::new("second")));
        let _ = object.insert("a".to_string(), InputValue::Json(json!(1)));
        vec![
            InputValue::Json(json!("text")),
            InputValue::Array(vec![
                InputValue::Blob(Blob::new("first").with_name("a.txt")),
                InputValue::Object(object),
            ]),
        ]
    }

    #[test]
    fn walks_blobs_in_order() {
        let data = sample();
        let blobs: Vec<&Blob> = data.iter().flat_map(InputValue::blobs).collect();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].data, Bytes::from("first"));
        assert_eq!(blobs[1].data, Bytes::from("second"));
    }

    #[test]
    fn descriptor_shape() {
        let blob = Blob::new("abc").with_name("x.png").with_mime_type("image/png");
        assert_eq!(
            blob.descriptor("/tmp/x.png"),
            json!({"path": "/tmp/x.png", "orig_name": "x.png", "size": 3, "mime_type": "image/png"})
        );
    }

    #[tokio::test]
    async fn replaces_blobs_with_descriptors() {
        let uploader = RecordingUploader::default();
        let payload = handle_blobs(&uploader, "http://root", sample(), None).await.unwrap();
        assert_eq!(*uploader.calls.lock(), vec![2]);
        assert_eq!(payload[0], json!("text"));
        assert_eq!(payload[1][0]["path"], "f0");
        assert_eq!(payload[1][0]["orig_name"], "a.txt");
        assert_eq!(payload[1][1]["b"]["path"], "f1");
        assert_eq!(payload[1][1]["a"], 1);
    }

    #[tokio::test]
    async fn no_blobs_no_upload() {
        let uploader = RecordingUploader::default();
        let payload = handle_blobs(&uploader, "r", vec![json!([1, 2]).into()], None)
            .await
            .unwrap();
        assert!(uploader.calls.lock().is_empty());
        assert_eq!(payload, vec![json!([1, 2])]);
    }

    #[tokio::test]
    async fn http_uploader_chunks_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["/tmp/a", "/tmp/b"])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["/tmp/c"])))
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(reqwest::Client::new(), 2, Duration::from_secs(5));
        let blobs = vec![Blob::new("1"), Blob::new("2"), Blob::new("3")];
        let handles = uploader.upload(&server.uri(), blobs, None, None).await.unwrap();
        assert_eq!(handles, vec!["/tmp/a", "/tmp/b", "/tmp/c"]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn http_uploader_passes_upload_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(query_param("upload_id", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["/tmp/a"])))
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(reqwest::Client::new(), 10, Duration::from_secs(5));
        let handles = uploader
            .upload(&server.uri(), vec![Blob::new("1")], None, Some("u1"))
            .await
            .unwrap();
        assert_eq!(handles, vec!["/tmp/a"]);
    }

    #[tokio::test]
    async fn http_uploader_rejects_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(reqwest::Client::new(), 10, Duration::from_secs(5));
        let err = uploader
            .upload(&server.uri(), vec![Blob::new("1")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Upload(_)));
    }
}
