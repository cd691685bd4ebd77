//! Minimal Kubernetes API client for listing and watching services.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::service::ServiceList;

/// Service account mount inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Server-side timeout of a single watch request.
pub const WATCH_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CA bundle {path}: {source}")]
    InvalidCa {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid bearer token")]
    InvalidToken,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("resource version is too old")]
    Gone,

    #[error("failed to decode api response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("watch error {code}: {message}")]
    WatchError { code: u16, message: String },
}

/// One line of a watch stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: serde_json::Value,
}

/// Connection settings for the API server.
#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    pub base_url: String,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub namespace: Option<String>,
}

impl KubeClientConfig {
    /// Settings from the pod environment and service account mount.
    pub fn in_cluster(namespace: Option<String>) -> Result<Self, KubeError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeError::MissingEnv("KUBERNETES_SERVICE_HOST"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| KubeError::MissingEnv("KUBERNETES_SERVICE_PORT"))?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        Ok(Self {
            base_url: format!("https://{host}:{port}"),
            token_file: Some(dir.join("token")),
            ca_file: Some(dir.join("ca.crt")),
            namespace,
        })
    }
}

/// Client for the `v1/services` endpoints.
#[derive(Debug, Clone)]
pub struct KubeClient {
    client: reqwest::Client,
    config: KubeClientConfig,
}

impl KubeClient {
    pub fn new(config: KubeClientConfig) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("qumine-ingress/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10));

        if let Some(path) = &config.ca_file {
            let pem = read_file(path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|source| {
                KubeError::InvalidCa {
                    path: path.clone(),
                    source,
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    /// URL of the service collection, cluster-wide or namespaced.
    pub fn services_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.namespace {
            Some(namespace) => format!("{base}/api/v1/namespaces/{namespace}/services"),
            None => format!("{base}/api/v1/services"),
        }
    }

    /// Re-read on every request so rotated tokens are picked up.
    async fn authorization(&self) -> Result<Option<HeaderValue>, KubeError> {
        let Some(path) = &self.config.token_file else {
            return Ok(None);
        };
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| KubeError::ReadFile {
                path: path.clone(),
                source,
            })?;
        let token = String::from_utf8_lossy(&raw);
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map(Some)
            .map_err(|_| KubeError::InvalidToken)
    }

    async fn get(&self, query: &[(&str, String)]) -> Result<reqwest::Response, KubeError> {
        let url = self.services_url();
        debug!(url = %url, ?query, "Requesting services");

        let mut request = self.client.get(&url).query(query);
        if let Some(auth) = self.authorization().await? {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::GONE {
            return Err(KubeError::Gone);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KubeError::Status { status, body });
        }
        Ok(response)
    }

    pub async fn list_services(&self) -> Result<ServiceList, KubeError> {
        let response = self.get(&[]).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Open a watch starting after `resource_version`.
    pub async fn watch_services(
        &self,
        resource_version: &str,
    ) -> Result<WatchLines, KubeError> {
        let query = [
            ("watch", "true".to_string()),
            ("resourceVersion", resource_version.to_string()),
            ("allowWatchBookmarks", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string()),
        ];
        let response = self.get(&query).await?;
        Ok(WatchLines::new(response.bytes_stream()))
    }
}

/// Blocking read, for construction only.
fn read_file(path: &Path) -> Result<Vec<u8>, KubeError> {
    std::fs::read(path).map_err(|source| KubeError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Splits a chunked body into newline-delimited watch events.
pub struct WatchLines {
    chunks: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: BytesMut,
}

impl WatchLines {
    pub fn new(chunks: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            chunks: Box::pin(chunks),
            buffer: BytesMut::new(),
        }
    }

    /// Next event, or `None` when the server closed the watch.
    pub async fn next_event(&mut self) -> Result<Option<WatchEvent>, KubeError> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(&line)?));
            }

            match self.chunks.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    if self.buffer.iter().all(u8::is_ascii_whitespace) {
                        return Ok(None);
                    }
                    let rest = self.buffer.split();
                    return Ok(Some(serde_json::from_slice(&rest)?));
                }
            }
        }
    }
}

fn take_line(buffer: &mut BytesMut) -> Option<Bytes> {
    let end = buffer.iter().position(|b| *b == b'\n')?;
    let mut line = buffer.split_to(end + 1);
    line.truncate(end);
    Some(line.freeze())
}

/// Decode the status object carried by an `ERROR` watch event.
pub fn watch_error(object: &serde_json::Value) -> KubeError {
    let code = object
        .get("code")
        .and_then(serde_json::Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    if code == StatusCode::GONE.as_u16() {
        return KubeError::Gone;
    }
    let message = object
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    KubeError::WatchError { code, message }
}

impl std::fmt::Debug for WatchLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchLines")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
