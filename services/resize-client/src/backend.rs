//! The external services the client drives, behind one trait.
//!
//! `HttpBackend` speaks the real contracts:
//!
//! ```text
//! GET  {issuer}/get-upload-url?fileName=&quality=&width=&height=&contentType=
//!        -> 200 { "uploadUrl": "...", "key": "..." } | 4xx/5xx { "error": "..." }
//! PUT  {uploadUrl}            Content-Type: <original>      -> 2xx
//! HEAD {output-url}?t=<nonce>                               -> 2xx ready, 403/404 not yet
//! GET  {output-url}?t=<nonce>                               -> result bytes
//! ```

use crate::config::IssuerConfig;
use crate::resolver::DownloadError;
use crate::upload::{GrantError, TransferError, TransformRequest, UploadGrant};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Result of one existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The artifact exists
    Ready,
    /// The pipeline has not written it yet (403/404)
    NotReady { status: u16 },
    /// Anything else; worth another try
    Transient { reason: String },
}

impl ProbeOutcome {
    /// Classify a probe response status.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ProbeOutcome::Ready,
            403 | 404 => ProbeOutcome::NotReady { status },
            _ => ProbeOutcome::Transient {
                reason: format!("unexpected status {}", status),
            },
        }
    }
}

/// Operations against the issuing endpoint and storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResizeBackend: Send + Sync {
    /// Ask for write authorization for a transform request.
    async fn request_grant(&self, request: &TransformRequest) -> Result<UploadGrant, GrantError>;

    /// Write raw bytes to a granted URL.
    async fn put_object(
        &self,
        write_url: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), TransferError>;

    /// Check whether an object exists. Never fails; failures are `Transient`.
    async fn probe(&self, url: &str) -> ProbeOutcome;

    /// Fetch an object's bytes.
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Grant response body. Fields are optional so a partial body is reported
/// as a missing field rather than a parse error.
#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// reqwest-backed implementation of [`ResizeBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    grant_url: String,
}

impl HttpBackend {
    pub fn new(config: &IssuerConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("resize-client/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::ClientBuild(e.to_string()))?;

        info!(grant_url = %config.grant_url(), "HTTP backend initialized");

        Ok(Self {
            client,
            grant_url: config.grant_url(),
        })
    }
}

#[async_trait]
impl ResizeBackend for HttpBackend {
    async fn request_grant(&self, request: &TransformRequest) -> Result<UploadGrant, GrantError> {
        let quality = request.quality.to_string();
        let width = request.max_width.to_string();
        let height = request.max_height.to_string();

        let response = self
            .client
            .get(&self.grant_url)
            .query(&[
                ("fileName", request.file_name.as_str()),
                ("quality", quality.as_str()),
                ("width", width.as_str()),
                ("height", height.as_str()),
                ("contentType", request.content_type.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GrantError::Network(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            return Err(GrantError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: GrantResponse = response
            .json()
            .await
            .map_err(|e| GrantError::MalformedResponse(e.to_string()))?;

        let write_url = body
            .upload_url
            .filter(|u| !u.is_empty())
            .ok_or(GrantError::MissingField("uploadUrl"))?;
        let assigned_key = body
            .key
            .filter(|k| !k.is_empty())
            .ok_or(GrantError::MissingField("key"))?;

        Ok(UploadGrant {
            write_url,
            assigned_key,
        })
    }

    async fn put_object(
        &self,
        write_url: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), TransferError> {
        let response = self
            .client
            .put(write_url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(TransferError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self
            .client
            .head(url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
        {
            Ok(response) => {
                let outcome = ProbeOutcome::from_status(response.status().as_u16());
                debug!(url = %url, status = response.status().as_u16(), "Probe response");
                outcome
            }
            Err(e) => ProbeOutcome::Transient {
                reason: e.to_string(),
            },
        }
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let response = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))
    }
}
