//! Two-phase upload: request a write grant, then transfer the raw bytes.
//!
//! A grant is only useful if the transfer behind it succeeded, so the assigned
//! key is handed back from [`UploadCoordinator::transfer`] and nowhere else.

use crate::backend::ResizeBackend;
use crate::params::TransformParams;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Content types the pipeline accepts.
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Errors from phase 1.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GrantError {
    #[error("Grant request failed: {0}")]
    Network(String),

    #[error("Issuing endpoint returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed grant response: {0}")]
    MalformedResponse(String),

    #[error("Grant response is missing `{0}`")]
    MissingField(&'static str),
}

/// Errors from phase 2.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Upload failed: {0}")]
    Network(String),

    #[error("Upload failed with status {status}")]
    Status {
        status: u16,
        /// Storage diagnostics, usually XML; kept for logs only
        body: String,
    },
}

/// Errors from picking a file off disk.
#[derive(Debug, Error)]
pub enum FileSelectionError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Unsupported file type for {0}; accepted: {accepted}",
        accepted = ACCEPTED_CONTENT_TYPES.join(", ")
    )]
    UnsupportedType(String),

    #[error("File name is not valid UTF-8")]
    InvalidName,
}

/// A file the user picked, held in memory until it is transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, inferring its content type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, FileSelectionError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(FileSelectionError::InvalidName)?
            .to_string();

        let content_type = content_type_for(&name)
            .ok_or_else(|| FileSelectionError::UnsupportedType(name.clone()))?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| FileSelectionError::Read {
                path: path.display().to_string(),
                source,
            })?;

        debug!(file_name = %name, content_type, size_bytes = bytes.len(), "File selected");

        Ok(Self::new(name, content_type, Bytes::from(bytes)))
    }
}

/// Content type for an accepted image file name.
pub fn content_type_for(file_name: &str) -> Option<&'static str> {
    let extension = file_name.rsplit_once('.')?.1;
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// What is asked of the issuing endpoint. Fixed once the upload is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub file_name: String,
    pub content_type: String,
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl TransformRequest {
    pub fn new(file: &SelectedFile, params: TransformParams) -> Self {
        Self {
            file_name: file.name.clone(),
            content_type: file.content_type.clone(),
            quality: params.quality,
            max_width: params.max_width,
            max_height: params.max_height,
        }
    }

    pub fn params(&self) -> TransformParams {
        TransformParams {
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }
}

/// Write authorization for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadGrant {
    /// Pre-authorized URL the raw bytes are written to
    pub write_url: String,
    /// Key the raw upload will live under
    pub assigned_key: String,
}

/// Drives the grant/transfer protocol against a backend.
#[derive(Clone)]
pub struct UploadCoordinator {
    backend: Arc<dyn ResizeBackend>,
}

impl UploadCoordinator {
    pub fn new(backend: Arc<dyn ResizeBackend>) -> Self {
        Self { backend }
    }

    /// Phase 1: ask the issuing endpoint for a grant.
    #[instrument(skip(self, request), fields(file_name = %request.file_name, quality = request.quality))]
    pub async fn request_grant(&self, request: &TransformRequest) -> Result<UploadGrant, GrantError> {
        metrics::counter!("resize_client.grants.requested").increment(1);

        let grant = self.backend.request_grant(request).await?;

        if grant.write_url.is_empty() {
            return Err(GrantError::MissingField("uploadUrl"));
        }
        if grant.assigned_key.is_empty() {
            return Err(GrantError::MissingField("key"));
        }

        debug!(key = %grant.assigned_key, "Upload grant received");
        Ok(grant)
    }

    /// Phase 2: write the bytes. Consumes the file; the caller must reselect to retry.
    ///
    /// Returns the assigned key on success.
    #[instrument(skip(self, grant, file), fields(key = %grant.assigned_key, size_bytes = file.bytes.len()))]
    pub async fn transfer(&self, grant: UploadGrant, file: SelectedFile) -> Result<String, TransferError> {
        let started = Instant::now();
        let size = file.bytes.len();

        let result = self
            .backend
            .put_object(&grant.write_url, &file.content_type, file.bytes)
            .await;

        metrics::histogram!("resize_client.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("resize_client.uploads.completed").increment(1);
                info!(key = %grant.assigned_key, size_bytes = size, "Upload complete");
                Ok(grant.assigned_key)
            }
            Err(e) => {
                metrics::counter!("resize_client.uploads.failed").increment(1);
                if let TransferError::Status { status, body } = &e {
                    warn!(status = *status, body = %body, "Storage rejected upload");
                }
                Err(e)
            }
        }
    }
}
