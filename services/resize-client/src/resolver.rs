//! Turning a found output object into something viewable and saveable.

use crate::backend::ResizeBackend;
use crate::object_key::DerivedKey;
use crate::params::TransformParams;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Download failures. They never change the workflow state.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Download failed: {0}")]
    Network(String),

    #[error("Download failed with status {status}")]
    Status { status: u16 },

    #[error("Failed to save download: {0}")]
    Io(#[from] std::io::Error),

    #[error("Save task failed: {0}")]
    Task(String),
}

/// A ready result. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAsset {
    /// Display/download URL with the cache token applied
    pub access_url: String,
    /// Token appended to `access_url`
    pub cache_token: String,
    /// Output URL without the token
    pub source_url: String,
    /// Name stem of the original upload
    pub stem: String,
    /// Parameters the result was produced with
    pub params: TransformParams,
    /// Output file extension
    pub extension: String,
}

impl ResultAsset {
    /// Build the asset for an output found at `source_url`.
    pub fn new(source_url: &str, output: &DerivedKey, cache_token: String) -> Self {
        Self {
            access_url: cache_busted_url(source_url, &cache_token),
            cache_token,
            source_url: source_url.to_string(),
            stem: output.stem.clone(),
            params: output.params,
            extension: output.extension.clone(),
        }
    }

    /// `{stem}_q{quality}_w{width}_h{height}.{extension}`
    pub fn download_file_name(&self) -> String {
        let base = self.stem.rsplit('/').next().unwrap_or(&self.stem);
        format!(
            "{}_q{}_w{}_h{}.{}",
            sanitize_file_name(base),
            self.params.quality,
            self.params.max_width,
            self.params.max_height,
            self.extension
        )
    }
}

/// A fresh cache-defeating token (milliseconds since the epoch).
pub fn cache_token() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Append `t=<token>` to a URL.
pub fn cache_busted_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, separator, token)
}

/// Keep file names to a safe character set.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "resized".to_string()
    } else {
        cleaned
    }
}

/// Builds result assets and saves results to disk.
#[derive(Clone)]
pub struct ResultResolver {
    backend: Arc<dyn ResizeBackend>,
}

impl ResultResolver {
    pub fn new(backend: Arc<dyn ResizeBackend>) -> Self {
        Self { backend }
    }

    /// Finalize a found output with a new cache token.
    pub fn resolve(source_url: &str, output: &DerivedKey) -> ResultAsset {
        ResultAsset::new(source_url, output, cache_token())
    }

    /// Fetch the result and save it into `dir`. Returns the saved path.
    ///
    /// The bytes land in a temporary file in `dir` first and are moved into
    /// place once fully written.
    #[instrument(skip(self, asset), fields(url = %asset.access_url))]
    pub async fn download(&self, asset: &ResultAsset, dir: &Path) -> Result<PathBuf, DownloadError> {
        let bytes = match self.backend.fetch(&asset.access_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Download failed");
                return Err(e);
            }
        };

        let target = dir.join(asset.download_file_name());
        let dir = dir.to_path_buf();
        let size = bytes.len();

        let saved = tokio::task::spawn_blocking(move || -> Result<PathBuf, DownloadError> {
            let mut transient = tempfile::NamedTempFile::new_in(&dir)?;
            transient.write_all(&bytes)?;
            transient.flush()?;
            transient.persist(&target).map_err(|e| e.error)?;
            Ok(target)
        })
        .await
        .map_err(|e| DownloadError::Task(e.to_string()))??;

        info!(path = %saved.display(), size_bytes = size, "Result saved");
        Ok(saved)
    }
}
