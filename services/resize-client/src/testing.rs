//! Scripted backend for exercising the workflow without a network.

use crate::backend::{ProbeOutcome, ResizeBackend};
use crate::resolver::DownloadError;
use crate::upload::{GrantError, TransferError, TransformRequest, UploadGrant};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Replays queued responses; falls back to happy-path defaults when a queue
/// runs dry (canonical grant, accepted upload, 404 probe).
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    grants: Mutex<VecDeque<Result<UploadGrant, GrantError>>>,
    transfers: Mutex<VecDeque<Result<(), TransferError>>>,
    probes: Mutex<VecDeque<ProbeOutcome>>,
    download: Option<Bytes>,
    grant_delay: Option<Duration>,
    probe_delay: Option<Duration>,
    grant_requests: Mutex<Vec<TransformRequest>>,
    put_urls: Mutex<Vec<String>>,
    probed_urls: Mutex<Vec<String>>,
    fetched_urls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn with_probes(probes: Vec<ProbeOutcome>) -> Self {
        Self {
            probes: Mutex::new(probes.into()),
            ..Self::default()
        }
    }

    pub fn always_not_ready() -> Self {
        Self::default()
    }

    pub fn with_grant(self, grant: Result<UploadGrant, GrantError>) -> Self {
        self.grants.lock().push_back(grant);
        self
    }

    pub fn with_transfer(self, result: Result<(), TransferError>) -> Self {
        self.transfers.lock().push_back(result);
        self
    }

    pub fn with_download(mut self, bytes: Bytes) -> Self {
        self.download = Some(bytes);
        self
    }

    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = Some(delay);
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn grant_requests(&self) -> Vec<TransformRequest> {
        self.grant_requests.lock().clone()
    }

    pub fn put_count(&self) -> usize {
        self.put_urls.lock().len()
    }

    pub fn probe_count(&self) -> usize {
        self.probed_urls.lock().len()
    }

    pub fn probed_urls(&self) -> Vec<String> {
        self.probed_urls.lock().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched_urls.lock().clone()
    }
}

#[async_trait]
impl ResizeBackend for ScriptedBackend {
    async fn request_grant(&self, request: &TransformRequest) -> Result<UploadGrant, GrantError> {
        self.grant_requests.lock().push(request.clone());
        if let Some(delay) = self.grant_delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.grants.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(UploadGrant {
                write_url: format!("https://uploads.example/{}", request.file_name),
                assigned_key: format!(
                    "q{}_w{}_h{}/{}",
                    request.quality, request.max_width, request.max_height, request.file_name
                ),
            })
        })
    }

    async fn put_object(
        &self,
        write_url: &str,
        _content_type: &str,
        _body: Bytes,
    ) -> Result<(), TransferError> {
        self.put_urls.lock().push(write_url.to_string());
        let scripted = self.transfers.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        self.probed_urls.lock().push(url.to_string());
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.probes.lock().pop_front();
        scripted.unwrap_or(ProbeOutcome::NotReady { status: 404 })
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        self.fetched_urls.lock().push(url.to_string());
        self.download
            .clone()
            .ok_or(DownloadError::Status { status: 404 })
    }
}
