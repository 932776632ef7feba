//! The upload, process and poll workflow of one session.
//!
//! [`Session`] holds the single [`WorkflowState`] and applies events to it.
//! [`Workflow`] is the task that feeds it: it receives UI events and async
//! completions over one channel, runs the effects a transition asks for, and
//! publishes every new state on a watch channel for the display layer.
//!
//! ```text
//!  Idle ──file──▶ FileSelected ──upload──▶ RequestingGrant ──grant──▶ Uploading
//!                  ▲   │ edit                    │ error               │ error / bad key
//!                  └───┘                         ▼                     ▼
//!                                             Failed ◀──timeout── AwaitingResult ──found──▶ Ready
//! ```
//!
//! Every async completion carries the epoch it was started under. The epoch
//! moves on each upload and each reset, so late results of superseded work
//! are dropped instead of resurrecting an old state.

use crate::backend::ResizeBackend;
use crate::config::{ClientConfig, OutputConfig};
use crate::object_key::{derive_output_key, DerivedKey, KeyDerivationError, KeyLayout};
use crate::params::{ParamValidator, TransformParams};
use crate::poller::{ActivePolls, PollOutcome, PollPolicy, PollState, PollTimeoutError, Poller};
use crate::resolver::{ResultAsset, ResultResolver};
use crate::upload::{
    GrantError, SelectedFile, TransferError, TransformRequest, UploadCoordinator, UploadGrant,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

const TIMEOUT_MESSAGE: &str =
    "Image processing timed out. It may still complete later; please check back or try again.";

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Grant,
    Transfer,
    KeyDerivation,
    Timeout,
}

/// What the display layer shows for a failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&GrantError> for ErrorInfo {
    fn from(e: &GrantError) -> Self {
        Self {
            kind: ErrorKind::Grant,
            message: e.to_string(),
        }
    }
}

impl From<&TransferError> for ErrorInfo {
    fn from(e: &TransferError) -> Self {
        Self {
            kind: ErrorKind::Transfer,
            message: e.to_string(),
        }
    }
}

impl From<&KeyDerivationError> for ErrorInfo {
    fn from(e: &KeyDerivationError) -> Self {
        Self {
            kind: ErrorKind::KeyDerivation,
            message: e.to_string(),
        }
    }
}

impl From<&PollTimeoutError> for ErrorInfo {
    fn from(_: &PollTimeoutError) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: TIMEOUT_MESSAGE.to_string(),
        }
    }
}

/// State of a session. Exactly one per session.
#[derive(Debug, Clone)]
pub enum WorkflowState {
    Idle,
    FileSelected {
        file: SelectedFile,
    },
    RequestingGrant {
        request: TransformRequest,
        file: SelectedFile,
    },
    /// The file has been handed to the transfer; only the grant stays here.
    Uploading {
        request: TransformRequest,
        grant: UploadGrant,
    },
    AwaitingResult {
        uploaded_key: String,
        output: DerivedKey,
        poll: PollState,
    },
    Ready(ResultAsset),
    Failed(ErrorInfo),
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::FileSelected { .. } => "file_selected",
            WorkflowState::RequestingGrant { .. } => "requesting_grant",
            WorkflowState::Uploading { .. } => "uploading",
            WorkflowState::AwaitingResult { .. } => "awaiting_result",
            WorkflowState::Ready(_) => "ready",
            WorkflowState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Ready(_) | WorkflowState::Failed(_))
    }

    pub fn status_message(&self) -> String {
        match self {
            WorkflowState::Idle => "Select an image to resize.".to_string(),
            WorkflowState::FileSelected { file } => format!("Selected: {}", file.name),
            WorkflowState::RequestingGrant { .. } => "Getting upload URL...".to_string(),
            WorkflowState::Uploading { .. } => "Uploading image...".to_string(),
            WorkflowState::AwaitingResult { uploaded_key, poll, .. } => {
                let waiting = format!(
                    "Upload successful ({})! Waiting for resized version...",
                    uploaded_key
                );
                if poll.attempt_count == 0 {
                    waiting
                } else {
                    format!("{} (check {}/{})", waiting, poll.attempt_count, poll.max_attempts)
                }
            }
            WorkflowState::Ready(_) => "Resized image loaded.".to_string(),
            WorkflowState::Failed(info) if info.kind == ErrorKind::Timeout => info.message.clone(),
            WorkflowState::Failed(info) => format!("Error: {}", info.message),
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    FileChosen(SelectedFile),
    QualityEdited(String),
    QualityIncremented,
    QualityDecremented,
    WidthEdited(String),
    HeightEdited(String),
    UploadRequested,
    GrantReceived { epoch: u64, grant: UploadGrant },
    GrantFailed { epoch: u64, error: GrantError },
    TransferSucceeded { epoch: u64, assigned_key: String },
    TransferFailed { epoch: u64, error: TransferError },
    ProbeAttempted { epoch: u64, attempt: u32 },
    ArtifactFound { epoch: u64, url: String },
    AttemptsExhausted { epoch: u64, error: PollTimeoutError },
    ResetRequested,
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::FileChosen(_) => "file_chosen",
            WorkflowEvent::QualityEdited(_) => "quality_edited",
            WorkflowEvent::QualityIncremented => "quality_incremented",
            WorkflowEvent::QualityDecremented => "quality_decremented",
            WorkflowEvent::WidthEdited(_) => "width_edited",
            WorkflowEvent::HeightEdited(_) => "height_edited",
            WorkflowEvent::UploadRequested => "upload_requested",
            WorkflowEvent::GrantReceived { .. } => "grant_received",
            WorkflowEvent::GrantFailed { .. } => "grant_failed",
            WorkflowEvent::TransferSucceeded { .. } => "transfer_succeeded",
            WorkflowEvent::TransferFailed { .. } => "transfer_failed",
            WorkflowEvent::ProbeAttempted { .. } => "probe_attempted",
            WorkflowEvent::ArtifactFound { .. } => "artifact_found",
            WorkflowEvent::AttemptsExhausted { .. } => "attempts_exhausted",
            WorkflowEvent::ResetRequested => "reset_requested",
        }
    }

    /// Epoch of an async completion. `None` for user input.
    fn epoch(&self) -> Option<u64> {
        match self {
            WorkflowEvent::GrantReceived { epoch, .. }
            | WorkflowEvent::GrantFailed { epoch, .. }
            | WorkflowEvent::TransferSucceeded { epoch, .. }
            | WorkflowEvent::TransferFailed { epoch, .. }
            | WorkflowEvent::ProbeAttempted { epoch, .. }
            | WorkflowEvent::ArtifactFound { epoch, .. }
            | WorkflowEvent::AttemptsExhausted { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}

/// Work a transition asks the driver to start.
#[derive(Debug)]
pub enum Effect {
    RequestGrant {
        epoch: u64,
        request: TransformRequest,
    },
    Transfer {
        epoch: u64,
        grant: UploadGrant,
        file: SelectedFile,
    },
    /// Run a poll loop for `poll`, which shares its cancel token with the
    /// `AwaitingResult` state.
    StartPoll { epoch: u64, poll: PollState },
}

/// The state machine. Pure apart from logging: async work is returned as
/// [`Effect`]s for the caller to run.
pub struct Session {
    state: WorkflowState,
    epoch: u64,
    validator: ParamValidator,
    layout: KeyLayout,
    output: OutputConfig,
    policy: PollPolicy,
}

impl Session {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: WorkflowState::Idle,
            epoch: 0,
            validator: ParamValidator::new(TransformParams::from(&config.transform)),
            layout: KeyLayout::from(&config.output),
            output: config.output.clone(),
            policy: PollPolicy::from(&config.polling),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn params(&self) -> TransformParams {
        self.validator.params()
    }

    /// Apply one event. Events that do not fit the current state, or that
    /// belong to a superseded epoch, leave the state untouched.
    pub fn apply(&mut self, event: WorkflowEvent) -> Vec<Effect> {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch {
                debug!(
                    event = event.name(),
                    event_epoch = epoch,
                    current_epoch = self.epoch,
                    "Dropping stale event"
                );
                return Vec::new();
            }
        }

        let event_name = event.name();
        let state = std::mem::replace(&mut self.state, WorkflowState::Idle);
        let from = state.name();
        let mut effects = Vec::new();

        let next = match (state, event) {
            (state, WorkflowEvent::ResetRequested) => {
                if let WorkflowState::AwaitingResult { mut poll, .. } = state {
                    poll.stop();
                }
                self.epoch += 1;
                WorkflowState::Idle
            }

            (WorkflowState::Idle, WorkflowEvent::FileChosen(file)) => {
                WorkflowState::FileSelected { file }
            }

            (WorkflowState::FileSelected { file }, WorkflowEvent::QualityEdited(input)) => {
                self.validator.apply_quality(&input);
                WorkflowState::FileSelected { file }
            }
            (WorkflowState::FileSelected { file }, WorkflowEvent::QualityIncremented) => {
                self.validator.increment_quality();
                WorkflowState::FileSelected { file }
            }
            (WorkflowState::FileSelected { file }, WorkflowEvent::QualityDecremented) => {
                self.validator.decrement_quality();
                WorkflowState::FileSelected { file }
            }
            (WorkflowState::FileSelected { file }, WorkflowEvent::WidthEdited(input)) => {
                self.validator.apply_width(&input);
                WorkflowState::FileSelected { file }
            }
            (WorkflowState::FileSelected { file }, WorkflowEvent::HeightEdited(input)) => {
                self.validator.apply_height(&input);
                WorkflowState::FileSelected { file }
            }

            (WorkflowState::FileSelected { file }, WorkflowEvent::UploadRequested) => {
                self.epoch += 1;
                let request = TransformRequest::new(&file, self.validator.params());
                effects.push(Effect::RequestGrant {
                    epoch: self.epoch,
                    request: request.clone(),
                });
                WorkflowState::RequestingGrant { request, file }
            }

            (
                WorkflowState::RequestingGrant { request, file },
                WorkflowEvent::GrantReceived { grant, .. },
            ) => {
                effects.push(Effect::Transfer {
                    epoch: self.epoch,
                    grant: grant.clone(),
                    file,
                });
                WorkflowState::Uploading { request, grant }
            }
            (WorkflowState::RequestingGrant { .. }, WorkflowEvent::GrantFailed { error, .. }) => {
                warn!(error = %error, "Upload grant refused");
                WorkflowState::Failed(ErrorInfo::from(&error))
            }

            (
                WorkflowState::Uploading { request, .. },
                WorkflowEvent::TransferSucceeded { assigned_key, .. },
            ) => match derive_output_key(&assigned_key, &request.params(), &self.layout) {
                Ok(output) => {
                    let url = self.output.object_url(&output.key);
                    let poll = PollState::new(url, self.policy);
                    effects.push(Effect::StartPoll {
                        epoch: self.epoch,
                        poll: poll.clone(),
                    });
                    WorkflowState::AwaitingResult {
                        uploaded_key: assigned_key,
                        output,
                        poll,
                    }
                }
                Err(e) => {
                    error!(key = %e.key(), error = %e, "Cannot derive output key");
                    WorkflowState::Failed(ErrorInfo::from(&e))
                }
            },
            (WorkflowState::Uploading { .. }, WorkflowEvent::TransferFailed { error, .. }) => {
                WorkflowState::Failed(ErrorInfo::from(&error))
            }

            (
                WorkflowState::AwaitingResult {
                    uploaded_key,
                    output,
                    mut poll,
                },
                WorkflowEvent::ProbeAttempted { attempt, .. },
            ) => {
                poll.attempt_count = attempt;
                WorkflowState::AwaitingResult {
                    uploaded_key,
                    output,
                    poll,
                }
            }
            (
                WorkflowState::AwaitingResult {
                    output, mut poll, ..
                },
                WorkflowEvent::ArtifactFound { url, .. },
            ) => {
                poll.stop();
                metrics::counter!("resize_client.results.ready").increment(1);
                WorkflowState::Ready(ResultResolver::resolve(&url, &output))
            }
            (
                WorkflowState::AwaitingResult { mut poll, .. },
                WorkflowEvent::AttemptsExhausted { error, .. },
            ) => {
                poll.stop();
                WorkflowState::Failed(ErrorInfo::from(&error))
            }

            (state, event) => {
                debug!(
                    state = state.name(),
                    event = event.name(),
                    "Ignoring event in current state"
                );
                state
            }
        };

        if next.name() != from {
            info!(
                from,
                to = next.name(),
                event = event_name,
                epoch = self.epoch,
                "Workflow transition"
            );
        }

        self.state = next;
        effects
    }
}

/// Client side of a running [`Workflow`].
#[derive(Clone)]
pub struct WorkflowHandle {
    events: mpsc::UnboundedSender<WorkflowEvent>,
    state: watch::Receiver<WorkflowState>,
    shutdown: CancellationToken,
    active_polls: ActivePolls,
}

impl WorkflowHandle {
    /// Queue an event. Returns false once the workflow has stopped.
    pub fn send(&self, event: WorkflowEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// A receiver that sees every published state.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.clone()
    }

    /// The latest published state.
    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn active_polls(&self) -> usize {
        self.active_polls.count()
    }
}

/// Drives a [`Session`]: runs its effects as tasks and feeds their
/// completions back in, one event at a time.
///
/// Only handles hold strong event senders. Once every handle is gone the
/// workflow stops and cancels its poll.
pub struct Workflow {
    id: Uuid,
    session: Session,
    coordinator: UploadCoordinator,
    poller: Poller,
    events_tx: mpsc::WeakUnboundedSender<WorkflowEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    state_tx: watch::Sender<WorkflowState>,
    active_poll: Option<(CancellationToken, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl Workflow {
    pub fn new(config: &ClientConfig, backend: Arc<dyn ResizeBackend>) -> (Self, WorkflowHandle) {
        let session = Session::new(config);
        let poller = Poller::new(backend.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkflowState::Idle);
        let shutdown = CancellationToken::new();

        let handle = WorkflowHandle {
            events: events_tx.clone(),
            state: state_rx,
            shutdown: shutdown.clone(),
            active_polls: poller.active().clone(),
        };

        let workflow = Self {
            id: Uuid::new_v4(),
            session,
            coordinator: UploadCoordinator::new(backend),
            poller,
            events_tx: events_tx.downgrade(),
            events_rx,
            state_tx,
            active_poll: None,
            shutdown,
        };

        (workflow, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let span = tracing::info_span!("workflow", session = %self.id);

        async move {
            info!("Workflow started");

            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    event = self.events_rx.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("All handles dropped");
                            break;
                        }
                    },
                }
            }

            self.stop_active_poll().await;
            info!("Workflow stopped");
        }
        .instrument(span)
        .await
    }

    /// Apply one event, publish the resulting state and start its effects.
    pub async fn handle_event(&mut self, event: WorkflowEvent) {
        if matches!(event, WorkflowEvent::ResetRequested) {
            self.stop_active_poll().await;
        }

        let effects = self.session.apply(event);
        self.state_tx.send_replace(self.session.state().clone());

        for effect in effects {
            self.start(effect).await;
        }
    }

    async fn start(&mut self, effect: Effect) {
        let tx = self.events_tx.clone();

        match effect {
            Effect::RequestGrant { epoch, request } => {
                let coordinator = self.coordinator.clone();
                tokio::spawn(
                    async move {
                        let event = match coordinator.request_grant(&request).await {
                            Ok(grant) => WorkflowEvent::GrantReceived { epoch, grant },
                            Err(error) => WorkflowEvent::GrantFailed { epoch, error },
                        };
                        notify(&tx, event);
                    }
                    .in_current_span(),
                );
            }
            Effect::Transfer { epoch, grant, file } => {
                let coordinator = self.coordinator.clone();
                tokio::spawn(
                    async move {
                        let event = match coordinator.transfer(grant, file).await {
                            Ok(assigned_key) => {
                                WorkflowEvent::TransferSucceeded { epoch, assigned_key }
                            }
                            Err(error) => WorkflowEvent::TransferFailed { epoch, error },
                        };
                        notify(&tx, event);
                    }
                    .in_current_span(),
                );
            }
            Effect::StartPoll { epoch, poll } => {
                // At most one poll loop per session.
                self.stop_active_poll().await;

                let poller = self.poller.clone();
                let cancel = poll.cancel.clone();
                let task = tokio::spawn(
                    async move {
                        let progress = tx.clone();
                        let outcome = poller
                            .run(&poll, move |attempt| {
                                notify(&progress, WorkflowEvent::ProbeAttempted { epoch, attempt });
                            })
                            .await;

                        let event = match outcome {
                            PollOutcome::Found { url, .. } => WorkflowEvent::ArtifactFound { epoch, url },
                            PollOutcome::TimedOut(error) => {
                                WorkflowEvent::AttemptsExhausted { epoch, error }
                            }
                            PollOutcome::Cancelled => return,
                        };
                        notify(&tx, event);
                    }
                    .in_current_span(),
                );
                self.active_poll = Some((cancel, task));
            }
        }
    }

    /// Cancel the running poll, if any, and wait for its task to exit.
    async fn stop_active_poll(&mut self) {
        if let Some((cancel, task)) = self.active_poll.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Poll task ended abnormally");
            }
        }
    }
}

/// Deliver a completion unless the workflow has already gone away.
fn notify(events: &mpsc::WeakUnboundedSender<WorkflowEvent>, event: WorkflowEvent) {
    if let Some(events) = events.upgrade() {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProbeOutcome;
    use crate::testing::ScriptedBackend;
    use bytes::Bytes;
    use std::time::Duration;

    fn photo() -> SelectedFile {
        SelectedFile::new("photo.png", "image/png", Bytes::from_static(b"\x89PNG"))
    }

    fn grant(key: &str) -> UploadGrant {
        UploadGrant {
            write_url: "https://uploads.example/photo.png".to_string(),
            assigned_key: key.to_string(),
        }
    }

    fn spawn(backend: Arc<ScriptedBackend>) -> WorkflowHandle {
        let (workflow, handle) = Workflow::new(&ClientConfig::default(), backend);
        tokio::spawn(workflow.run());
        handle
    }

    async fn wait_until(
        handle: &WorkflowHandle,
        mut done: impl FnMut(&WorkflowState) -> bool,
    ) -> WorkflowState {
        let mut rx = handle.subscribe();
        let state = rx.wait_for(|s| done(s)).await.unwrap();
        (*state).clone()
    }

    fn upload(handle: &WorkflowHandle) {
        assert!(handle.send(WorkflowEvent::FileChosen(photo())));
        assert!(handle.send(WorkflowEvent::UploadRequested));
    }

    /// Session driven up to AwaitingResult for `key`; returns the poll token.
    fn awaiting(session: &mut Session, key: &str) -> Vec<Effect> {
        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::UploadRequested);
        let epoch = session.epoch();
        session.apply(WorkflowEvent::GrantReceived {
            epoch,
            grant: grant(key),
        });
        session.apply(WorkflowEvent::TransferSucceeded {
            epoch,
            assigned_key: key.to_string(),
        })
    }

    #[test]
    fn test_edits_only_apply_with_file_selected() {
        let mut session = Session::new(&ClientConfig::default());
        session.apply(WorkflowEvent::QualityEdited("10".to_string()));
        assert_eq!(session.params().quality, 85);

        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::QualityEdited("abc".to_string()));
        assert_eq!(session.params().quality, 85);
        assert_eq!(session.state().name(), "file_selected");

        session.apply(WorkflowEvent::QualityEdited("150".to_string()));
        assert_eq!(session.params().quality, 100);
        session.apply(WorkflowEvent::QualityDecremented);
        assert_eq!(session.params().quality, 99);
        session.apply(WorkflowEvent::WidthEdited("200".to_string()));
        session.apply(WorkflowEvent::HeightEdited("-5".to_string()));
        assert_eq!(session.params().max_width, 200);
        assert_eq!(session.params().max_height, 1);
    }

    #[test]
    fn test_upload_request_carries_current_params() {
        let mut session = Session::new(&ClientConfig::default());
        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::QualityIncremented);

        let effects = session.apply(WorkflowEvent::UploadRequested);

        assert_eq!(session.epoch(), 1);
        match effects.as_slice() {
            [Effect::RequestGrant { epoch: 1, request }] => {
                assert_eq!(request.file_name, "photo.png");
                assert_eq!(request.quality, 86);
                assert_eq!(request.max_width, 800);
            }
            other => panic!("unexpected effects: {:?}", other),
        }
        assert_eq!(session.state().status_message(), "Getting upload URL...");
    }

    #[test]
    fn test_stale_grant_after_reset_is_dropped() {
        let mut session = Session::new(&ClientConfig::default());
        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::UploadRequested);
        session.apply(WorkflowEvent::ResetRequested);

        let effects = session.apply(WorkflowEvent::GrantReceived {
            epoch: 1,
            grant: grant("q85_w800_h600/photo.png"),
        });

        assert!(effects.is_empty());
        assert!(matches!(session.state(), WorkflowState::Idle));
        assert_eq!(session.epoch(), 2);
    }

    #[test]
    fn test_transfer_success_starts_poll_on_derived_url() {
        let mut session = Session::new(&ClientConfig::default());
        let effects = awaiting(&mut session, "q90_w200_h200/photo.png");

        let expected = ClientConfig::default()
            .output
            .object_url("resized-q90_w200_h200/photo.jpeg");
        match effects.as_slice() {
            [Effect::StartPoll { epoch: 1, poll }] => {
                assert_eq!(poll.target_url, expected);
                assert_eq!(poll.max_attempts, 15);
                assert_eq!(poll.interval, Duration::from_millis(2000));
                assert!(!poll.cancel.is_cancelled());
            }
            other => panic!("unexpected effects: {:?}", other),
        }
        assert_eq!(
            session.state().status_message(),
            "Upload successful (q90_w200_h200/photo.png)! Waiting for resized version..."
        );

        session.apply(WorkflowEvent::ProbeAttempted { epoch: 1, attempt: 3 });
        assert!(session.state().status_message().ends_with("(check 3/15)"));
    }

    #[test]
    fn test_reset_cancels_poll_token() {
        let mut session = Session::new(&ClientConfig::default());
        let effects = awaiting(&mut session, "q90_w200_h200/photo.png");
        let Some(Effect::StartPoll { poll, .. }) = effects.into_iter().next() else {
            panic!("expected a poll to start");
        };

        session.apply(WorkflowEvent::ResetRequested);

        assert!(poll.cancel.is_cancelled());
        let late = session.apply(WorkflowEvent::ArtifactFound {
            epoch: 1,
            url: "https://out.example/x.jpeg".to_string(),
        });
        assert!(late.is_empty());
        assert!(matches!(session.state(), WorkflowState::Idle));
    }

    #[test]
    fn test_found_cancels_poll_token() {
        let mut session = Session::new(&ClientConfig::default());
        let effects = awaiting(&mut session, "q90_w200_h200/photo.png");
        let Some(Effect::StartPoll { poll, .. }) = effects.into_iter().next() else {
            panic!("expected a poll to start");
        };

        session.apply(WorkflowEvent::ArtifactFound {
            epoch: 1,
            url: poll.target_url.clone(),
        });

        assert!(poll.cancel.is_cancelled());
        match session.state() {
            WorkflowState::Ready(asset) => assert_eq!(asset.params.quality, 90),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    /// Feed a terminal session everything except a reset; nothing may move it.
    fn assert_stays_put(session: &mut Session) {
        let before = format!("{:?}", session.state());
        let epoch = session.epoch();

        let events = vec![
            WorkflowEvent::FileChosen(photo()),
            WorkflowEvent::QualityEdited("10".to_string()),
            WorkflowEvent::UploadRequested,
            WorkflowEvent::GrantReceived {
                epoch,
                grant: grant("q85_w800_h600/photo.png"),
            },
            WorkflowEvent::TransferSucceeded {
                epoch,
                assigned_key: "q85_w800_h600/photo.png".to_string(),
            },
            WorkflowEvent::ProbeAttempted { epoch, attempt: 2 },
            WorkflowEvent::ArtifactFound {
                epoch,
                url: "https://out.example/other.jpeg".to_string(),
            },
        ];

        for event in events {
            let name = event.name();
            let effects = session.apply(event);
            assert!(effects.is_empty(), "{} produced effects", name);
            assert_eq!(format!("{:?}", session.state()), before, "{} moved the state", name);
            assert_eq!(session.epoch(), epoch);
        }
    }

    #[test]
    fn test_ready_ignores_everything_but_reset() {
        let mut session = Session::new(&ClientConfig::default());
        let effects = awaiting(&mut session, "q90_w200_h200/photo.png");
        let Some(Effect::StartPoll { poll, .. }) = effects.into_iter().next() else {
            panic!("expected a poll to start");
        };
        session.apply(WorkflowEvent::ArtifactFound {
            epoch: 1,
            url: poll.target_url,
        });
        assert_eq!(session.state().name(), "ready");

        assert_stays_put(&mut session);

        session.apply(WorkflowEvent::ResetRequested);
        assert!(matches!(session.state(), WorkflowState::Idle));
    }

    #[test]
    fn test_failed_ignores_everything_but_reset() {
        let mut session = Session::new(&ClientConfig::default());
        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::UploadRequested);
        session.apply(WorkflowEvent::GrantFailed {
            epoch: 1,
            error: GrantError::Network("connection refused".to_string()),
        });
        assert_eq!(session.state().name(), "failed");

        assert_stays_put(&mut session);

        session.apply(WorkflowEvent::ResetRequested);
        assert!(matches!(session.state(), WorkflowState::Idle));
    }

    #[test]
    fn test_file_chosen_ignored_while_busy() {
        let mut session = Session::new(&ClientConfig::default());
        session.apply(WorkflowEvent::FileChosen(photo()));
        session.apply(WorkflowEvent::UploadRequested);

        let other = SelectedFile::new("other.gif", "image/gif", Bytes::from_static(b"GIF8"));
        session.apply(WorkflowEvent::FileChosen(other));
        assert!(session.apply(WorkflowEvent::UploadRequested).is_empty());

        match session.state() {
            WorkflowState::RequestingGrant { file, .. } => assert_eq!(file.name, "photo.png"),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_found_after_four_probes() {
        let backend = Arc::new(ScriptedBackend::with_probes(vec![
            ProbeOutcome::NotReady { status: 404 },
            ProbeOutcome::NotReady { status: 404 },
            ProbeOutcome::NotReady { status: 404 },
            ProbeOutcome::Ready,
        ]));
        let handle = spawn(backend.clone());

        upload(&handle);
        let state = wait_until(&handle, WorkflowState::is_terminal).await;

        let asset = match state {
            WorkflowState::Ready(asset) => asset,
            other => panic!("expected Ready, got {:?}", other),
        };
        let expected = ClientConfig::default()
            .output
            .object_url("resized-q85_w800_h600/photo.jpeg");
        assert_eq!(asset.source_url, expected);
        assert!(asset.access_url.starts_with(&format!("{}?t=", expected)));
        assert_eq!(asset.download_file_name(), "photo_q85_w800_h600.jpeg");
        assert_eq!(backend.probe_count(), 4);
        assert_eq!(backend.put_count(), 1);
        assert_eq!(handle.state().status_message(), "Resized image loaded.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_extra_probe() {
        let backend = Arc::new(ScriptedBackend::always_not_ready());
        let handle = spawn(backend.clone());

        upload(&handle);
        let state = wait_until(&handle, WorkflowState::is_terminal).await;

        match &state {
            WorkflowState::Failed(info) => assert_eq!(info.kind, ErrorKind::Timeout),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(state.status_message(), TIMEOUT_MESSAGE);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.probe_count(), 15);
        assert_eq!(handle.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_failure_skips_transfer() {
        let backend = Arc::new(ScriptedBackend::default().with_grant(Err(GrantError::Status {
            status: 500,
            message: "quota exceeded".to_string(),
        })));
        let handle = spawn(backend.clone());

        upload(&handle);
        let state = wait_until(&handle, WorkflowState::is_terminal).await;

        match &state {
            WorkflowState::Failed(info) => {
                assert_eq!(info.kind, ErrorKind::Grant);
                assert!(info.message.contains("quota exceeded"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(state.status_message().starts_with("Error: "));
        assert_eq!(backend.put_count(), 0);
        assert_eq!(backend.probe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_failure_never_polls() {
        let backend = Arc::new(ScriptedBackend::default().with_transfer(Err(
            TransferError::Status {
                status: 403,
                body: "SignatureDoesNotMatch".to_string(),
            },
        )));
        let handle = spawn(backend.clone());

        upload(&handle);
        let state = wait_until(&handle, WorkflowState::is_terminal).await;

        assert!(matches!(
            state,
            WorkflowState::Failed(ErrorInfo {
                kind: ErrorKind::Transfer,
                ..
            })
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.probe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_key_fails_without_polling() {
        let backend =
            Arc::new(ScriptedBackend::default().with_grant(Ok(grant("uploads/photo.png"))));
        let handle = spawn(backend.clone());

        upload(&handle);
        let state = wait_until(&handle, WorkflowState::is_terminal).await;

        match state {
            WorkflowState::Failed(info) => {
                assert_eq!(info.kind, ErrorKind::KeyDerivation);
                assert!(info.message.contains("uploads/photo.png"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(backend.put_count(), 1);
        assert_eq!(backend.probe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_grant_after_reset_is_ignored() {
        let backend =
            Arc::new(ScriptedBackend::default().with_grant_delay(Duration::from_millis(1000)));
        let handle = spawn(backend.clone());

        upload(&handle);
        wait_until(&handle, |s| matches!(s, WorkflowState::RequestingGrant { .. })).await;
        handle.send(WorkflowEvent::ResetRequested);
        wait_until(&handle, |s| matches!(s, WorkflowState::Idle)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(matches!(handle.state(), WorkflowState::Idle));
        assert_eq!(backend.grant_requests().len(), 1);
        assert_eq!(backend.put_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reupload_keeps_single_poll() {
        let backend = Arc::new(ScriptedBackend::always_not_ready());
        let handle = spawn(backend.clone());

        upload(&handle);
        wait_until(&handle, |s| matches!(s, WorkflowState::AwaitingResult { .. })).await;
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(handle.active_polls(), 1);

        handle.send(WorkflowEvent::ResetRequested);
        upload(&handle);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(handle.state(), WorkflowState::AwaitingResult { .. }));
        assert_eq!(handle.active_polls(), 1);
        assert_eq!(backend.grant_requests().len(), 2);

        // Two probes from the first poll, then the second poll's first tick.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(backend.probe_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_upload_request_sends_one_grant() {
        let backend = Arc::new(ScriptedBackend::with_probes(vec![ProbeOutcome::Ready]));
        let handle = spawn(backend.clone());

        upload(&handle);
        handle.send(WorkflowEvent::UploadRequested);
        wait_until(&handle, WorkflowState::is_terminal).await;

        assert_eq!(backend.grant_requests().len(), 1);
        assert!(handle.active_polls() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let backend = Arc::new(ScriptedBackend::always_not_ready());
        let (workflow, handle) = Workflow::new(&ClientConfig::default(), backend);
        let task = tokio::spawn(workflow.run());

        upload(&handle);
        wait_until(&handle, |s| matches!(s, WorkflowState::AwaitingResult { .. })).await;
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(handle.active_polls(), 0);
        assert!(!handle.send(WorkflowEvent::ResetRequested));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_polling() {
        let backend = Arc::new(ScriptedBackend::always_not_ready());
        let (workflow, handle) = Workflow::new(&ClientConfig::default(), backend.clone());
        let polls = workflow.poller.active().clone();
        let task = tokio::spawn(workflow.run());

        upload(&handle);
        wait_until(&handle, |s| matches!(s, WorkflowState::AwaitingResult { .. })).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.count(), 1);

        drop(handle);

        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("workflow kept running without handles")
            .unwrap();
        assert_eq!(polls.count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.probe_count(), 0);
    }
}
