//! Resize Client
//!
//! Client-side orchestration for an asynchronous image resize pipeline. A file
//! is uploaded straight to object storage through a pre-authorized write URL,
//! a storage-triggered worker produces the resized output, and the client
//! predicts where that output will land and polls for it until it exists or
//! the attempt budget runs out.
//!
//! ## Architecture
//!
//! ```text
//!  UI / CLI                 Workflow                      External
//! ┌──────────┐  events   ┌──────────────┐  grant     ┌──────────────────┐
//! │ file,    │──────────▶│ Session      │──────────▶ │ Issuing endpoint │
//! │ params,  │           │ (state       │  PUT bytes ├──────────────────┤
//! │ reset    │◀──────────│  machine)    │──────────▶ │ Upload bucket    │
//! └──────────┘  watch    └──────────────┘            └────────┬─────────┘
//!                             │    ▲                          │ pipeline
//!                  derive key │    │ found / timed out        ▼
//!                             ▼    │                 ┌──────────────────┐
//!                        ┌──────────────┐  HEAD ?t=  │ Output bucket    │
//!                        │ Poller       │──────────▶ │                  │
//!                        └──────────────┘            └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use resize_client::{ClientConfig, HttpBackend, SelectedFile, Workflow, WorkflowEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load()?;
//!     let backend = Arc::new(HttpBackend::new(&config.issuer)?);
//!     let (workflow, handle) = Workflow::new(&config, backend);
//!     tokio::spawn(workflow.run());
//!
//!     let file = SelectedFile::from_path("photo.png".as_ref()).await?;
//!     handle.send(WorkflowEvent::FileChosen(file));
//!     handle.send(WorkflowEvent::UploadRequested);
//!
//!     let mut state = handle.subscribe();
//!     let done = state.wait_for(|s| s.is_terminal()).await?;
//!     println!("{}", done.status_message());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod object_key;
pub mod params;
pub mod poller;
pub mod resolver;
pub mod upload;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use backend::{HttpBackend, ProbeOutcome, ResizeBackend};
pub use config::{ClientConfig, ConfigValidationError};
pub use object_key::{derive_output_key, DerivedKey, KeyDerivationError, KeyLayout, LegacyKeyStyle};
pub use params::{ParamValidator, TransformParams, ValidationError};
pub use poller::{PollOutcome, PollPolicy, PollTimeoutError, Poller};
pub use resolver::{DownloadError, ResultAsset, ResultResolver};
pub use upload::{
    FileSelectionError, GrantError, SelectedFile, TransferError, TransformRequest,
    UploadCoordinator, UploadGrant,
};
pub use workflow::{
    ErrorInfo, ErrorKind, Workflow, WorkflowEvent, WorkflowHandle, WorkflowState,
};
