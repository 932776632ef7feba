use anyhow::{bail, Context, Result};
use clap::Parser;
use resize_client::config::LoggingConfig;
use resize_client::{
    ClientConfig, HttpBackend, ResizeBackend, ResultResolver, SelectedFile, Workflow,
    WorkflowEvent, WorkflowState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upload an image to the resize pipeline and wait for the result.
#[derive(Parser, Debug)]
#[command(name = "resize-client")]
#[command(version)]
struct Cli {
    /// Image to upload (jpeg, png, gif or webp)
    file: PathBuf,

    /// JPEG quality, 1-100
    #[arg(short, long, allow_hyphen_values = true)]
    quality: Option<String>,

    /// Maximum output width in pixels
    #[arg(short = 'W', long, allow_hyphen_values = true)]
    width: Option<String>,

    /// Maximum output height in pixels
    #[arg(short = 'H', long, allow_hyphen_values = true)]
    height: Option<String>,

    /// Save the resized image into this directory
    #[arg(short, long, env = "RESIZE_CLIENT_DOWNLOAD_DIR")]
    download: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config files ({}), using environment only", e);
            ClientConfig::from_env().context("Failed to load configuration")?
        }
    };
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging);

    let backend: Arc<dyn ResizeBackend> =
        Arc::new(HttpBackend::new(&config.issuer).context("Failed to initialize HTTP backend")?);

    let file = SelectedFile::from_path(&cli.file)
        .await
        .with_context(|| format!("Cannot use {}", cli.file.display()))?;

    let (workflow, handle) = Workflow::new(&config, backend.clone());
    info!(session = %workflow.id(), file = %file.name, "Starting resize session");
    let worker = tokio::spawn(workflow.run());

    handle.send(WorkflowEvent::FileChosen(file));
    if let Some(quality) = cli.quality {
        handle.send(WorkflowEvent::QualityEdited(quality));
    }
    if let Some(width) = cli.width {
        handle.send(WorkflowEvent::WidthEdited(width));
    }
    if let Some(height) = cli.height {
        handle.send(WorkflowEvent::HeightEdited(height));
    }
    handle.send(WorkflowEvent::UploadRequested);

    let mut states = handle.subscribe();
    let mut last_status = String::new();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let finished = loop {
        let state = states.borrow_and_update().clone();

        let status = state.status_message();
        if status != last_status {
            println!("{}", status);
            last_status = status;
        }

        if state.is_terminal() {
            break Some(state);
        }

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    error!("Workflow stopped unexpectedly");
                    break None;
                }
            }
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C signal, resetting session");
                handle.send(WorkflowEvent::ResetRequested);
                let _ = states.wait_for(|s| matches!(s, WorkflowState::Idle)).await;
                break None;
            }
        }
    };

    handle.shutdown();
    if let Err(e) = worker.await {
        warn!(error = %e, "Workflow task ended abnormally");
    }

    match finished {
        Some(WorkflowState::Ready(asset)) => {
            println!("{}", asset.access_url);
            if let Some(dir) = cli.download {
                let path = ResultResolver::new(backend)
                    .download(&asset, &dir)
                    .await
                    .context("Failed to download resized image")?;
                println!("Saved {}", path.display());
            }
            Ok(())
        }
        Some(WorkflowState::Failed(info)) => bail!("{:?}: {}", info.kind, info.message),
        _ => bail!("Resize session cancelled"),
    }
}

fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Status lines go to stdout; logs stay on stderr.
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}
