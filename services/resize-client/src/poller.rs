//! Bounded existence polling for a predicted output object.
//!
//! One probe per tick. 403/404 means "not yet", anything else that is not a
//! success is logged and absorbed. The loop ends on the first success, on
//! cancellation, or once `max_attempts` probes have come back empty-handed.

use crate::backend::{ProbeOutcome, ResizeBackend};
use crate::config::PollingConfig;
use crate::resolver::{cache_busted_url, cache_token};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The output never showed up within the attempt budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("No result at {url} after {attempts} attempts; processing may still complete later")]
pub struct PollTimeoutError {
    pub url: String,
    pub attempts: u32,
}

/// Interval and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            max_attempts: config.max_attempts,
        }
    }
}

/// The active poll of a session, owned by the `AwaitingResult` state.
#[derive(Debug, Clone)]
pub struct PollState {
    pub target_url: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub interval: Duration,
    pub cancel: CancellationToken,
}

impl PollState {
    pub fn new(target_url: String, policy: PollPolicy) -> Self {
        Self {
            target_url,
            attempt_count: 0,
            max_attempts: policy.max_attempts,
            interval: policy.interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the poll and forget its attempts.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.attempt_count = 0;
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Found { url: String, attempts: u32 },
    TimedOut(PollTimeoutError),
    Cancelled,
}

/// Number of poll loops currently running.
#[derive(Debug, Clone, Default)]
pub struct ActivePolls(Arc<AtomicUsize>);

impl ActivePolls {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActivePollGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActivePollGuard(self.0.clone())
    }
}

struct ActivePollGuard(Arc<AtomicUsize>);

impl Drop for ActivePollGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs poll loops against a backend.
#[derive(Clone)]
pub struct Poller {
    backend: Arc<dyn ResizeBackend>,
    active: ActivePolls,
}

impl Poller {
    pub fn new(backend: Arc<dyn ResizeBackend>) -> Self {
        Self {
            backend,
            active: ActivePolls::default(),
        }
    }

    pub fn active(&self) -> &ActivePolls {
        &self.active
    }

    /// Poll `poll.target_url` until it exists, the budget runs out, or
    /// `poll.cancel` fires.
    ///
    /// `on_attempt` is called with the attempt number right before each probe.
    pub async fn run<F>(&self, poll: &PollState, mut on_attempt: F) -> PollOutcome
    where
        F: FnMut(u32) + Send,
    {
        let _guard = self.active.enter();
        let url = poll.target_url.as_str();
        let cancel = &poll.cancel;
        let max_attempts = poll.max_attempts;

        let mut ticker = interval_at(Instant::now() + poll.interval, poll.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(url = %url, max_attempts, "Polling for result");

        let mut attempts = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(url = %url, attempts, "Polling cancelled");
                    return PollOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            if attempts > max_attempts {
                return self.timed_out(url, attempts - 1);
            }

            on_attempt(attempts);
            metrics::counter!("resize_client.probes.sent").increment(1);

            let probe_url = cache_busted_url(url, &cache_token());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(url = %url, attempt = attempts, "Discarding in-flight probe");
                    return PollOutcome::Cancelled;
                }
                outcome = self.backend.probe(&probe_url) => outcome,
            };

            match outcome {
                ProbeOutcome::Ready => {
                    info!(url = %url, attempt = attempts, "Result found");
                    return PollOutcome::Found {
                        url: url.to_string(),
                        attempts,
                    };
                }
                ProbeOutcome::NotReady { status } => {
                    debug!(url = %url, attempt = attempts, status, "Result not ready yet");
                }
                ProbeOutcome::Transient { reason } => {
                    metrics::counter!("resize_client.probes.transient").increment(1);
                    warn!(url = %url, attempt = attempts, reason = %reason, "Probe failed, will retry");
                }
            }

            if attempts >= max_attempts {
                return self.timed_out(url, attempts);
            }
        }
    }

    fn timed_out(&self, url: &str, attempts: u32) -> PollOutcome {
        metrics::counter!("resize_client.poll.timeouts").increment(1);
        warn!(url = %url, attempts, "Polling timed out");
        PollOutcome::TimedOut(PollTimeoutError {
            url: url.to_string(),
            attempts,
        })
    }
}
