//! Completion tracking for a submitted prompt.
//!
//! ComfyUI exposes no completion callback over plain HTTP, so
//! [`wait_for_completion`] polls `/history/{prompt_id}` on a fixed interval
//! until the prompt appears. The loop stops early when the optional
//! deadline passes or the [`CancellationToken`] is triggered.

use std::time::Duration;

use async_trait::async_trait;
use gridgen_core::error::CoreError;
use gridgen_core::history::{find_entry, HistoryEntry};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Delay between two history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Give up on a prompt after this long.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Tunable parameters for the polling loop.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// `None` polls until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_JOB_TIMEOUT),
        }
    }
}

/// Where the tracker reads job history from.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch the finished record for `prompt_id`, or `None` while it is
    /// still queued or running.
    async fn fetch_entry(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, TrackerError>;
}

#[async_trait]
impl HistorySource for ComfyUIApi {
    async fn fetch_entry(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, TrackerError> {
        let history = match self.get_history(prompt_id).await {
            Ok(history) => history,
            // Some proxies answer 404 until the record exists.
            Err(e) if e.status() == Some(404) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(find_entry(&history, prompt_id)?)
    }
}

/// A finished prompt.
#[derive(Debug)]
pub struct Completion {
    pub entry: HistoryEntry,
    /// Number of history requests made, including the final one.
    pub polls: u32,
    pub elapsed: Duration,
}

/// Errors that end tracking before the prompt finishes.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    History(#[from] CoreError),

    #[error("Prompt {prompt_id} did not finish within {}s", .timeout.as_secs())]
    TimedOut {
        prompt_id: String,
        timeout: Duration,
    },

    #[error("Tracking of prompt {prompt_id} was cancelled")]
    Cancelled { prompt_id: String },
}

/// Poll `source` until `prompt_id` shows up in its history.
pub async fn wait_for_completion<S>(
    source: &S,
    prompt_id: &str,
    config: &TrackerConfig,
    cancel: &CancellationToken,
) -> Result<Completion, TrackerError>
where
    S: HistorySource + ?Sized,
{
    let start = Instant::now();
    let cancelled = || TrackerError::Cancelled {
        prompt_id: prompt_id.to_string(),
    };
    let timed_out = |timeout: Duration| TrackerError::TimedOut {
        prompt_id: prompt_id.to_string(),
        timeout,
    };

    // A timeout too large to represent as an instant never fires.
    let deadline = config.timeout.and_then(|timeout| start.checked_add(timeout));
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    tracing::info!(
        prompt_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Waiting for prompt to finish",
    );

    let mut polls = 0u32;
    loop {
        polls += 1;

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = &mut expired => return Err(timed_out(config.timeout.unwrap_or_default())),
            result = source.fetch_entry(prompt_id) => result?,
        };

        if let Some(entry) = fetched {
            let elapsed = start.elapsed();
            tracing::info!(
                prompt_id,
                polls,
                elapsed_secs = elapsed.as_secs(),
                "Prompt finished",
            );
            return Ok(Completion {
                entry,
                polls,
                elapsed,
            });
        }

        tracing::debug!(prompt_id, polls, "Prompt still running");

        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = &mut expired => return Err(timed_out(config.timeout.unwrap_or_default())),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
