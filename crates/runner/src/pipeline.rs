//! One generation run, start to finish.
//!
//! Load the workflow, upload the input image, patch the workflow, submit
//! it, wait for it to finish and download whatever it produced. Steps run
//! strictly in order; the first error ends the run. Every step stops as soon
//! as the cancellation token fires.

use std::future::Future;
use std::path::PathBuf;

use gridgen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use gridgen_comfyui::download::{save_outputs, DownloadError};
use gridgen_comfyui::tracker::{wait_for_completion, TrackerError};
use gridgen_core::error::CoreError;
use gridgen_core::workflow::{generate_seed, PatchReport, WorkflowDocument};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;

/// What a successful run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub prompt_id: String,
    pub patch: PatchReport,
    /// Local paths of the downloaded outputs.
    pub outputs: Vec<PathBuf>,
}

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to load workflow: {0}")]
    Workflow(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Run cancelled")]
    Cancelled,
}

/// Build a client from `config` and run the pipeline once.
pub async fn run(config: &RunnerConfig, cancel: &CancellationToken) -> Result<RunSummary, RunError> {
    let api = ComfyUIApi::new(&config.api)?;
    run_with(&api, config, cancel).await
}

/// Run the pipeline once against an existing client.
///
/// Cancellation outside the wait returns [`RunError::Cancelled`].
/// Cancellation while waiting returns [`TrackerError::Cancelled`] and also
/// removes the prompt from the server queue.
pub async fn run_with(
    api: &ComfyUIApi,
    config: &RunnerConfig,
    cancel: &CancellationToken,
) -> Result<RunSummary, RunError> {
    let mut workflow =
        until_cancelled(cancel, WorkflowDocument::load(&config.workflow_path)).await?;

    let reference = until_cancelled(cancel, api.upload_image(&config.input_image_path))
        .await?
        .reference();

    let seed = generate_seed(&mut rand::rng());
    let patch = workflow.patch(&config.image_node_id, &reference, seed);

    let client_id = uuid::Uuid::new_v4().to_string();
    let prompt_id = until_cancelled(cancel, api.submit_workflow(&workflow, &client_id))
        .await?
        .prompt_id;

    let completion = match wait_for_completion(api, &prompt_id, &config.tracker, cancel).await {
        Ok(completion) => completion,
        Err(e @ (TrackerError::TimedOut { .. } | TrackerError::Cancelled { .. })) => {
            abandon(api, &prompt_id).await;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    // The prompt has finished, so there is nothing left to remove from the queue.
    let outputs = until_cancelled(
        cancel,
        save_outputs(api, &completion.entry, &config.output_dir),
    )
    .await?;

    Ok(RunSummary {
        prompt_id,
        patch,
        outputs,
    })
}

/// Drive `step` to completion unless `cancel` fires first.
async fn until_cancelled<T, E, F>(cancel: &CancellationToken, step: F) -> Result<T, RunError>
where
    F: Future<Output = Result<T, E>>,
    RunError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        result = step => Ok(result?),
    }
}

/// Drop a prompt we stopped waiting for from the server queue.
///
/// Failure only leaves the job running remotely, so it is logged.
async fn abandon(api: &ComfyUIApi, prompt_id: &str) {
    match api.cancel_execution(prompt_id).await {
        Ok(()) => tracing::info!(prompt_id, "Removed abandoned prompt from queue"),
        Err(e) => tracing::warn!(prompt_id, error = %e, "Failed to cancel abandoned prompt"),
    }
}
