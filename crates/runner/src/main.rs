//! `gridgen-runner` -- run one ComfyUI workflow end to end.
//!
//! Uploads an input image, binds it into the workflow, randomizes every
//! seed, submits the job, waits for it and downloads the outputs. All
//! settings come from the environment (or a `.env` file); see
//! [`RunnerConfig::from_env`] for the full table.
//!
//! The first Ctrl-C stops the current step and, once a prompt is queued,
//! removes it from the server queue. A second Ctrl-C exits at once with
//! status 130.

use gridgen_runner::config::RunnerConfig;
use gridgen_runner::pipeline;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gridgen_runner=info,gridgen_comfyui=info,gridgen_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RunnerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!("Configuration error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        api_url = %config.api.api_url,
        workflow = %config.workflow_path.display(),
        image = %config.input_image_path.display(),
        output_dir = %config.output_dir.display(),
        "Starting gridgen-runner",
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupt received, stopping (press Ctrl-C again to exit now)");
        on_interrupt.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Second interrupt received, exiting");
            std::process::exit(130);
        }
    });

    match pipeline::run(&config, &cancel).await {
        Ok(summary) => {
            tracing::info!(
                prompt_id = %summary.prompt_id,
                seed = summary.patch.seed,
                outputs = summary.outputs.len(),
                "Run complete",
            );
        }
        Err(e) => {
            tracing::error!("Run failed: {e}");
            std::process::exit(1);
        }
    }
}
