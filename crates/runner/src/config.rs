use std::path::PathBuf;
use std::time::Duration;

use gridgen_comfyui::api::ApiConfig;
use gridgen_comfyui::tracker::{TrackerConfig, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL};
use gridgen_core::workflow::DEFAULT_IMAGE_NODE_ID;

/// Default per-request HTTP timeout.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Everything a single run needs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub api: ApiConfig,
    pub workflow_path: PathBuf,
    pub input_image_path: PathBuf,
    /// Node whose `inputs.image` receives the uploaded reference.
    pub image_node_id: String,
    pub output_dir: PathBuf,
    pub tracker: TrackerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: expected {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl RunnerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default          |
    /// |--------------------------------|------------------|
    /// | `COMFYUI_URL`                  | required         |
    /// | `COMFYUI_API_KEY`              | none             |
    /// | `COMFYUI_ACCEPT_INVALID_CERTS` | `false`          |
    /// | `WORKFLOW_PATH`                | `workflow.json`  |
    /// | `INPUT_IMAGE_PATH`             | required         |
    /// | `IMAGE_NODE_ID`                | `94`             |
    /// | `OUTPUT_DIR`                   | `./output`       |
    /// | `POLL_INTERVAL_SECS`           | `3`              |
    /// | `JOB_TIMEOUT_SECS`             | `600`, 0 = none  |
    /// | `REQUEST_TIMEOUT_SECS`         | `60`, 0 = none   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values through
    /// `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let api_url = get("COMFYUI_URL").ok_or(ConfigError::Missing("COMFYUI_URL"))?;
        let api_url = api_url.trim().trim_end_matches('/').to_string();

        let accept_invalid_certs = match get("COMFYUI_ACCEPT_INVALID_CERTS") {
            Some(value) => parse_bool("COMFYUI_ACCEPT_INVALID_CERTS", &value)?,
            None => false,
        };

        let request_timeout = parse_secs(
            "REQUEST_TIMEOUT_SECS",
            get("REQUEST_TIMEOUT_SECS"),
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )?;

        let api = ApiConfig {
            api_url,
            api_key: get("COMFYUI_API_KEY"),
            accept_invalid_certs,
            request_timeout,
        };

        let input_image_path = get("INPUT_IMAGE_PATH")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("INPUT_IMAGE_PATH"))?;

        let poll_interval = parse_secs(
            "POLL_INTERVAL_SECS",
            get("POLL_INTERVAL_SECS"),
            DEFAULT_POLL_INTERVAL,
        )?
        .ok_or_else(|| ConfigError::Invalid {
            var: "POLL_INTERVAL_SECS",
            value: "0".into(),
            expected: "a positive number of seconds",
        })?;

        let timeout = parse_secs("JOB_TIMEOUT_SECS", get("JOB_TIMEOUT_SECS"), DEFAULT_JOB_TIMEOUT)?;

        Ok(Self {
            api,
            workflow_path: get("WORKFLOW_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workflow.json")),
            input_image_path,
            image_node_id: get("IMAGE_NODE_ID").unwrap_or_else(|| DEFAULT_IMAGE_NODE_ID.into()),
            output_dir: get("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            tracker: TrackerConfig {
                poll_interval,
                timeout,
            },
        })
    }
}

/// Parse a whole number of seconds. `0` disables the limit.
fn parse_secs(
    var: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(Some(default));
    };

    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.clone(),
        expected: "a whole number of seconds",
    })?;

    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}
