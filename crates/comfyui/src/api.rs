//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (image upload, workflow submission, history
//! retrieval, output download, queue cancellation) using [`reqwest`].
//! Every request carries `Authorization: Bearer <key>` when an API key is
//! configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gridgen_core::history::OutputFile;
use gridgen_core::workflow::WorkflowDocument;
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// Connection settings for a ComfyUI server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base HTTP URL, e.g. `https://host:8443`.
    pub api_url: String,
    /// Sent as a bearer token on every request.
    pub api_key: Option<String>,
    /// Skip TLS certificate verification.
    ///
    /// Only meant for servers behind self-signed certificates. Turning this
    /// on logs a warning every time a client is built.
    pub accept_invalid_certs: bool,
    /// Whole-request timeout. `None` waits as long as the server does.
    pub request_timeout: Option<Duration>,
}

impl ApiConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: None,
            accept_invalid_certs: false,
            request_timeout: None,
        }
    }
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResult {
    /// File name as stored on the server (may differ from the local name).
    pub name: String,
    #[serde(default)]
    pub subfolder: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl UploadResult {
    /// Server-relative path to embed in a `LoadImage` node.
    pub fn reference(&self) -> String {
        match self.subfolder.as_deref() {
            Some(subfolder) if !subfolder.is_empty() => format!("{subfolder}/{}", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    prompt: &'a WorkflowDocument,
    client_id: &'a str,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A local input file does not exist.
    #[error("Input file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `/upload/image` returned a non-2xx status code.
    #[error("Image upload failed ({status}): {body}")]
    Upload { status: u16, body: String },

    /// `/prompt` returned a non-2xx status code.
    #[error("Workflow submission failed ({status}): {body}")]
    Submission { status: u16, body: String },

    /// Any other endpoint returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApiError {
    /// HTTP status of a rejected request, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upload { status, .. }
            | Self::Submission { status, .. }
            | Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn into_upload(self) -> Self {
        match self {
            Self::ApiError { status, body } => Self::Upload { status, body },
            other => other,
        }
    }

    fn into_submission(self) -> Self {
        match self {
            Self::ApiError { status, body } => Self::Submission { status, body },
            other => other,
        }
    }
}

impl ComfyUIApi {
    /// Build a client from connection settings.
    pub fn new(config: &ApiConfig) -> Result<Self, ComfyUIApiError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        if config.accept_invalid_certs {
            tracing::warn!(
                api_url = %config.api_url,
                "TLS certificate verification is DISABLED for this ComfyUI server",
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self::with_client(
            builder.build()?,
            config.api_url.clone(),
            config.api_key.clone(),
        ))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// HTTP API base URL, without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload a local image for use as a workflow input.
    ///
    /// Sends a multipart `POST /upload/image` with the file under `image`
    /// and `overwrite=true`, so re-running with the same file replaces the
    /// server copy.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadResult, ComfyUIApiError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ComfyUIApiError::NotFound(path.to_path_buf()));
            }
            Err(source) => {
                return Err(ComfyUIApiError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        tracing::info!(file = %file_name, bytes = bytes.len(), "Uploading input image");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(guess_image_mime(path))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .request(Method::POST, "/upload/image")
            .multipart(form)
            .send()
            .await?;

        let response = Self::ensure_success(response)
            .await
            .map_err(ComfyUIApiError::into_upload)?;
        let result: UploadResult = response.json().await?;

        tracing::info!(reference = %result.reference(), "Image uploaded");
        Ok(result)
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow and client
    /// ID. Returns the server-assigned `prompt_id` and queue position.
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowDocument,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = PromptRequest {
            prompt: workflow,
            client_id,
        };

        let response = self
            .request(Method::POST, "/prompt")
            .json(&body)
            .send()
            .await?;

        let response = Self::ensure_success(response)
            .await
            .map_err(ComfyUIApiError::into_submission)?;
        let submitted: SubmitResponse = response.json().await?;

        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(submitted)
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The body is `{}` until
    /// the prompt finishes.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .request(Method::GET, &format!("/history/{prompt_id}"))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Start streaming an output file through `GET /view`.
    ///
    /// The returned response has already been checked for a success
    /// status; its body has not been read.
    pub async fn view(&self, file: &OutputFile) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = self
            .request(Method::GET, "/view")
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_str()),
            ])
            .send()
            .await?;

        Self::ensure_success(response).await
    }

    /// Cancel a queued or running execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .request(Method::POST, "/queue")
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Start a request against `path`, attaching the bearer token.
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// MIME type for an upload, from the file extension.
fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}
