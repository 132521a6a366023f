//! Output download through `/view`.
//!
//! [`save_outputs`] walks every file a finished prompt declared and
//! streams each one to disk with [`download_output`]. A file the server
//! refuses to serve is logged and skipped; its siblings are still fetched.

use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use gridgen_core::history::{HistoryEntry, OutputFile};
use tokio::io::AsyncWriteExt;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Errors that abort the download pass.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Download every declared output of `entry` into `dir`.
///
/// Returns the paths actually written. An entry without outputs logs a
/// warning and makes no request.
pub async fn save_outputs(
    api: &ComfyUIApi,
    entry: &HistoryEntry,
    dir: &Path,
) -> Result<Vec<PathBuf>, DownloadError> {
    if !entry.has_outputs() {
        tracing::warn!("Prompt finished without any outputs");
        return Ok(Vec::new());
    }

    let files = entry.output_files();
    tracing::info!(count = files.len(), dir = %dir.display(), "Downloading outputs");

    let mut saved = Vec::with_capacity(files.len());
    for (node_id, file) in files {
        tracing::debug!(node_id, filename = %file.filename, "Fetching output");
        if let Some(path) = download_output(api, file, dir).await? {
            saved.push(path);
        }
    }

    Ok(saved)
}

/// Stream one output file to `dir/<filename>`, overwriting any existing
/// file.
///
/// Returns `Ok(None)` when the server rejects the request. A transfer that
/// fails partway leaves no file behind and ends the pass with an error.
pub async fn download_output(
    api: &ComfyUIApi,
    file: &OutputFile,
    dir: &Path,
) -> Result<Option<PathBuf>, DownloadError> {
    let Some(local_name) = local_file_name(&file.filename) else {
        tracing::warn!(filename = %file.filename, "Skipping output with unusable file name");
        return Ok(None);
    };

    let response = match api.view(file).await {
        Ok(response) => response,
        Err(ComfyUIApiError::ApiError { status, body }) => {
            tracing::error!(filename = %file.filename, status, body = %body, "Download failed");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| DownloadError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

    let path = dir.join(local_name);
    let written = write_stream(response.bytes_stream(), &path).await?;

    tracing::info!(path = %path.display(), bytes = written, "Saved output");
    Ok(Some(path))
}

/// Write every chunk of `stream` to `path`, returning the byte count.
///
/// If the stream or a write fails, the partial file is removed before the
/// error is returned.
async fn write_stream<S, B, E>(stream: S, path: &Path) -> Result<u64, DownloadError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    ComfyUIApiError: From<E>,
{
    let write_err = |source| DownloadError::Write {
        path: path.to_path_buf(),
        source,
    };

    tokio::pin!(stream);
    let mut out = tokio::fs::File::create(path).await.map_err(write_err)?;

    let result = async {
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ComfyUIApiError::from)?;
            let bytes = chunk.as_ref();
            out.write_all(bytes).await.map_err(write_err)?;
            written += bytes.len() as u64;
        }
        out.flush().await.map_err(write_err)?;
        Ok::<_, DownloadError>(written)
    }
    .await;

    if result.is_err() {
        drop(out);
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
    result
}

/// Final path component of a server-supplied file name.
///
/// Keeps a hostile name such as `../../x` inside the output directory.
fn local_file_name(filename: &str) -> Option<&str> {
    Path::new(filename).file_name().and_then(|name| name.to_str())
}
