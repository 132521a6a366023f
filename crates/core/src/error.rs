use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Malformed history: {0}")]
    MalformedHistory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
