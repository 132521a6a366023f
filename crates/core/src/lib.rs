//! Domain model for a single ComfyUI generation run.
//!
//! Holds the workflow document and its patcher, the typed view of job
//! history responses, and the shared [`error::CoreError`].

pub mod error;
pub mod history;
pub mod workflow;
