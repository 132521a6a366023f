//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper (upload, submit, history, view, cancel),
//! the history polling loop and the output downloader used to run a
//! single workflow against a ComfyUI server.

pub mod api;
pub mod download;
pub mod tracker;
