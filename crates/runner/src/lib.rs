//! `gridgen-runner` library crate.
//!
//! Re-exports the configuration and pipeline modules for integration
//! testing. The binary entrypoint lives in `main.rs`.

pub mod config;
pub mod pipeline;
