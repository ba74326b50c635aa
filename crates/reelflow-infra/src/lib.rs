//! Infrastructure layer for reelflow.
//!
//! Contains implementations of the ports defined in `reelflow-core`: the
//! filesystem job repository, command-backed steps, `config.toml` loading
//! and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod step;
pub mod store;
