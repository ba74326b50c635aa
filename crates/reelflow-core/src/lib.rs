//! Business logic and repository trait definitions for reelflow.
//!
//! This crate defines the step contract, the job store port (repository
//! trait) that the infrastructure layer implements, and the workflow
//! executor. It depends only on `reelflow-types` -- never on
//! `reelflow-infra` or any filesystem/process crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod step;
pub mod workflow;
