//! Shared domain types for reelflow.
//!
//! This crate contains the data model used across the job engine: job
//! documents and step execution records, workflow definitions, reference
//! expressions, configuration and execution events.
//!
//! Zero infrastructure dependencies -- only serde, chrono, uuid, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod reference;
pub mod workflow;

/// Parameter and output mappings exchanged with steps.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;
