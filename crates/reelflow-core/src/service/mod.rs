//! Service layer that sits between the CLI and the repositories.

pub mod job;
