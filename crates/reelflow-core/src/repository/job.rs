//! Job repository trait definition.
//!
//! Defines the storage interface for job documents. The infrastructure layer
//! implements it with one directory per job; [`super::memory`] provides an
//! in-memory implementation for tests and embedding.

use std::path::PathBuf;

use reelflow_types::error::StoreError;
use reelflow_types::job::{JobDocument, JobSummary};

/// Repository trait for job document persistence.
///
/// Every job owns its own storage namespace, so concurrent jobs never share
/// mutable state. Implementations must validate documents on load.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobRepository: Send + Sync {
    /// Persist a brand-new document. Fails with `AlreadyExists` if the id is taken.
    fn insert(
        &self,
        job: &JobDocument,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load and validate a document.
    fn load(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<JobDocument, StoreError>> + Send;

    /// Overwrite an existing document.
    fn save(
        &self,
        job: &JobDocument,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn exists(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Summaries of every stored job, in no particular order.
    ///
    /// Implementations should avoid loading full documents when a cheaper
    /// summary is available.
    fn list_summaries(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<JobSummary>, StoreError>> + Send;

    /// Workspace directory handed to steps, if this store has one.
    fn job_dir(&self, job_id: &str) -> Option<PathBuf>;

    /// Create the named workspace subdirectories for a job.
    fn prepare_workspace(
        &self,
        job_id: &str,
        dirs: &[String],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
