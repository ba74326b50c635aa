//! Filesystem job repository.
//!
//! Implements `JobRepository` from `reelflow-core` with one directory per
//! job under an injected root:
//!
//! ```text
//! {root}/{job_id}/
//!   job.yaml        the job document (operator-editable)
//!   summary.json    listing sidecar, rewritten on every save
//!   input/ ...      workspace directories declared by the workflow
//! ```
//!
//! Both files are written atomically. `job.yaml` is validated on every load.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use reelflow_core::repository::job::JobRepository;
use reelflow_types::error::StoreError;
use reelflow_types::job::{JobDocument, JobSummary};

use crate::filesystem::write_atomic;

/// File name of the job document inside a job directory.
pub const JOB_FILE: &str = "job.yaml";

/// File name of the listing sidecar inside a job directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// Directory-per-job repository rooted at `root`.
#[derive(Debug, Clone)]
pub struct FsJobRepository {
    root: PathBuf,
}

impl FsJobRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if !is_plain_name(job_id) {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(self.root.join(job_id))
    }

    async fn write_document(&self, dir: &Path, job: &JobDocument) -> Result<(), StoreError> {
        let yaml =
            serde_yaml_ng::to_string(job).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&dir.join(JOB_FILE), yaml.as_bytes()).await?;

        let summary = serde_json::to_vec_pretty(&job.summary())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&dir.join(SUMMARY_FILE), &summary).await?;
        Ok(())
    }

    async fn read_document(&self, job_id: &str, dir: &Path) -> Result<JobDocument, StoreError> {
        let path = dir.join(JOB_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let job: JobDocument = serde_yaml_ng::from_str(&content)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        job.validate().map_err(|source| StoreError::Invalid {
            job_id: job_id.to_string(),
            source,
        })?;
        Ok(job)
    }

    /// Summary for one job directory: the sidecar when it is current,
    /// otherwise derived from the document itself.
    async fn summary_for(&self, job_id: &str, dir: &Path) -> Result<JobSummary, StoreError> {
        let doc_mtime = modified(&dir.join(JOB_FILE)).await;
        let summary_mtime = modified(&dir.join(SUMMARY_FILE)).await;

        if let (Some(doc), Some(summary)) = (doc_mtime, summary_mtime) {
            if summary >= doc {
                match tokio::fs::read(dir.join(SUMMARY_FILE)).await {
                    Ok(bytes) => match serde_json::from_slice::<JobSummary>(&bytes) {
                        Ok(summary) => return Ok(summary),
                        Err(e) => {
                            tracing::debug!(job_id, error = %e, "unreadable summary sidecar, loading document")
                        }
                    },
                    Err(e) => {
                        tracing::debug!(job_id, error = %e, "unreadable summary sidecar, loading document")
                    }
                }
            }
        }

        Ok(self.read_document(job_id, dir).await?.summary())
    }
}

impl JobRepository for FsJobRepository {
    async fn insert(&self, job: &JobDocument) -> Result<(), StoreError> {
        let dir = self.dir(&job.job_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(job.job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.write_document(&dir, job).await?;
        tracing::debug!(job_id = %job.job_id, dir = %dir.display(), "inserted job document");
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<JobDocument, StoreError> {
        let dir = self.dir(job_id)?;
        self.read_document(job_id, &dir).await
    }

    async fn save(&self, job: &JobDocument) -> Result<(), StoreError> {
        let dir = self.dir(&job.job_id)?;
        if !tokio::fs::try_exists(dir.join(JOB_FILE)).await? {
            return Err(StoreError::NotFound(job.job_id.clone()));
        }
        self.write_document(&dir, job).await
    }

    async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        if !is_plain_name(job_id) {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.root.join(job_id)).await?)
    }

    async fn list_summaries(&self) -> Result<Vec<JobSummary>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let job_id = entry.file_name().to_string_lossy().into_owned();
            if !tokio::fs::try_exists(entry.path().join(JOB_FILE)).await? {
                continue;
            }
            match self.summary_for(&job_id, &entry.path()).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!(job_id, error = %e, "skipping unreadable job"),
            }
        }
        Ok(summaries)
    }

    fn job_dir(&self, job_id: &str) -> Option<PathBuf> {
        self.dir(job_id).ok()
    }

    async fn prepare_workspace(&self, job_id: &str, dirs: &[String]) -> Result<(), StoreError> {
        let base = self.dir(job_id)?;
        for name in dirs {
            let relative = Path::new(name);
            let contained = relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("workspace dir '{name}' must be a relative path inside the job directory"),
                )));
            }
            tokio::fs::create_dir_all(base.join(relative)).await?;
        }
        Ok(())
    }
}

/// A single path component that cannot escape the root.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reelflow_types::ValueMap;
    use reelflow_types::job::{JobStatus, StepStatus};
    use reelflow_types::workflow::{StepInvocation, WorkflowDefinition};
    use serde_json::json;
    use tempfile::tempdir;

    fn job(id: &str) -> JobDocument {
        let def = WorkflowDefinition {
            name: "clips".into(),
            description: None,
            key_inputs: vec!["source".into()],
            workspace_dirs: vec![],
            steps: vec![
                StepInvocation::new(
                    "download",
                    "download",
                    serde_json::from_value(json!({"url": "${input.source}"})).unwrap(),
                ),
                StepInvocation::new("transcribe", "transcribe", ValueMap::new()),
            ],
        };
        let inputs = serde_json::from_value(json!({"source": "X"})).unwrap();
        JobDocument::new(id, &def, inputs, Utc::now())
    }

    #[tokio::test]
    async fn insert_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path().join("jobs"));
        let job = job("X_20260101_000000");

        repo.insert(&job).await.unwrap();
        assert!(repo.exists(&job.job_id).await.unwrap());
        assert!(dir.path().join("jobs/X_20260101_000000/job.yaml").exists());
        assert!(dir.path().join("jobs/X_20260101_000000/summary.json").exists());

        let loaded = repo.load(&job.job_id).await.unwrap();
        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn document_is_readable_yaml() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        repo.insert(&job("j")).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("j").join(JOB_FILE)).unwrap();
        assert!(text.contains("job_id: j"));
        assert!(text.contains("input.source"));
        assert!(text.contains("status: pending"));
    }

    #[tokio::test]
    async fn insert_twice_and_save_missing_fail() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        repo.insert(&job("j")).await.unwrap();

        assert!(matches!(
            repo.insert(&job("j")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.save(&job("other")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(repo.load("nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(repo.load("../etc").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn hand_edit_breaking_invariants_is_rejected() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        let mut broken = job("j");
        repo.insert(&broken).await.unwrap();

        // Completed without an output.
        broken.steps[0].status = StepStatus::Completed;
        let yaml = serde_yaml_ng::to_string(&broken).unwrap();
        std::fs::write(dir.path().join("j").join(JOB_FILE), yaml).unwrap();

        match repo.load("j").await {
            Err(StoreError::Invalid { job_id, source }) => {
                assert_eq!(job_id, "j");
                assert!(source.to_string().contains("download"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_uses_sidecar_and_notices_manual_edits() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        let mut job = job("j");
        repo.insert(&job).await.unwrap();

        let summaries = repo.list_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, JobStatus::Pending);
        assert_eq!(summaries[0].key_inputs["source"], "X");

        // Operator marks the first step failed by hand; the sidecar is now older.
        job.steps[0].status = StepStatus::Failed;
        let yaml = serde_yaml_ng::to_string(&job).unwrap();
        std::fs::write(dir.path().join("j").join(JOB_FILE), yaml).unwrap();
        let sidecar = std::fs::File::options()
            .write(true)
            .open(dir.path().join("j").join(SUMMARY_FILE))
            .unwrap();
        sidecar
            .set_modified(SystemTime::now() - std::time::Duration::from_secs(60))
            .unwrap();

        let summaries = repo.list_summaries().await.unwrap();
        assert_eq!(summaries[0].status, JobStatus::Failed);
        assert_eq!(summaries[0].failed_step.as_deref(), Some("download"));
    }

    #[tokio::test]
    async fn list_skips_stray_entries() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        assert!(repo.list_summaries().await.unwrap().is_empty());

        repo.insert(&job("a")).await.unwrap();
        std::fs::create_dir(dir.path().join("scratch")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let ids: Vec<_> = repo
            .list_summaries()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.job_id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path().join("nothing-here"));
        assert!(repo.list_summaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn workspace_dirs_are_created_inside_the_job() {
        let dir = tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        repo.insert(&job("j")).await.unwrap();

        repo.prepare_workspace("j", &["input".into(), "renders/final".into()])
            .await
            .unwrap();
        assert!(dir.path().join("j/input").is_dir());
        assert!(dir.path().join("j/renders/final").is_dir());
        assert_eq!(repo.job_dir("j"), Some(dir.path().join("j")));

        assert!(repo.prepare_workspace("j", &["../escape".into()]).await.is_err());
        assert!(repo.prepare_workspace("j", &["/abs".into()]).await.is_err());
    }
}
