//! Filesystem helpers: data directory resolution and atomic writes.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "REELFLOW_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `REELFLOW_DATA_DIR` environment variable
/// 2. `~/.reelflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    // Use home directory fallback: ~/.reelflow
    if let Some(home) = dirs::home_dir() {
        return home.join(".reelflow");
    }

    // Last resort: current directory
    PathBuf::from(".reelflow")
}

/// Write `contents` to `path` via a synced temp file and a rename.
///
/// Readers never observe a half-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            )
        })?;
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.yaml");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["job.yaml"]);
    }

    #[tokio::test]
    async fn write_atomic_requires_existing_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("job.yaml");
        assert!(write_atomic(&path, b"x").await.is_err());
    }
}
