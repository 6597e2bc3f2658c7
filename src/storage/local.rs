//! Local filesystem object writer.
//!
//! Used for development, single-host deployments, and as the spill target
//! for batches that could not be uploaded before shutdown.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{ObjectKey, ObjectWriter};

/// Writes `<base_dir>/<root>/<date>/<name>`.
#[derive(Debug, Clone)]
pub struct LocalObjectWriter {
    base_dir: PathBuf,
    root: String,
}

impl LocalObjectWriter {
    pub fn new(base_dir: impl Into<PathBuf>, root: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            root: root.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the full path for an object key.
    pub fn path(&self, key: &ObjectKey) -> PathBuf {
        self.base_dir.join(key.path(&self.root))
    }
}

/// Write bytes atomically (write to temp, then rename).
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn upload(&self, key: &ObjectKey, payload: Vec<u8>) -> Result<String> {
        let path = self.path(key);
        write_atomic(&path, &payload)
            .await
            .map_err(|e| AppError::upload(key.path(&self.root), e))?;

        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new(
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            "rss_batch_20250106T101500_part1.json",
        )
    }

    #[tokio::test]
    async fn test_upload_writes_partitioned_path() {
        let tmp = TempDir::new().unwrap();
        let writer = LocalObjectWriter::new(tmp.path(), "raw_rss_feed");

        let location = writer.upload(&key(), b"[]".to_vec()).await.unwrap();

        let expected = tmp
            .path()
            .join("raw_rss_feed/2025-01-06/rss_batch_20250106T101500_part1.json");
        assert_eq!(location, expected.display().to_string());
        assert_eq!(std::fs::read(&expected).unwrap(), b"[]");
        assert!(!expected.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_upload_failure_names_the_key() {
        let tmp = TempDir::new().unwrap();
        // A file where the partition directory should go
        std::fs::write(tmp.path().join("raw_rss_feed"), b"").unwrap();
        let writer = LocalObjectWriter::new(tmp.path(), "raw_rss_feed");

        let err = writer.upload(&key(), b"[]".to_vec()).await.unwrap_err();

        match err {
            AppError::Upload { key, .. } => {
                assert_eq!(key, "raw_rss_feed/2025-01-06/rss_batch_20250106T101500_part1.json")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
