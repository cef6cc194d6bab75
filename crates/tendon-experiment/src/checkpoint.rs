//! Persisted resume points for long-running tests.
//!
//! A checkpoint is written only at a cycle boundary and names the next cycle
//! to run together with the metrics accumulated so far. Files are written to
//! a temporary name and renamed into place.

use crate::params::TestConfig;
use crate::protocols::{EnduranceCursor, TestKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Current on-disk format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint persistence failures.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a valid checkpoint.
    #[error("checkpoint is malformed: {0}")]
    Format(#[from] serde_json::Error),

    /// Written by an incompatible version.
    #[error("checkpoint version {found} is not supported (expected {CHECKPOINT_VERSION})")]
    Version {
        /// Version found in the file.
        found: u32,
    },
}

/// Everything needed to re-enter a run at a cycle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Format version.
    pub version: u32,
    /// Run being resumed; kept across the resume.
    pub run_id: Uuid,
    /// Test kind.
    pub kind: TestKind,
    /// Resolved configuration of the interrupted run.
    pub config: TestConfig,
    /// When the checkpoint was taken.
    pub saved_at: DateTime<Utc>,
    /// Next cycle and accumulated metrics.
    pub cursor: EnduranceCursor,
}

/// Directory of checkpoint files, one per run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the checkpoint of `run_id`.
    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("checkpoint_{run_id}.json"))
    }

    /// Persist `checkpoint`, replacing the previous one for the same run.
    pub async fn save(&self, checkpoint: &RunCheckpoint) -> Result<PathBuf, CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(checkpoint.run_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            run_id = %checkpoint.run_id,
            next_cycle = checkpoint.cursor.next_cycle,
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Read a checkpoint file.
    pub async fn load(path: impl AsRef<Path>) -> Result<RunCheckpoint, CheckpointError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let checkpoint: RunCheckpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                found: checkpoint.version,
            });
        }
        info!(
            run_id = %checkpoint.run_id,
            next_cycle = checkpoint.cursor.next_cycle,
            "Checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Latest checkpoint of `run_id`, if one was written.
    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<RunCheckpoint>, CheckpointError> {
        match Self::load(self.path_for(run_id)).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(CheckpointError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::EnduranceTotals;
    use tempfile::tempdir;

    fn checkpoint(run_id: Uuid, next_cycle: u32) -> RunCheckpoint {
        RunCheckpoint {
            version: CHECKPOINT_VERSION,
            run_id,
            kind: TestKind::Endurance,
            config: TestConfig::new().with("num_cycles", 100_i64),
            saved_at: Utc::now(),
            cursor: EnduranceCursor {
                next_cycle,
                totals: EnduranceTotals::default(),
            },
        }
    }

    #[tokio::test]
    async fn latest_checkpoint_replaces_earlier_one() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let run_id = Uuid::new_v4();
        assert!(store.load_run(run_id).await.unwrap().is_none());

        store.save(&checkpoint(run_id, 11)).await.unwrap();
        let path = store.save(&checkpoint(run_id, 21)).await.unwrap();

        let loaded = CheckpointStore::load(&path).await.unwrap();
        assert_eq!(loaded.cursor.next_cycle, 21);
        assert_eq!(loaded.kind, TestKind::Endurance);
        assert_eq!(store.load_run(run_id).await.unwrap(), Some(loaded));
    }

    #[tokio::test]
    async fn rejects_foreign_versions_and_garbage() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let mut future = checkpoint(run_id, 5);
        future.version = CHECKPOINT_VERSION + 1;
        let path = store.save(&future).await.unwrap();
        assert!(matches!(
            CheckpointStore::load(&path).await,
            Err(CheckpointError::Version { .. })
        ));

        tokio::fs::write(&path, b"[]").await.unwrap();
        assert!(matches!(
            store.load_run(run_id).await,
            Err(CheckpointError::Format(_))
        ));
    }
}
