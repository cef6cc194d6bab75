//! File-backed calibration persistence.
//!
//! One pretty-printed JSON file per channel, named after the channel id
//! (`tendon_load_cell.json`, ...). Files are written to a temporary name and
//! renamed into place so a crash mid-write never leaves a truncated record.

use std::path::{Path, PathBuf};
use tendon_core::{CalibrationError, CalibrationRecord, CalibrationSet, SensorChannel};
use tracing::{debug, info, warn};

const CHANNELS: [SensorChannel; 3] = [
    SensorChannel::TendonLoadCell,
    SensorChannel::TipLoadCell,
    SensorChannel::JointEncoder,
];

/// Calibration records stored under one directory.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `channel`.
    pub fn path_for(&self, channel: SensorChannel) -> PathBuf {
        self.dir.join(format!("{}.json", channel.id()))
    }

    /// Persist `record`, replacing any previous record for its channel.
    pub async fn save(&self, record: &CalibrationRecord) -> Result<PathBuf, CalibrationError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record.channel);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(
            channel = %record.channel,
            path = %path.display(),
            scale = record.scale_factor,
            "Calibration saved"
        );
        Ok(path)
    }

    /// Load the record for `channel`. `Ok(None)` if it was never calibrated.
    pub async fn load(
        &self,
        channel: SensorChannel,
    ) -> Result<Option<CalibrationRecord>, CalibrationError> {
        let path = self.path_for(channel);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: CalibrationRecord = serde_json::from_slice(&bytes)?;
        if record.channel != channel {
            warn!(
                path = %path.display(),
                stored = %record.channel,
                "Calibration file holds a record for another channel"
            );
            return Err(CalibrationError::WrongChannel(record.channel, channel.id()));
        }
        Ok(Some(record))
    }

    /// Load every stored channel into a set.
    pub async fn load_all(&self) -> Result<CalibrationSet, CalibrationError> {
        let mut set = CalibrationSet::new();
        for channel in CHANNELS {
            if let Some(record) = self.load(channel).await? {
                set.insert(record);
            }
        }
        debug!(dir = %self.dir.display(), channels = set.len(), "Calibration loaded");
        Ok(set)
    }

    /// Delete the record for `channel`. Missing records are not an error.
    pub async fn remove(&self, channel: SensorChannel) -> Result<(), CalibrationError> {
        match tokio::fs::remove_file(self.path_for(channel)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn record_round_trips_and_reproduces_reference_weight() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal"));
        let record =
            CalibrationRecord::load_cell(SensorChannel::TipLoadCell, 812.0, 41_377.0, 1.2)
                .unwrap();
        store.save(&record).await.unwrap();

        let loaded = store.load(SensorChannel::TipLoadCell).await.unwrap().unwrap();
        assert!((loaded.zero_offset - record.zero_offset).abs() < 1e-12);
        assert!((loaded.scale_factor - record.scale_factor).abs() < 1e-15);
        assert_eq!(loaded.reference_weight_kg, Some(1.2));
        assert!((loaded.weight_kg(41_377.0) - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn load_all_skips_uncalibrated_channels() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        assert!(store.load_all().await.unwrap().is_empty());

        store
            .save(&CalibrationRecord::encoder(100, 4096).unwrap())
            .await
            .unwrap();
        let set = store.load_all().await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get(SensorChannel::JointEncoder).is_some());

        store.remove(SensorChannel::JointEncoder).await.unwrap();
        store.remove(SensorChannel::JointEncoder).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        tokio::fs::write(store.path_for(SensorChannel::TendonLoadCell), b"{ not json")
            .await
            .unwrap();
        assert!(matches!(
            store.load(SensorChannel::TendonLoadCell).await,
            Err(CalibrationError::Format(_))
        ));
    }

    #[tokio::test]
    async fn misfiled_record_is_rejected() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        let record = CalibrationRecord::identity(SensorChannel::TipLoadCell);
        tokio::fs::write(
            store.path_for(SensorChannel::TendonLoadCell),
            serde_json::to_vec(&record).unwrap(),
        )
        .await
        .unwrap();
        assert!(matches!(
            store.load(SensorChannel::TendonLoadCell).await,
            Err(CalibrationError::WrongChannel(..))
        ));
    }
}
