//! Durable per-shard progress.
//!
//! One JSON file per shard holds the last completed date and every
//! [`DateResult`] produced so far. Saves write a sibling temp file, flush it
//! to disk and rename it over the previous checkpoint, so a reader sees
//! either the old checkpoint or the new one, never a partial write. The
//! directory is flushed after the rename so the new entry survives a crash.
//!
//! ```text
//! checkpoint_dir/
//! ├── checkpoint_2022-10-25_2022-10-31.json
//! └── checkpoint_2022-10-25_2022-10-31.json.tmp   # only while saving
//! ```

use crate::error::CheckpointError;
use crate::models::{Checkpoint, DateRange};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    shard: DateRange,
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>, shard: DateRange) -> Self {
        let path = dir.as_ref().join(format!(
            "checkpoint_{}_{}.json",
            shard.start(),
            shard.end()
        ));
        Self { shard, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Atomically replace the shard's checkpoint.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display(), last = %checkpoint.last_completed_date))]
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let temp = self.temp_path();

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir).await?;
        }
        info!(results = checkpoint.results.len(), "Checkpoint saved");
        Ok(())
    }

    /// Load the shard's checkpoint.
    ///
    /// # Returns
    ///
    /// `None` when there is no checkpoint, when it cannot be parsed, or when
    /// it belongs to a different shard or names a date outside this shard.
    /// Those cases restart the shard from its first date. Only I/O errors
    /// other than "not found" are returned as errors.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Malformed checkpoint; starting shard from scratch");
                return Ok(None);
            }
        };

        if checkpoint.shard != self.shard || !self.shard.contains(checkpoint.last_completed_date) {
            warn!(
                found = %checkpoint.shard,
                expected = %self.shard,
                last = %checkpoint.last_completed_date,
                "Checkpoint does not match this shard; ignoring it"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }
}

/// Flush directory entries, making a completed rename durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    fs::File::open(dir).await?.sync_all().await
}

// Directories cannot be opened as files here; the rename is as durable as it gets.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DateResult;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn shard() -> DateRange {
        DateRange::new(d("2022-10-25"), d("2022-10-27")).unwrap()
    }

    fn checkpoint(last: &str) -> Checkpoint {
        Checkpoint {
            shard: shard(),
            last_completed_date: d(last),
            results: shard()
                .days()
                .take_while(|day| *day <= d(last))
                .map(|date| DateResult { date, best: None })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_load_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), shard());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), shard());

        store.save(&checkpoint("2022-10-25")).await.unwrap();
        store.save(&checkpoint("2022-10-26")).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint("2022-10-26"));

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1, "exactly one checkpoint file per shard");
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_syncs_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints/nested"), shard());
        store.save(&checkpoint("2022-10-27")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(checkpoint("2022-10-27")));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_sync_dir_accepts_empty_parent() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        sync_dir(Path::new("")).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), shard());
        std::fs::write(store.path(), b"{\"shard\": {\"start\": \"2022-10").unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_not_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), shard());
        store.save(&checkpoint("2022-10-25")).await.unwrap();
        std::fs::write(store.temp_path(), b"half written").unwrap();
        assert_eq!(store.load().await.unwrap(), Some(checkpoint("2022-10-25")));
    }

    #[tokio::test]
    async fn test_foreign_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), shard());
        let mut foreign = checkpoint("2022-10-25");
        foreign.last_completed_date = d("2022-11-30");
        std::fs::write(store.path(), serde_json::to_vec(&foreign).unwrap()).unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
