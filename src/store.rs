//! Persistent record of what the mirror currently holds.
//!
//! Each database gets its own `<db>.version.json` next to the artifacts.
//! Records are replaced through a staged file and a rename, so a reader
//! sees either the previous record or the new one in full.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::mirror::STAGING_DIR;
use crate::types::{is_valid_database_name, LocalVersion, VersionRecord};

const RECORD_SUFFIX: &str = ".version.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database name {0:?}")]
    InvalidName(String),
    #[error("refusing to move {database} back from version {recorded} to {attempted}")]
    VersionRegression {
        database: String,
        recorded: u64,
        attempted: u64,
    },
    #[error("failed to encode version record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the per-database version records under the data directory.
///
/// One instance is shared by the updater tasks and the server.
pub struct VersionStore {
    root: PathBuf,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VersionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn record_path(&self, database: &str) -> PathBuf {
        self.root.join(format!("{database}{RECORD_SUFFIX}"))
    }

    /// Loads the record for `database`.  A missing file means the database
    /// has never been mirrored; an unreadable one is treated the same way so
    /// the next cycle starts over with a full download.
    pub async fn load(&self, database: &str) -> StoreResult<Option<VersionRecord>> {
        if !is_valid_database_name(database) {
            return Err(StoreError::InvalidName(database.to_string()));
        }
        let path = self.record_path(database);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<VersionRecord>(&bytes) {
            Ok(record) if record.database == database => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    "Version record {} names database {:?}, ignoring it",
                    path.display(),
                    record.database
                );
                Ok(None)
            }
            Err(e) => {
                warn!("Version record {} is corrupt ({}), ignoring it", path.display(), e);
                Ok(None)
            }
        }
    }

    /// `(version, diff_count)` of `database`, or [`LocalVersion::Unknown`].
    pub async fn current_version(&self, database: &str) -> StoreResult<LocalVersion> {
        let record = self.load(database).await?;
        Ok(LocalVersion::from(record.as_ref()))
    }

    /// Persists a new version for `database`.
    ///
    /// A `diff_count` of zero marks a full download, which also moves
    /// `full_version`.  Moving the version backwards is rejected.
    pub async fn record(
        &self,
        database: &str,
        version: u64,
        diff_count: u64,
    ) -> StoreResult<VersionRecord> {
        let lock = self.writer_lock(database).await;
        let _guard = lock.lock().await;

        let previous = self.load(database).await?;
        if let Some(prev) = &previous {
            if version < prev.version {
                return Err(StoreError::VersionRegression {
                    database: database.to_string(),
                    recorded: prev.version,
                    attempted: version,
                });
            }
        }

        let full_version = match (&previous, diff_count) {
            (_, 0) => version,
            (Some(prev), _) => prev.full_version,
            (None, _) => 0,
        };
        let record = VersionRecord {
            database: database.to_string(),
            version,
            diff_count,
            full_version,
            last_refresh: Utc::now(),
        };
        self.write_atomic(database, &record).await?;
        debug!(
            "Recorded {} version {} (diffs since full: {})",
            database, version, diff_count
        );
        Ok(record)
    }

    /// All records currently on disk, sorted by database name.
    pub async fn records(&self) -> StoreResult<Vec<VersionRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(database) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(RECORD_SUFFIX))
            else {
                continue;
            };
            if !is_valid_database_name(database) {
                continue;
            }
            if let Some(record) = self.load(database).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.database.cmp(&b.database));
        Ok(records)
    }

    async fn writer_lock(&self, database: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        Arc::clone(writers.entry(database.to_string()).or_default())
    }

    async fn write_atomic(&self, database: &str, record: &VersionRecord) -> StoreResult<()> {
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let tmp = staging.join(format!("{database}{RECORD_SUFFIX}.tmp"));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, self.record_path(database)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_until_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        assert_eq!(store.current_version("daily").await.unwrap(), LocalVersion::Unknown);

        store.record("daily", 100, 0).await.unwrap();
        assert_eq!(
            store.current_version("daily").await.unwrap(),
            LocalVersion::Known {
                version: 100,
                diff_count: 0
            }
        );
    }

    #[tokio::test]
    async fn full_version_follows_full_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        store.record("daily", 100, 0).await.unwrap();
        store.record("daily", 101, 1).await.unwrap();
        let record = store.record("daily", 102, 2).await.unwrap();
        assert_eq!(record.full_version, 100);

        let record = store.record("daily", 102, 0).await.unwrap();
        assert_eq!(record.full_version, 102);
        assert_eq!(record.diff_count, 0);
    }

    #[tokio::test]
    async fn rejects_version_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        store.record("main", 58, 0).await.unwrap();
        let err = store.record("main", 57, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionRegression {
                recorded: 58,
                attempted: 57,
                ..
            }
        ));
        assert_eq!(store.load("main").await.unwrap().unwrap().version, 58);
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("daily.version.json"), b"{ not json").unwrap();
        let store = VersionStore::new(dir.path());
        assert_eq!(store.current_version("daily").await.unwrap(), LocalVersion::Unknown);

        // Recording over a corrupt file starts a fresh record.
        store.record("daily", 5, 0).await.unwrap();
        assert_eq!(store.load("daily").await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn lists_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        store.record("main", 62, 0).await.unwrap();
        store.record("daily", 27012, 0).await.unwrap();
        std::fs::write(dir.path().join("main.cvd"), b"not a record").unwrap();

        let names: Vec<_> = store
            .records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.database)
            .collect();
        assert_eq!(names, vec!["daily", "main"]);
    }

    #[tokio::test]
    async fn rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path());
        assert!(matches!(
            store.load("../etc").await,
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_torn_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VersionStore::new(dir.path()));
        store.record("daily", 1, 0).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for v in 2..200 {
                    store.record("daily", v, v - 1).await.unwrap();
                }
            })
        };
        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut last = 0;
                for _ in 0..500 {
                    let record = store.load("daily").await.unwrap().expect("record present");
                    assert!(record.version >= last);
                    last = record.version;
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
    }
}
