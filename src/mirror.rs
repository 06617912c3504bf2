//! On-disk layout of the mirror.
//!
//! Published artifacts live directly in the data directory.  Every write
//! first lands in `.staging/` on the same filesystem and is then renamed
//! into place, so a file that is visible under its published name is always
//! complete.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::fs::{self, File};

use crate::types::{Artifact, ArtifactName, StagedArtifact};

pub const STAGING_DIR: &str = ".staging";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct MirrorDir {
    root: PathBuf,
}

impl MirrorDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn artifact_path(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.to_string())
    }

    /// Creates the staging area and drops anything a previous process left
    /// behind when it was stopped mid-download.
    pub async fn prepare(&self) -> io::Result<()> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let mut entries = fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                debug!("Removing stale staging file {}", entry.path().display());
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Opens a fresh, uniquely named staging file for `name`.
    pub async fn create_staging(&self, name: &ArtifactName) -> io::Result<(PathBuf, File)> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = staging.join(format!("{name}.{}.{seq}.part", std::process::id()));
        let file = File::create(&path).await?;
        Ok((path, file))
    }

    /// Makes a staged file visible under its published name.
    ///
    /// The rename replaces any previous file atomically: a reader that
    /// already holds the old file keeps reading the old bytes, and every
    /// later open sees the new file in full.
    pub async fn publish(&self, staged: StagedArtifact) -> io::Result<Artifact> {
        let target = self.artifact_path(&staged.name);
        if let Err(e) = fs::rename(&staged.path, &target).await {
            self.discard(&staged).await;
            return Err(e);
        }
        // Persist the directory entry itself.
        if cfg!(unix) {
            if let Ok(dir) = File::open(&self.root).await {
                if let Err(e) = dir.sync_all().await {
                    debug!("Could not sync {}: {}", self.root.display(), e);
                }
            }
        }
        Ok(Artifact {
            name: staged.name,
            version: staged.version,
            path: target,
            size: staged.size,
        })
    }

    pub async fn discard(&self, staged: &StagedArtifact) {
        if let Err(e) = fs::remove_file(&staged.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging file {}: {}", staged.path.display(), e);
            }
        }
    }

    /// Modification time of a published artifact, if present.
    pub async fn modified(&self, name: &ArtifactName) -> Option<SystemTime> {
        let meta = fs::metadata(self.artifact_path(name)).await.ok()?;
        meta.modified().ok()
    }

    /// Diff versions currently published for `database`, ascending.
    pub async fn diff_versions(&self, database: &str) -> io::Result<Vec<u64>> {
        let mut versions = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(ArtifactName::Diff {
                database: db,
                version,
            }) = ArtifactName::parse(file_name)
            {
                if db == database {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Removes diffs of `database` older than `keep_from`.  Returns how many
    /// files were deleted.
    pub async fn prune_diffs(&self, database: &str, keep_from: u64) -> io::Result<usize> {
        let mut removed = 0;
        for version in self.diff_versions(database).await? {
            if version >= keep_from {
                break;
            }
            let path = self.artifact_path(&ArtifactName::diff(database, version));
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Writes `bytes` into a new staging file in one go.
    pub async fn stage_bytes(
        &self,
        name: ArtifactName,
        version: u64,
        bytes: &[u8],
    ) -> io::Result<StagedArtifact> {
        use tokio::io::AsyncWriteExt;

        let (path, mut file) = self.create_staging(&name).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(StagedArtifact {
            name,
            version,
            path,
            size: bytes.len() as u64,
        })
    }
}

/// Formats a timestamp as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
