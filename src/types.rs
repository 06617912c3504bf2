//! Data structures shared by the updater, the version store and the server.
//!
//! Artifacts are addressed by file name exactly as the upstream feed names
//! them: `<db>.cvd` for a full database and `<db>-<version>.cdiff` for one
//! incremental diff.  Database names are restricted to ASCII alphanumerics
//! and `_` so that both forms parse back unambiguously.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returns true if `name` can be used as a tracked database name.
pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// File name of an artifact, parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactName {
    /// `<database>.cvd`
    Full { database: String },
    /// `<database>-<version>.cdiff`
    Diff { database: String, version: u64 },
}

impl ArtifactName {
    pub fn full(database: impl Into<String>) -> Self {
        ArtifactName::Full {
            database: database.into(),
        }
    }

    pub fn diff(database: impl Into<String>, version: u64) -> Self {
        ArtifactName::Diff {
            database: database.into(),
            version,
        }
    }

    /// Parses a bare file name.  Anything that is not exactly one of the two
    /// artifact forms (paths, hidden files, stray suffixes) yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        if let Some(database) = file_name.strip_suffix(".cvd") {
            return is_valid_database_name(database).then(|| Self::full(database));
        }
        let stem = file_name.strip_suffix(".cdiff")?;
        let (database, version) = stem.rsplit_once('-')?;
        if !is_valid_database_name(database)
            || version.is_empty()
            || !version.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let version = version.parse().ok()?;
        Some(Self::diff(database, version))
    }

    pub fn database(&self) -> &str {
        match self {
            ArtifactName::Full { database } | ArtifactName::Diff { database, .. } => database,
        }
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactName::Full { database } => write!(f, "{database}.cvd"),
            ArtifactName::Diff { database, version } => write!(f, "{database}-{version}.cdiff"),
        }
    }
}

/// A complete artifact file sitting in the staging area, not yet visible
/// to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub name: ArtifactName,
    /// Feed version the file represents.  For full databases this is the
    /// version read from the verified header.
    pub version: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// A published artifact.  Never modified after publication; a newer file is
/// renamed over it instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: ArtifactName,
    pub version: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// Persisted state of one tracked database.
///
/// `version` never decreases over the life of a record, and `diff_count`
/// is zero exactly when the last publication was a full download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub database: String,
    /// Newest version available in the mirror, counting diffs.
    pub version: u64,
    /// Diffs applied since the last full download.
    pub diff_count: u64,
    /// Version of the published full database file.
    #[serde(default)]
    pub full_version: u64,
    pub last_refresh: DateTime<Utc>,
}

/// The local version of a database as seen at the start of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalVersion {
    /// Nothing recorded yet; the next cycle must fetch a full database.
    Unknown,
    Known { version: u64, diff_count: u64 },
}

impl From<Option<&VersionRecord>> for LocalVersion {
    fn from(record: Option<&VersionRecord>) -> Self {
        match record {
            Some(r) => LocalVersion::Known {
                version: r.version,
                diff_count: r.diff_count,
            },
            None => LocalVersion::Unknown,
        }
    }
}
