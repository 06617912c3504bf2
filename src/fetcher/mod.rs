use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use crate::cvd::CvdError;
use crate::mirror::MirrorDir;
use crate::types::StagedArtifact;

pub mod http;
pub use http::{HttpFetcher, RetryPolicy};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} does not exist upstream")]
    NotFound { url: String },
    #[error("{url} was cut short: expected {expected} bytes, received {received}")]
    Truncated {
        url: String,
        expected: u64,
        received: u64,
    },
    #[error("{url} returned an empty body")]
    Empty { url: String },
    #[error("{url} failed verification: {source}")]
    Corrupt {
        url: String,
        #[source]
        source: CvdError,
    },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },
    #[error("could not stage download: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid mirror url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Failures worth retrying within the same cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } | FetchError::Truncated { .. } => {
                true
            }
            FetchError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The upstream has no such file.  For a diff this means the chain
    /// ends here or was never available from this version.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Result of a full database download.
#[derive(Debug)]
pub enum FullFetch {
    Fetched(StagedArtifact),
    /// The conditional request found the published file still current.
    NotModified,
}

/// Source of full databases and diffs.
///
/// Implementations download into the mirror's staging area and hand back
/// complete, verified files; publishing them is up to the caller.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Downloads `<database>.cvd`.  With `if_modified_since` set the request
    /// is conditional and may report [`FullFetch::NotModified`].
    async fn fetch_full_database(
        &self,
        database: &str,
        mirror: &MirrorDir,
        if_modified_since: Option<SystemTime>,
    ) -> Result<FullFetch, FetchError>;

    /// Downloads `<database>-<version>.cdiff`.
    async fn fetch_diff(
        &self,
        database: &str,
        version: u64,
        mirror: &MirrorDir,
    ) -> Result<StagedArtifact, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        let url = || "http://mirror/daily.cvd".to_string();
        assert!(FetchError::Timeout { url: url() }.is_transient());
        assert!(FetchError::Status { url: url(), status: 503 }.is_transient());
        assert!(FetchError::Status { url: url(), status: 429 }.is_transient());
        assert!(FetchError::Truncated {
            url: url(),
            expected: 10,
            received: 4
        }
        .is_transient());

        assert!(!FetchError::Status { url: url(), status: 403 }.is_transient());
        assert!(!FetchError::NotFound { url: url() }.is_transient());
        assert!(FetchError::NotFound { url: url() }.is_not_found());
        assert!(!FetchError::Corrupt {
            url: url(),
            source: CvdError::BadMagic
        }
        .is_transient());
    }
}
