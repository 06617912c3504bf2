use std::future::Future;
use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{header, Client, Response, StatusCode};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout};
use url::Url;

use super::{FetchError, FullFetch, RemoteFetcher};
use crate::cvd::CvdDigest;
use crate::mirror::{http_date, MirrorDir};
use crate::types::{ArtifactName, StagedArtifact};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Downloads artifacts from an HTTP mirror of the ClamAV feed.
pub struct HttpFetcher {
    client: Client,
    mirror_url: Url,
    retry: RetryPolicy,
    /// Limit for connecting and for each gap between body chunks.  A full
    /// database can take minutes to transfer, so there is no overall limit.
    io_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        mirror_url: &str,
        user_agent: &str,
        retry: RetryPolicy,
        io_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut mirror_url =
            Url::parse(mirror_url).map_err(|e| FetchError::InvalidUrl(format!("{mirror_url}: {e}")))?;
        if mirror_url.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl(mirror_url.to_string()));
        }
        if !mirror_url.path().ends_with('/') {
            let path = format!("{}/", mirror_url.path());
            mirror_url.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(io_timeout)
            .build()
            .map_err(|source| FetchError::Network {
                url: mirror_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            mirror_url,
            retry,
            io_timeout,
        })
    }

    /// `<mirror>/<file name>`; deterministic for a given artifact.
    pub fn url_for(&self, name: &ArtifactName) -> String {
        match self.mirror_url.join(&name.to_string()) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", self.mirror_url, name),
        }
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut attempt: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.retry.max_retries + 1;
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < attempts => {
                    let delay = self.retry.delay_for(tries);
                    warn!(
                        "Fetching {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        url, tries, attempts, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts,
                        last: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        url: &str,
        name: &ArtifactName,
        if_modified_since: Option<SystemTime>,
        mirror: &MirrorDir,
    ) -> Result<Option<StagedArtifact>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(since) = if_modified_since {
            request = request.header(header::IF_MODIFIED_SINCE, http_date(since));
        }
        let response = match timeout(self.io_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => return Err(request_error(url, source)),
            Err(_) => return Err(FetchError::Timeout { url: url.to_string() }),
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(None),
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound { url: url.to_string() }),
            status if !status.is_success() => {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let (path, file) = mirror.create_staging(name).await?;
        match self.stream_to(url, name, response, file).await {
            Ok((version, size)) => Ok(Some(StagedArtifact {
                name: name.clone(),
                version,
                path,
                size,
            })),
            Err(e) => {
                remove_partial(&path).await;
                Err(e)
            }
        }
    }

    /// Copies the body into `file`, verifying full databases on the way.
    /// Returns the artifact version and byte count.
    async fn stream_to(
        &self,
        url: &str,
        name: &ArtifactName,
        response: Response,
        mut file: File,
    ) -> Result<(u64, u64), FetchError> {
        let expected = response.content_length();
        let mut digest = matches!(name, ArtifactName::Full { .. }).then(CvdDigest::new);
        let mut body = Box::pin(response.bytes_stream());
        let mut received: u64 = 0;

        loop {
            let chunk = match timeout(self.io_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(source))) => return Err(request_error(url, source)),
                Ok(None) => break,
                Err(_) => return Err(FetchError::Timeout { url: url.to_string() }),
            };
            file.write_all(&chunk).await?;
            if let Some(digest) = digest.as_mut() {
                digest.update(&chunk);
            }
            received += chunk.len() as u64;
        }

        if let Some(expected) = expected {
            if received != expected {
                return Err(FetchError::Truncated {
                    url: url.to_string(),
                    expected,
                    received,
                });
            }
        }
        if received == 0 {
            return Err(FetchError::Empty { url: url.to_string() });
        }
        file.flush().await?;
        file.sync_all().await?;

        let version = match name {
            ArtifactName::Diff { version, .. } => *version,
            ArtifactName::Full { .. } => {
                digest
                    .unwrap_or_default()
                    .finish()
                    .map_err(|source| FetchError::Corrupt {
                        url: url.to_string(),
                        source,
                    })?
                    .version
            }
        };
        debug!("Downloaded {} ({} bytes)", url, received);
        Ok((version, received))
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch_full_database(
        &self,
        database: &str,
        mirror: &MirrorDir,
        if_modified_since: Option<SystemTime>,
    ) -> Result<FullFetch, FetchError> {
        let name = ArtifactName::full(database);
        let url = self.url_for(&name);
        info!("Downloading full database {}", url);
        let staged = self
            .with_retry(&url, || self.download_once(&url, &name, if_modified_since, mirror))
            .await?;
        Ok(match staged {
            Some(staged) => FullFetch::Fetched(staged),
            None => FullFetch::NotModified,
        })
    }

    async fn fetch_diff(
        &self,
        database: &str,
        version: u64,
        mirror: &MirrorDir,
    ) -> Result<StagedArtifact, FetchError> {
        let name = ArtifactName::diff(database, version);
        let url = self.url_for(&name);
        debug!("Downloading diff {}", url);
        // Diff requests are never conditional, so a 304 cannot come back as
        // a success; treat one as a protocol error.
        self.with_retry(&url, || self.download_once(&url, &name, None, mirror))
            .await?
            .ok_or_else(|| FetchError::Status {
                url: url.clone(),
                status: StatusCode::NOT_MODIFIED.as_u16(),
            })
    }
}

fn request_error(url: &str, source: reqwest::Error) -> FetchError {
    if source.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source,
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial download {}: {}", path.display(), e);
        }
    }
}
