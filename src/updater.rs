//! Refresh cycles and their scheduling.
//!
//! A cycle moves one database through
//! `Idle -> Checking -> {FetchingFull | FetchingDiff} -> Publishing -> Idle`,
//! or ends in `Failed`, which leaves the mirror exactly as it was.  Every
//! publication renames a complete file into place before the version store
//! is told about it, so a version number never points at a missing file.
//!
//! Each tracked database runs on its own task and timer; a slow or failing
//! database does not hold up the others.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cvd;
use crate::fetcher::{FetchError, FullFetch, RemoteFetcher};
use crate::mirror::MirrorDir;
use crate::oracle::VersionOracle;
use crate::policy::{self, FetchPlan};
use crate::store::{StoreError, VersionStore};
use crate::types::{ArtifactName, LocalVersion, StagedArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Checking,
    FetchingFull,
    FetchingDiff,
    Publishing,
    Failed,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing newer upstream.
    UpToDate { version: u64 },
    /// A full database was published.
    Full { version: u64 },
    /// `applied` diffs were published, ending at `version`.
    Diffs {
        version: u64,
        applied: u64,
        diff_count: u64,
    },
    /// The cycle was abandoned; the mirror is unchanged.
    Failed { reason: String },
}

#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("publishing failed: {0}")]
    Publish(#[from] std::io::Error),
    #[error("upstream full database is version {offered}, older than recorded version {recorded}")]
    Stale { offered: u64, recorded: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct UpdaterSettings {
    pub diff_count_threshold: u64,
    /// How many versions of diffs stay published behind the current one.
    pub diff_retention: u64,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            diff_count_threshold: policy::DEFAULT_DIFF_COUNT_THRESHOLD,
            diff_retention: policy::DEFAULT_DIFF_COUNT_THRESHOLD,
        }
    }
}

/// Outcome of following a diff chain.
enum DiffRun {
    Done { version: u64, applied: u64, diff_count: u64 },
    /// The chain could not be followed; fall back to a full download.
    Fallback { reason: String, conditional: bool },
}

pub struct Updater {
    store: Arc<VersionStore>,
    mirror: MirrorDir,
    fetcher: Arc<dyn RemoteFetcher>,
    oracle: Arc<dyn VersionOracle>,
    settings: UpdaterSettings,
}

impl Updater {
    pub fn new(
        store: Arc<VersionStore>,
        mirror: MirrorDir,
        fetcher: Arc<dyn RemoteFetcher>,
        oracle: Arc<dyn VersionOracle>,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            store,
            mirror,
            fetcher,
            oracle,
            settings,
        }
    }

    /// Adopts a `.cvd` already present on disk when no record exists yet,
    /// so a pre-populated data directory is served and updated from there
    /// instead of being downloaded again.
    pub async fn seed_from_disk(&self, database: &str) -> Result<Option<u64>, StoreError> {
        if self.store.load(database).await?.is_some() {
            return Ok(None);
        }
        let path = self.mirror.artifact_path(&ArtifactName::full(database));
        if !path.exists() {
            return Ok(None);
        }
        match cvd::verify_file(&path).await {
            Ok(header) => {
                self.store.record(database, header.version, 0).await?;
                info!(
                    "Adopted existing {} at version {}",
                    path.display(),
                    header.version
                );
                Ok(Some(header.version))
            }
            Err(e) => {
                warn!("Ignoring existing {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Runs one refresh cycle for `database`.  Never fails: errors are
    /// logged and reported as [`CycleOutcome::Failed`].
    pub async fn run_cycle(&self, database: &str) -> CycleOutcome {
        match self.try_cycle(database).await {
            Ok(outcome) => {
                self.prune(database, &outcome).await;
                enter(database, CycleState::Idle);
                outcome
            }
            Err(e) => {
                enter(database, CycleState::Failed);
                error!("Refresh of {} failed: {}", database, e);
                enter(database, CycleState::Idle);
                CycleOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_cycle(&self, database: &str) -> Result<CycleOutcome, CycleError> {
        enter(database, CycleState::Checking);
        let local = self.store.current_version(database).await?;
        let remote = self.oracle.latest_version(database).await;
        let plan = policy::plan(local, remote, self.settings.diff_count_threshold);
        debug!(
            "{}: local {:?}, remote {:?}, plan {:?}",
            database, local, remote, plan
        );

        match (plan, local) {
            (FetchPlan::UpToDate, LocalVersion::Known { version, .. }) => {
                info!("{} is up to date at version {}", database, version);
                Ok(CycleOutcome::UpToDate { version })
            }
            (FetchPlan::Diffs { from, to }, LocalVersion::Known { diff_count, .. }) => {
                let limit = self.settings.diff_count_threshold;
                match self.follow_diffs(database, from, to, diff_count, limit).await? {
                    DiffRun::Done {
                        version,
                        applied,
                        diff_count,
                    } => Ok(CycleOutcome::Diffs {
                        version,
                        applied,
                        diff_count,
                    }),
                    DiffRun::Fallback { reason, conditional } => {
                        info!(
                            "No usable diff for {} ({}), falling back to a full download",
                            database, reason
                        );
                        self.fetch_full(database, conditional).await
                    }
                }
            }
            (
                FetchPlan::Full,
                LocalVersion::Known {
                    version,
                    diff_count,
                },
            ) => match self.fetch_full(database, false).await {
                Err(CycleError::Stale { offered, recorded }) => {
                    info!(
                        "Upstream full {} database lags at version {}, following diffs from {}",
                        database, offered, recorded
                    );
                    self.diffs_past_lagging_full(database, version, remote, diff_count, offered)
                        .await
                }
                result => result,
            },
            _ => self.fetch_full(database, false).await,
        }
    }

    /// Keeps a database moving when the threshold calls for a full download
    /// but the upstream only offers an older one.  The diff chain is
    /// followed past the threshold until a full download catches up.
    async fn diffs_past_lagging_full(
        &self,
        database: &str,
        version: u64,
        remote: Option<u64>,
        diff_count: u64,
        offered: u64,
    ) -> Result<CycleOutcome, CycleError> {
        match self
            .follow_diffs(database, version + 1, remote, diff_count, u64::MAX)
            .await?
        {
            DiffRun::Done {
                version,
                applied,
                diff_count,
            } => Ok(CycleOutcome::Diffs {
                version,
                applied,
                diff_count,
            }),
            // No next diff and no announced target: nothing newer exists.
            DiffRun::Fallback {
                conditional: true, ..
            } => {
                info!("{} is up to date at version {}", database, version);
                Ok(CycleOutcome::UpToDate { version })
            }
            DiffRun::Fallback { reason, .. } => {
                debug!("No diff past version {} of {}: {}", version, database, reason);
                Err(CycleError::Stale {
                    offered,
                    recorded: version,
                })
            }
        }
    }

    /// Fetches and publishes diffs `from..=to`, or until the upstream runs
    /// out when `to` is unknown.  Stops once `diff_count` reaches `limit`.
    /// Each diff is recorded before the next one is requested.
    async fn follow_diffs(
        &self,
        database: &str,
        from: u64,
        to: Option<u64>,
        mut diff_count: u64,
        limit: u64,
    ) -> Result<DiffRun, CycleError> {
        let mut version = from - 1;
        let mut applied = 0;

        loop {
            let next = version + 1;
            if to.is_some_and(|to| next > to) {
                break;
            }
            if policy::should_fetch_full(diff_count, limit) {
                // The next cycle starts over from a full download.
                info!("{} reached the diff threshold at version {}", database, version);
                break;
            }

            enter(database, CycleState::FetchingDiff);
            let staged = match self.fetcher.fetch_diff(database, next, &self.mirror).await {
                Ok(staged) => staged,
                // Without a known target, running out of diffs after making
                // progress means the chain is complete.
                Err(e) if to.is_none() && e.is_not_found() && applied > 0 => break,
                Err(error) => {
                    // A missing first diff with no known target most likely
                    // means there is nothing new; ask conditionally.
                    let conditional = to.is_none() && error.is_not_found() && applied == 0;
                    return Ok(DiffRun::Fallback {
                        reason: error.to_string(),
                        conditional,
                    });
                }
            };

            self.publish(database, staged, diff_count + 1).await?;
            version = next;
            diff_count += 1;
            applied += 1;
        }

        if applied == 0 {
            return Ok(DiffRun::Fallback {
                reason: "no diff chain to follow".to_string(),
                conditional: to.is_none(),
            });
        }
        info!(
            "{} advanced by {} diff(s) to version {}",
            database, applied, version
        );
        Ok(DiffRun::Done {
            version,
            applied,
            diff_count,
        })
    }

    async fn fetch_full(&self, database: &str, conditional: bool) -> Result<CycleOutcome, CycleError> {
        enter(database, CycleState::FetchingFull);
        let local = self.store.current_version(database).await?;
        let since = match (conditional, local) {
            (true, LocalVersion::Known { .. }) => {
                self.mirror.modified(&ArtifactName::full(database)).await
            }
            _ => None,
        };

        let staged = match self
            .fetcher
            .fetch_full_database(database, &self.mirror, since)
            .await?
        {
            FullFetch::Fetched(staged) => staged,
            FullFetch::NotModified => {
                let version = match local {
                    LocalVersion::Known { version, .. } => version,
                    LocalVersion::Unknown => 0,
                };
                info!("{} is up to date at version {}", database, version);
                return Ok(CycleOutcome::UpToDate { version });
            }
        };

        if let LocalVersion::Known { version, .. } = local {
            if staged.version < version {
                self.mirror.discard(&staged).await;
                return Err(CycleError::Stale {
                    offered: staged.version,
                    recorded: version,
                });
            }
        }

        let version = staged.version;
        self.publish(database, staged, 0).await?;
        info!("Published full {} database at version {}", database, version);
        Ok(CycleOutcome::Full { version })
    }

    /// Renames the staged file into place, then records the new version.
    async fn publish(
        &self,
        database: &str,
        staged: StagedArtifact,
        diff_count: u64,
    ) -> Result<(), CycleError> {
        enter(database, CycleState::Publishing);
        let version = staged.version;
        let artifact = self.mirror.publish(staged).await?;
        debug!(
            "Published {} ({} bytes)",
            artifact.path.display(),
            artifact.size
        );
        self.store.record(database, version, diff_count).await?;
        Ok(())
    }

    async fn prune(&self, database: &str, outcome: &CycleOutcome) {
        let version = match outcome {
            CycleOutcome::Full { version } | CycleOutcome::Diffs { version, .. } => *version,
            _ => return,
        };
        let keep_from = version.saturating_sub(self.settings.diff_retention) + 1;
        match self.mirror.prune_diffs(database, keep_from).await {
            Ok(0) => {}
            Ok(n) => debug!("Pruned {} old diff(s) of {}", n, database),
            Err(e) => warn!("Failed to prune diffs of {}: {}", database, e),
        }
    }

    /// Starts the recurring cycle for `database`: once immediately, then
    /// every `interval` until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        database: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    outcome = self.run_cycle(&database) => outcome,
                };
                debug!("{} cycle finished: {:?}", database, outcome);
            }
            info!("Updater for {} stopped", database);
        })
    }
}

fn enter(database: &str, state: CycleState) {
    debug!("{} -> {:?}", database, state);
}

/// The set of running updater tasks, one per database, each with its own
/// cancellation token.
pub struct UpdateScheduler {
    tasks: Vec<(String, CancellationToken, JoinHandle<()>)>,
}

impl UpdateScheduler {
    pub fn start(
        updater: Arc<Updater>,
        databases: &[String],
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let tasks = databases
            .iter()
            .map(|database| {
                let token = shutdown.child_token();
                let handle =
                    Arc::clone(&updater).spawn(database.clone(), interval, token.clone());
                (database.clone(), token, handle)
            })
            .collect();
        Self { tasks }
    }

    /// Stops the updater of a single database.
    pub fn cancel(&self, database: &str) {
        for (name, token, _) in &self.tasks {
            if name == database {
                token.cancel();
            }
        }
    }

    /// Cancels every task and waits for them to finish.
    pub async fn shutdown(self) {
        for (_, token, _) in &self.tasks {
            token.cancel();
        }
        for (database, _, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!("Updater task for {} ended abnormally: {}", database, e);
            }
        }
    }
}
