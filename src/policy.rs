//! Full-versus-diff decision for a refresh cycle.

use crate::types::LocalVersion;

pub const DEFAULT_DIFF_COUNT_THRESHOLD: u64 = 100;

/// True once `diff_count` diffs have been chained since the last full
/// download and the next refresh must fetch the whole database again.
pub fn should_fetch_full(diff_count: u64, threshold: u64) -> bool {
    diff_count >= threshold
}

/// What a cycle should try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// The upstream has nothing newer than what is published.
    UpToDate,
    /// Download the full database.
    Full,
    /// Fetch diffs starting at `from`, up to and including `to` when the
    /// upstream version is known, or until the upstream runs out otherwise.
    Diffs { from: u64, to: Option<u64> },
}

/// Chooses a plan from the local record and, if known, the newest upstream
/// version.
///
/// An unknown local version always means a full download.  When the
/// upstream is more than `threshold` versions ahead there is no diff chain
/// worth following, which is treated the same as exceeding the threshold.
pub fn plan(local: LocalVersion, remote: Option<u64>, threshold: u64) -> FetchPlan {
    let LocalVersion::Known {
        version,
        diff_count,
    } = local
    else {
        return FetchPlan::Full;
    };

    if let Some(remote) = remote {
        if remote <= version {
            return FetchPlan::UpToDate;
        }
    }
    if should_fetch_full(diff_count, threshold) {
        return FetchPlan::Full;
    }
    if let Some(remote) = remote {
        if remote - version > threshold {
            return FetchPlan::Full;
        }
    }
    FetchPlan::Diffs {
        from: version + 1,
        to: remote,
    }
}
