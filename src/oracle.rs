//! Upstream version discovery.
//!
//! ClamAV publishes the newest version of every database in a DNS TXT
//! record (`current.cvd.clamav.net`), formatted as colon separated fields:
//!
//! ```text
//! 1.4.1:62:27420:1729666140:1:90:49192:335
//! ```
//!
//! Field 1 is `main`, field 2 `daily` and field 7 `bytecode`.  Knowing the
//! target version lets a cycle skip the network entirely when nothing
//! changed and fetch exactly the diffs it needs otherwise.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, error, warn};

pub const DEFAULT_VERSION_RECORD: &str = "current.cvd.clamav.net";

#[async_trait]
pub trait VersionOracle: Send + Sync {
    /// Newest upstream version of `database`, if it can be determined.
    async fn latest_version(&self, database: &str) -> Option<u64>;
}

/// Oracle for setups without version discovery: every cycle asks the
/// mirror directly.
pub struct NoOracle;

#[async_trait]
impl VersionOracle for NoOracle {
    async fn latest_version(&self, _database: &str) -> Option<u64> {
        None
    }
}

pub struct DnsVersionOracle {
    resolver: TokioAsyncResolver,
    record: String,
}

impl DnsVersionOracle {
    pub fn new(record: impl Into<String>) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            error!(
                "Failed to load system resolv.conf: {}. Falling back to default resolvers.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self {
            resolver,
            record: record.into(),
        }
    }
}

#[async_trait]
impl VersionOracle for DnsVersionOracle {
    async fn latest_version(&self, database: &str) -> Option<u64> {
        let lookup = match self.resolver.txt_lookup(self.record.as_str()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!("TXT lookup for {} failed: {}", self.record, e);
                return None;
            }
        };
        for txt in lookup.iter() {
            let text: String = txt
                .txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part))
                .collect();
            if let Some(version) = parse_version_record(&text, database) {
                debug!("{} reports {} version {}", self.record, database, version);
                return Some(version);
            }
        }
        None
    }
}

/// Extracts the version of `database` from the TXT record text.
pub fn parse_version_record(text: &str, database: &str) -> Option<u64> {
    let index = match database {
        "main" => 1,
        "daily" => 2,
        "bytecode" => 7,
        _ => return None,
    };
    text.trim_matches('"')
        .split(':')
        .nth(index)?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = "1.4.1:62:27420:1729666140:1:90:49192:335";

    #[test]
    fn reads_known_databases() {
        assert_eq!(parse_version_record(RECORD, "main"), Some(62));
        assert_eq!(parse_version_record(RECORD, "daily"), Some(27420));
        assert_eq!(parse_version_record(RECORD, "bytecode"), Some(335));
        assert_eq!(parse_version_record(&format!("\"{RECORD}\""), "daily"), Some(27420));
    }

    #[test]
    fn unknown_database_or_garbage_yields_none() {
        assert_eq!(parse_version_record(RECORD, "safebrowsing"), None);
        assert_eq!(parse_version_record("1.4.1:x:y", "main"), None);
        assert_eq!(parse_version_record("1.4.1", "daily"), None);
    }

    #[tokio::test]
    async fn no_oracle_never_knows() {
        assert_eq!(NoOracle.latest_version("daily").await, None);
    }
}
