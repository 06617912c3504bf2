use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::fetcher::RetryPolicy;
use crate::oracle::DEFAULT_VERSION_RECORD;
use crate::policy::DEFAULT_DIFF_COUNT_THRESHOLD;
use crate::types::is_valid_database_name;
use crate::updater::UpdaterSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("data directory {0} does not exist or is not a directory")]
    MissingDataDir(PathBuf),
    #[error("data directory {path} is not writable: {source}")]
    UnwritableDataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bind_ip {0:?}")]
    InvalidBindIp(String),
    #[error("invalid mirror_url {0:?}")]
    InvalidMirrorUrl(String),
    #[error("invalid database name {0:?}")]
    InvalidDatabase(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("no databases configured")]
    NoDatabases,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub verbose: bool,
    pub data_dir: PathBuf,
    pub mirror_url: String,
    pub diff_count_threshold: u64,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub refresh_interval_hours: u16,
    pub databases: Vec<String>,
    /// DNS TXT record announcing current versions; unset disables lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_version_record: Option<String>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Versions of diffs kept behind the newest one.
    pub diff_retention: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            data_dir: "/var/clamav/data".into(),
            mirror_url: "http://database.clamav.net".into(),
            diff_count_threshold: DEFAULT_DIFF_COUNT_THRESHOLD,
            port: 8080,
            bind_ip: None,
            refresh_interval_hours: 2,
            databases: vec!["main".into(), "daily".into(), "bytecode".into()],
            dns_version_record: Some(DEFAULT_VERSION_RECORD.into()),
            max_retries: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 60,
            diff_retention: DEFAULT_DIFF_COUNT_THRESHOLD,
            user_agent: concat!("sigmirror/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("sigmirror.toml"))
                .merge(Json::file("sigmirror.json"))
                .merge(Env::prefixed("SIGMIRROR_")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        // An empty value switches version discovery off from the environment.
        if config
            .dns_version_record
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            config.dns_version_record = None;
        }
        Ok(config)
    }

    /// Startup checks.  Any failure here must stop the process: serving a
    /// mirror that cannot be updated is worse than not serving at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_dir.is_dir() {
            return Err(ConfigError::MissingDataDir(self.data_dir.clone()));
        }
        let marker = self.data_dir.join(".sigmirror-write-test");
        fs::write(&marker, b"")
            .and_then(|()| fs::remove_file(&marker))
            .map_err(|source| ConfigError::UnwritableDataDir {
                path: self.data_dir.clone(),
                source,
            })?;

        if self.refresh_interval_hours == 0 {
            return Err(ConfigError::Zero("refresh_interval_hours"));
        }
        if self.port == 0 {
            return Err(ConfigError::Zero("port"));
        }
        if self.databases.is_empty() {
            return Err(ConfigError::NoDatabases);
        }
        if let Some(bad) = self.databases.iter().find(|d| !is_valid_database_name(d)) {
            return Err(ConfigError::InvalidDatabase(bad.clone()));
        }
        match url::Url::parse(&self.mirror_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(ConfigError::InvalidMirrorUrl(self.mirror_url.clone())),
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = match &self.bind_ip {
            Some(ip) => ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidBindIp(ip.clone()))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.refresh_interval_hours) * 3600)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn updater_settings(&self) -> UpdaterSettings {
        UpdaterSettings {
            diff_count_threshold: self.diff_count_threshold,
            diff_retention: self.diff_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_data_dir(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_upstream_tooling() {
        let config = Config::default();
        assert_eq!(config.diff_count_threshold, 100);
        assert_eq!(config.port, 8080);
        assert_eq!(config.refresh_interval(), Duration::from_secs(2 * 3600));
        assert_eq!(config.mirror_url, "http://database.clamav.net");
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn layers_override_defaults() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                port = 9000
                diff_count_threshold = 250
                databases = ["daily"]
                dns_version_record = ""
                bind_ip = "127.0.0.1"
                "#,
            ));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.diff_count_threshold, 250);
        assert_eq!(config.databases, vec!["daily"]);
        assert_eq!(config.dns_version_record, None);
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn validate_accepts_writable_directory() {
        let dir = tempfile::tempdir().unwrap();
        with_data_dir(dir.path()).validate().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn validate_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = with_data_dir(&dir.path().join("absent"));
        assert!(matches!(config.validate(), Err(ConfigError::MissingDataDir(_))));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = with_data_dir(dir.path());
        config.refresh_interval_hours = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let mut config = with_data_dir(dir.path());
        config.databases = Vec::new();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::NoDatabases));
        assert_eq!(err.to_string(), "no databases configured");

        let mut config = with_data_dir(dir.path());
        config.databases = vec!["../main".into()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDatabase(_))));

        let mut config = with_data_dir(dir.path());
        config.mirror_url = "ftp://example.com".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMirrorUrl(_))));

        let mut config = with_data_dir(dir.path());
        config.bind_ip = Some("not-an-ip".into());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBindIp(_))));
    }
}
