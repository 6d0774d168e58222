use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retention::RetentionPolicy;
use crate::telemetry::LogFormat;

/// Prefix of every environment variable that overrides a config field.
pub const ENV_PREFIX: &str = "CUTOUT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_jobs_root")]
    pub jobs_root: PathBuf,
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_temp_file_max_age_secs")]
    pub temp_file_max_age_secs: u64,
    #[serde(default = "default_downloaded_job_retention_secs")]
    pub downloaded_job_retention_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_jobs_root() -> PathBuf {
    PathBuf::from("storage/jobs")
}

fn default_temp_root() -> PathBuf {
    PathBuf::from("storage/temp")
}

fn default_cleanup_interval_secs() -> u64 {
    1800
}

fn default_temp_file_max_age_secs() -> u64 {
    3600
}

fn default_downloaded_job_retention_secs() -> u64 {
    12 * 3600
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs_root: default_jobs_root(),
            temp_root: default_temp_root(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            temp_file_max_age_secs: default_temp_file_max_age_secs(),
            downloaded_job_retention_secs: default_downloaded_job_retention_secs(),
            worker_count: default_worker_count(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `CUTOUT_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        super::loader::validate_config(&config)?;
        Ok(config)
    }

    /// Overrides fields from `CUTOUT_*` environment variables.
    ///
    /// Recognized: `CUTOUT_JOBS_ROOT`, `CUTOUT_TEMP_ROOT`,
    /// `CUTOUT_CLEANUP_INTERVAL_SECS`, `CUTOUT_TEMP_FILE_MAX_AGE_SECS`,
    /// `CUTOUT_DOWNLOADED_JOB_RETENTION_SECS`, `CUTOUT_WORKER_COUNT` and
    /// `CUTOUT_LOG_FORMAT`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |field: &str| {
            let name = format!("{}{}", ENV_PREFIX, field);
            lookup(&name)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (name, v))
        };

        if let Some((_, v)) = get("JOBS_ROOT") {
            self.jobs_root = PathBuf::from(v);
        }
        if let Some((_, v)) = get("TEMP_ROOT") {
            self.temp_root = PathBuf::from(v);
        }
        if let Some((name, v)) = get("CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = parse_number(&name, &v)?;
        }
        if let Some((name, v)) = get("TEMP_FILE_MAX_AGE_SECS") {
            self.temp_file_max_age_secs = parse_number(&name, &v)?;
        }
        if let Some((name, v)) = get("DOWNLOADED_JOB_RETENTION_SECS") {
            self.downloaded_job_retention_secs = parse_number(&name, &v)?;
        }
        if let Some((name, v)) = get("WORKER_COUNT") {
            self.worker_count = parse_number(&name, &v)?;
        }
        if let Some((name, v)) = get("LOG_FORMAT") {
            self.log_format = v.parse().map_err(|_| ConfigError::InvalidEnv {
                name,
                value: v.clone(),
            })?;
        }

        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn temp_file_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_file_max_age_secs)
    }

    pub fn downloaded_job_retention(&self) -> Duration {
        Duration::from_secs(self.downloaded_job_retention_secs)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            interval: self.cleanup_interval(),
            temp_file_max_age: self.temp_file_max_age(),
            downloaded_job_retention: self.downloaded_job_retention(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}
