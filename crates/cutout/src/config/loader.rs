use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::resolver::canonical_or_clean;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Loads a config file and then applies `CUTOUT_*` environment overrides.
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    config.apply_env_overrides()?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let durations = [
        ("cleanup_interval_secs", config.cleanup_interval_secs),
        ("temp_file_max_age_secs", config.temp_file_max_age_secs),
        (
            "downloaded_job_retention_secs",
            config.downloaded_job_retention_secs,
        ),
    ];
    for (name, value) in durations {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than 0", name),
            });
        }
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be greater than 0".to_string(),
        });
    }

    if config.jobs_root.as_os_str().is_empty() || config.temp_root.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "jobs_root and temp_root must not be empty".to_string(),
        });
    }

    // Compared as absolute, normalized paths so `./a`, `a/../a` and `/cwd/a` agree
    let jobs_root = canonical_or_clean(&config.jobs_root);
    let temp_root = canonical_or_clean(&config.temp_root);

    if jobs_root == temp_root {
        return Err(ConfigError::Validation {
            message: format!(
                "jobs_root and temp_root must differ (both are '{}')",
                config.jobs_root.display()
            ),
        });
    }

    // The temp sweeper deletes everything old under temp_root
    if jobs_root.starts_with(&temp_root) {
        return Err(ConfigError::Validation {
            message: format!(
                "jobs_root '{}' must not be inside temp_root '{}'",
                config.jobs_root.display(),
                config.temp_root.display()
            ),
        });
    }

    Ok(())
}
