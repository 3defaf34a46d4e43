pub mod retry;

use chrono::{DateTime, SubsecRound, Utc};
use config::{Environment, File, FileFormat};
use std::path::Path;
use tracing::info;

use crate::models::common::Config;
use crate::models::errors::ConfigError;

const ENV_PREFIX: &str = "INDEXER";

/// Drop the sub-second component. The store's time columns have second
/// granularity and dedup compares timestamps for equality.
pub fn truncate_to_seconds(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(0)
}

pub fn load_config<P: AsRef<Path>>(file_name: P) -> Result<Config, ConfigError> {
    // Build the path to the config file
    let manifest_dir = env!("CARGO_MANIFEST_DIR").to_string();
    let config_path = Path::new(&manifest_dir).join(file_name);
    info!("Config path: {}", config_path.to_string_lossy());

    let raw = config::Config::builder()
        .add_source(
            File::from(config_path)
                .format(FileFormat::Yaml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut config: Config = raw.try_deserialize()?;
    validate_config(&mut config)?;
    Ok(config)
}

pub fn load_config_from_str(contents: &str) -> Result<Config, ConfigError> {
    let raw = config::Config::builder()
        .add_source(File::from_str(contents, FileFormat::Yaml))
        .build()?;

    let mut config: Config = raw.try_deserialize()?;
    validate_config(&mut config)?;
    Ok(config)
}

fn validate_config(config: &mut Config) -> Result<(), ConfigError> {
    if config.chain_name.trim().is_empty() {
        config.chain_name = "cardano".to_string();
    }

    // Convert hyphens to underscores so the name is usable as an identifier
    config.chain_name = config.chain_name.replace('-', "_");
    config.store.dataset_id = config.store.dataset_id.replace('-', "_");

    if config.window.capacity == 0 {
        return Err(ConfigError::Invalid {
            field: "window.capacity".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if config.live.channel_capacity == 0 {
        return Err(ConfigError::Invalid {
            field: "live.channel_capacity".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if config.store.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "store.request_timeout_ms".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if config.store.table_id.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "store.table_id".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if config.feed.source.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "feed.source".to_string(),
            reason: "must be 'stdin' or a file path".to_string(),
        });
    }

    Ok(())
}

pub(crate) fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}
