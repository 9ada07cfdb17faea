use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use mirror_engine::{ConfigError, MirrorConfig};
use pipeline_logging::{pipeline_info, pipeline_warn};
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "mirror.ron";

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub mirror: MirrorConfig,
    /// Directory backing the filesystem object store.
    pub store_root: PathBuf,
    /// Remote conversion endpoint. Documents are converted locally when unset.
    pub conversion_endpoint: Option<String>,
    pub conversion_timeout_ms: u64,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mirror: MirrorConfig::default(),
            store_root: PathBuf::from("./mirror_store"),
            conversion_endpoint: None,
            conversion_timeout_ms: 30_000,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_millis(self.conversion_timeout_ms)
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

fn parse_app_config(path: &Path, text: &str) -> Result<AppConfig, AppConfigError> {
    let config: AppConfig = ron::from_str(text).map_err(|source| AppConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.mirror.validate()?;
    Ok(config)
}

/// Load the app config from a RON file. A missing file yields the defaults.
pub(crate) fn load_app_config(path: &Path) -> Result<AppConfig, AppConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            pipeline_warn!("Config {:?} not found, using defaults", path);
            return Ok(AppConfig::default());
        }
        Err(source) => {
            return Err(AppConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let config = parse_app_config(path, &content)?;
    pipeline_info!("Loaded config from {:?}", path);
    Ok(config)
}
