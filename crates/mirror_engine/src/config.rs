use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fetch::FetchOptions;

pub const DEFAULT_ALLOWED_HOST: &str = "qpic.cn";
pub const DEFAULT_MIRROR_REFERER: &str = "https://mp.weixin.qq.com/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

/// Settings for one pipeline invocation. Passed explicitly to every entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Host suffixes whose media may be mirrored.
    pub allowed_hosts: Vec<String>,
    pub cache_ttl_hours: u64,
    pub cache_max_age_seconds: u64,
    pub upload_concurrency: usize,
    pub fetch_timeout_ms: u64,
    pub fetch_max_attempts: u32,
    pub fetch_base_delay_ms: u64,
    pub mirror_timeout_ms: u64,
    pub mirror_max_attempts: u32,
    /// Referer sent with media downloads to get past hotlink protection.
    pub mirror_referer: String,
    pub max_bytes: u64,
    /// Public base URL of the mirrored store. `None` disables mirroring.
    pub public_base_url: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![DEFAULT_ALLOWED_HOST.to_string()],
            cache_ttl_hours: 8,
            cache_max_age_seconds: 8 * 60 * 60,
            upload_concurrency: 5,
            fetch_timeout_ms: 15_000,
            fetch_max_attempts: 3,
            fetch_base_delay_ms: 800,
            mirror_timeout_ms: 10_000,
            mirror_max_attempts: 2,
            mirror_referer: DEFAULT_MIRROR_REFERER.to_string(),
            max_bytes: 20 * 1024 * 1024,
            public_base_url: None,
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_concurrency == 0 {
            return Err(ConfigError("upload_concurrency must be at least 1".into()));
        }
        if self.fetch_max_attempts == 0 || self.mirror_max_attempts == 0 {
            return Err(ConfigError("max attempts must be at least 1".into()));
        }
        if self.allowed_hosts.iter().any(|host| host.trim_matches('.').is_empty()) {
            return Err(ConfigError("allowed_hosts contains an empty entry".into()));
        }
        Ok(())
    }

    /// Mirroring is enabled only when a public base URL is configured.
    pub fn mirroring_enabled(&self) -> bool {
        self.public_base_url
            .as_deref()
            .is_some_and(|base| !base.trim().is_empty())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        i64::try_from(self.cache_ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Options for the primary document fetch.
    pub fn document_fetch_options(&self) -> FetchOptions {
        FetchOptions {
            max_attempts: self.fetch_max_attempts,
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            max_bytes: self.max_bytes,
            ..FetchOptions::default()
        }
    }

    /// Options for media downloads: fewer attempts, shorter timeout, fixed referer.
    pub fn mirror_fetch_options(&self) -> FetchOptions {
        FetchOptions {
            max_attempts: self.mirror_max_attempts,
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            timeout: Duration::from_millis(self.mirror_timeout_ms),
            referer: Some(self.mirror_referer.clone()),
            max_bytes: self.max_bytes,
            ..FetchOptions::default()
        }
    }
}
