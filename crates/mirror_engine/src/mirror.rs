use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use pipeline_logging::{pipeline_debug, pipeline_info, pipeline_warn};

use crate::config::MirrorConfig;
use crate::fetch::{Fetcher, ProgressSink};
use crate::key::{derive_key, CacheKey};
use crate::store::{CacheMetadata, ObjectStore, PutOptions, StoreError};
use crate::{BatchStats, FetchError};

const DEFAULT_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Uploaded,
    Skipped,
    Failed,
}

/// Copies allow-listed media into an [`ObjectStore`] in bounded concurrent windows.
#[derive(Clone)]
pub struct MediaMirror {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ObjectStore>,
}

impl MediaMirror {
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<dyn ObjectStore>) -> Self {
        Self { fetcher, store }
    }

    /// Mirror every URL; never fails as a whole.
    ///
    /// Windows of `upload_concurrency` items run concurrently and the next window
    /// starts only once the current one has settled. URLs without a key, and
    /// URLs whose key another URL in the batch already claimed, count as skipped.
    pub async fn mirror<U: AsRef<str>>(
        &self,
        urls: &[U],
        config: &MirrorConfig,
        sink: &dyn ProgressSink,
    ) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut claimed = HashSet::new();
        let mut work = Vec::with_capacity(urls.len());
        for url in urls {
            let url = url.as_ref();
            match derive_key(url, &config.allowed_hosts) {
                Some(key) if claimed.insert(key.key.clone()) => work.push((url, key)),
                Some(_) => stats.skipped += 1,
                None => {
                    pipeline_debug!("Skipping {}: host not allow-listed", url);
                    stats.skipped += 1;
                }
            }
        }

        let limit = config.upload_concurrency.max(1);
        for window in work.chunks(limit) {
            let outcomes = join_all(
                window
                    .iter()
                    .map(|(url, key)| self.mirror_one(url, key, config, sink)),
            )
            .await;
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Uploaded => stats.uploaded += 1,
                    ItemOutcome::Skipped => stats.skipped += 1,
                    ItemOutcome::Failed => stats.failed += 1,
                }
            }
        }

        pipeline_info!("Mirror batch of {} finished: {}", urls.len(), stats);
        stats
    }

    async fn mirror_one(
        &self,
        url: &str,
        key: &CacheKey,
        config: &MirrorConfig,
        sink: &dyn ProgressSink,
    ) -> ItemOutcome {
        match self.try_mirror_one(url, key, config, sink).await {
            Ok(outcome) => outcome,
            Err(err) => {
                pipeline_warn!("Mirroring {} as {} failed: {}", url, key.key, err);
                ItemOutcome::Failed
            }
        }
    }

    async fn try_mirror_one(
        &self,
        url: &str,
        key: &CacheKey,
        config: &MirrorConfig,
        sink: &dyn ProgressSink,
    ) -> Result<ItemOutcome, MirrorError> {
        if self.store.exists(&key.key).await? {
            pipeline_debug!("Cache hit for {}", key.key);
            return Ok(ItemOutcome::Skipped);
        }

        let options = config.mirror_fetch_options();
        let response = self.fetcher.fetch(url, &options, sink).await?;
        if !response.is_success() {
            pipeline_warn!("Download of {} returned status {}", url, response.status);
            return Ok(ItemOutcome::Failed);
        }

        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());
        let expires_at = Utc::now()
            .checked_add_signed(config.cache_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let options = PutOptions {
            content_type,
            cache_control_max_age_seconds: config.cache_max_age_seconds,
            metadata: CacheMetadata {
                expires_at,
                original_url: url.to_string(),
                extension: key.inferred_extension.clone(),
            },
        };
        self.store
            .put(&key.key, Bytes::from(response.bytes), options)
            .await?;
        pipeline_debug!("Uploaded {} as {}", url, key.key);
        Ok(ItemOutcome::Uploaded)
    }
}
