use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pipeline_logging::{pipeline_debug, pipeline_info};

use crate::config::MirrorConfig;
use crate::convert::{blob_name, ConversionError, ConversionService, NamedBlob};
use crate::engine::{MirrorJob, MirrorScheduler};
use crate::extract::{ReferenceExtractor, RegexReferenceExtractor};
use crate::fetch::{Fetcher, ProgressSink};
use crate::key::derive_key;
use crate::rewrite::rewrite;
use crate::{FetchError, JobId};

const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("document fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("document fetch returned http status {status} after {attempts} attempt(s)")]
    HttpStatus { status: u16, attempts: u32 },
    #[error("document conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    /// Converted text, with mirrored media already pointing at the public store.
    pub text: String,
    pub final_url: String,
    pub media_type: String,
    /// Media URLs handed to the background mirror.
    pub media_urls: Vec<String>,
    pub mirror_job: Option<JobId>,
}

/// Fetch → convert → rewrite, with media mirroring handed off to a scheduler.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    converter: Arc<dyn ConversionService>,
    scheduler: Arc<dyn MirrorScheduler>,
    next_job: AtomicU64,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        converter: Arc<dyn ConversionService>,
        scheduler: Arc<dyn MirrorScheduler>,
    ) -> Self {
        Self {
            fetcher,
            converter,
            scheduler,
            next_job: AtomicU64::new(1),
        }
    }

    /// Run the pipeline for one document.
    ///
    /// Document fetch and conversion failures abort the run. Media mirroring is
    /// scheduled and not awaited, so its failures never surface here.
    pub async fn run(
        &self,
        url: &str,
        config: &MirrorConfig,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineOutput, PipelineError> {
        let response = self
            .fetcher
            .fetch(url, &config.document_fetch_options(), sink)
            .await?;
        if !response.is_success() {
            return Err(PipelineError::HttpStatus {
                status: response.status,
                attempts: response.attempts,
            });
        }

        let media_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_string());
        let mirroring = config.mirroring_enabled();
        let raw_markup = mirroring.then(|| String::from_utf8_lossy(&response.bytes).into_owned());

        let blob = NamedBlob {
            name: blob_name(&response.final_url, &media_type),
            bytes: response.bytes,
            media_type: media_type.clone(),
        };
        pipeline_debug!("Converting {} ({}, {} bytes)", blob.name, blob.media_type, blob.bytes.len());
        let text = self.converter.convert(blob).await?;

        let mut output = PipelineOutput {
            text,
            final_url: response.final_url,
            media_type,
            media_urls: Vec::new(),
            mirror_job: None,
        };

        let (Some(raw_markup), Some(base)) = (raw_markup, config.public_base_url.as_deref()) else {
            return Ok(output);
        };

        let extractor = RegexReferenceExtractor::new(&config.allowed_hosts);
        let media_urls: Vec<String> = extractor
            .collect_references(&raw_markup, &output.text)
            .into_iter()
            .filter(|media_url| derive_key(media_url, &config.allowed_hosts).is_some())
            .collect();
        if media_urls.is_empty() {
            return Ok(output);
        }

        output.text = rewrite(&output.text, &media_urls, base, &config.allowed_hosts);

        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        pipeline_info!(
            "Scheduling mirror job {} for {} media url(s) from {}",
            job_id,
            media_urls.len(),
            url
        );
        self.scheduler.schedule(MirrorJob {
            job_id,
            urls: media_urls.clone(),
            config: config.clone(),
        });
        output.media_urls = media_urls;
        output.mirror_job = Some(job_id);
        Ok(output)
    }
}
