//! Command-line entry point: convert one document and mirror its media.
//!
//! Usage: `mirror_app <url> [config.ron]`

mod app_config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use mirror_engine::{
    ConversionService, EngineEvent, EngineHandle, FetchSettings, FsObjectStore, Html2MdConversion,
    HttpConversionService, MediaMirror, NullProgressSink, Pipeline, ReqwestFetcher,
};
use pipeline_logging::{pipeline_error, pipeline_info, LogDestination};

use crate::app_config::{load_app_config, AppConfig, DEFAULT_CONFIG_FILE};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: mirror_app <url> [config.ron]");
        return ExitCode::from(2);
    };
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let config = match load_app_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    pipeline_logging::initialize(LogDestination::Both, config.level_filter());

    match run(&url, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            pipeline_error!("{:#}", err);
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(url: &str, config: &AppConfig) -> anyhow::Result<()> {
    let fetcher = Arc::new(
        ReqwestFetcher::new(FetchSettings::default()).context("failed to build http client")?,
    );
    let store = Arc::new(FsObjectStore::new(config.store_root.clone()));
    let engine = Arc::new(
        EngineHandle::new(MediaMirror::new(fetcher.clone(), store))
            .context("failed to start mirror worker")?,
    );
    let converter: Arc<dyn ConversionService> = match &config.conversion_endpoint {
        Some(endpoint) => Arc::new(
            HttpConversionService::new(endpoint, config.conversion_timeout())
                .context("failed to build conversion client")?,
        ),
        None => Arc::new(Html2MdConversion),
    };
    let pipeline = Pipeline::new(fetcher, converter, engine.clone());

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let outcome = runtime.block_on(pipeline.run(url, &config.mirror, &NullProgressSink));

    // Media mirroring keeps running after the text is ready; wait for it before exiting.
    let events = engine.shutdown();
    report(&events);

    let output = outcome.with_context(|| format!("failed to process {url}"))?;
    pipeline_info!(
        "Converted {} ({}), {} media url(s) scheduled",
        output.final_url,
        output.media_type,
        output.media_urls.len()
    );
    println!("{}", output.text);
    Ok(())
}

fn report(events: &[EngineEvent]) {
    for event in events {
        match event {
            EngineEvent::MirrorCompleted { job_id, stats } => {
                pipeline_info!("Mirror job {} finished: {}", job_id, stats);
            }
            EngineEvent::Retry { .. } => {}
        }
    }
}
