use std::time::Duration;

use futures_util::StreamExt;
use pipeline_logging::{pipeline_debug, pipeline_warn};
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE,
    REFERER, USER_AGENT,
};
use reqwest::Url;

use crate::{EngineEvent, FailureKind, FetchError, FetchResponse, RetryCause};

/// Statuses that are worth another attempt while attempts remain.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";

/// Client-wide settings, fixed for the lifetime of a [`ReqwestFetcher`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub redirect_limit: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            redirect_limit: 5,
        }
    }
}

/// Per-call settings for one logical fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Bound on each attempt, body included.
    pub timeout: Duration,
    /// Overrides the origin-derived `Referer`.
    pub referer: Option<String>,
    /// Merged over the browser-like defaults; later entries win.
    pub headers: Vec<(String, String)>,
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(800),
            timeout: Duration::from_millis(15_000),
            referer: None,
            headers: Vec::new(),
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

pub struct ChannelProgressSink {
    tx: std::sync::mpsc::Sender<EngineEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: std::sync::mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Discards events; retries are still logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: EngineEvent) {}
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform one logical GET.
    ///
    /// Retryable statuses that persist through the last attempt come back as
    /// `Ok` with that status; transport failures that persist come back as `Err`.
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

enum AttemptOutcome {
    Done(FetchResponse),
    RetryableStatus(u16),
}

impl ReqwestFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(settings.redirect_limit))
            .build()
            .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))?;
        Ok(Self { client })
    }

    async fn attempt(
        &self,
        url: &Url,
        headers: &HeaderMap,
        options: &FetchOptions,
        is_last: bool,
    ) -> Result<AttemptOutcome, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .timeout(options.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        if !is_last && is_retryable_status(status) {
            return Ok(AttemptOutcome::RetryableStatus(status));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > options.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: options.max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > options.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: options.max_bytes,
                        actual: Some(next_len),
                    },
                    "response too large",
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(AttemptOutcome::Done(FetchResponse {
            status,
            final_url,
            content_type,
            bytes,
            attempts: 0,
        }))
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResponse, FetchError> {
        let parsed =
            Url::parse(url).map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let headers = build_headers(&parsed, options)?;
        let max_attempts = options.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let is_last = attempt >= max_attempts;
            let (cause, detail) = match self.attempt(&parsed, &headers, options, is_last).await {
                Ok(AttemptOutcome::Done(mut response)) => {
                    response.attempts = attempt;
                    pipeline_debug!(
                        "GET {} -> {} after {} attempt(s)",
                        url,
                        response.status,
                        attempt
                    );
                    return Ok(response);
                }
                Ok(AttemptOutcome::RetryableStatus(status)) => {
                    (RetryCause::Status(status), format!("status {status}"))
                }
                Err(err) if !is_last && err.kind.is_transient() => {
                    let detail = err.to_string();
                    (RetryCause::Failure(err.kind), detail)
                }
                Err(err) => return Err(err),
            };

            let delay = backoff_delay(options.base_delay, attempt);
            pipeline_warn!(
                "GET {} attempt {}/{} failed ({}), retrying in {} ms",
                url,
                attempt,
                max_attempts,
                detail,
                delay.as_millis()
            );
            sink.emit(EngineEvent::Retry {
                url: url.to_string(),
                attempt,
                max_attempts,
                delay,
                cause,
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// `base * 2^(attempt-1)`, scaled by a uniform jitter factor in `[0.5, 1.0]`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    base.mul_f64(2f64.powi(exponent) * jitter)
}

fn build_headers(url: &Url, options: &FetchOptions) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let referer = match options.referer.as_deref() {
        Some(referer) => Some(referer.to_string()),
        None => origin_referer(url),
    };
    if let Some(referer) = referer {
        headers.insert(REFERER, header_value(REFERER.as_str(), &referer)?);
    }

    for (name, value) in &options.headers {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            FetchError::new(
                FailureKind::InvalidHeader,
                format!("header name {name:?}: {err}"),
            )
        })?;
        headers.insert(header, header_value(name, value)?);
    }
    Ok(headers)
}

fn origin_referer(url: &Url) -> Option<String> {
    let origin = url.origin();
    origin
        .is_tuple()
        .then(|| format!("{}/", origin.ascii_serialization()))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(value).map_err(|err| {
        FetchError::new(
            FailureKind::InvalidHeader,
            format!("value of header {name:?}: {err}"),
        )
    })
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}
