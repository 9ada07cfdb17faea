//! Mirror engine: resilient fetching, media mirroring and link rewriting.
mod config;
mod convert;
mod engine;
mod extract;
mod fetch;
mod key;
mod mirror;
mod pipeline;
mod rewrite;
mod store;
mod types;

pub use config::{ConfigError, MirrorConfig, DEFAULT_ALLOWED_HOST, DEFAULT_MIRROR_REFERER};
pub use convert::{
    blob_name, essence, ConversionError, ConversionErrorKind, ConversionService, Html2MdConversion,
    HttpConversionService, NamedBlob,
};
pub use engine::{EngineError, EngineHandle, MirrorJob, MirrorScheduler};
pub use extract::{ReferenceExtractor, RegexReferenceExtractor};
pub use fetch::{
    backoff_delay, is_retryable_status, ChannelProgressSink, FetchOptions, FetchSettings, Fetcher,
    NullProgressSink, ProgressSink, ReqwestFetcher, RETRYABLE_STATUSES,
};
pub use key::{derive_key, host_is_allowed, CacheKey};
pub use mirror::{MediaMirror, MirrorError};
pub use pipeline::{Pipeline, PipelineError, PipelineOutput};
pub use rewrite::rewrite;
pub use store::{
    validate_key, CacheMetadata, FsObjectStore, MemoryObjectStore, ObjectStore, PutOptions,
    StoreError, StoredObject,
};
pub use types::{
    BatchStats, EngineEvent, FailureKind, FetchError, FetchResponse, JobId, RetryCause,
};
