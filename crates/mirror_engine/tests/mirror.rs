use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use mirror_engine::{
    derive_key, BatchStats, CacheMetadata, FetchSettings, MediaMirror, MemoryObjectStore,
    MirrorConfig, NullProgressSink, ObjectStore, PutOptions, ReqwestFetcher, StoreError,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Memory store that records peak concurrent existence probes and can fail writes.
#[derive(Default)]
struct TrackingStore {
    inner: MemoryObjectStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    probes: AtomicUsize,
    fail_puts_containing: Option<String>,
}

impl TrackingStore {
    fn failing_on(fragment: &str) -> Self {
        Self {
            fail_puts_containing: Some(fragment.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for TrackingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.exists(key).await
    }

    async fn put(&self, key: &str, bytes: Bytes, options: PutOptions) -> Result<(), StoreError> {
        if let Some(fragment) = &self.fail_puts_containing {
            if key.contains(fragment.as_str()) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
        }
        self.inner.put(key, bytes, options).await
    }
}

fn local_config() -> MirrorConfig {
    MirrorConfig {
        allowed_hosts: vec!["127.0.0.1".to_string()],
        fetch_base_delay_ms: 5,
        mirror_timeout_ms: 2_000,
        public_base_url: Some("https://cdn.example/pub".to_string()),
        ..MirrorConfig::default()
    }
}

fn mirror_with(store: Arc<dyn ObjectStore>) -> MediaMirror {
    let fetcher = ReqwestFetcher::new(FetchSettings::default()).expect("client");
    MediaMirror::new(Arc::new(fetcher), store)
}

fn seed_options(url: &str) -> PutOptions {
    PutOptions {
        content_type: "image/png".to_string(),
        cache_control_max_age_seconds: 60,
        metadata: CacheMetadata {
            expires_at: Utc::now(),
            original_url: url.to_string(),
            extension: "png".to_string(),
        },
    }
}

#[tokio::test]
async fn twelve_urls_run_in_windows_of_five() {
    pipeline_logging::initialize_for_tests();
    let server = MockServer::start().await;
    for i in 0..9 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![i as u8; 4], "image/png"))
            .expect(1)
            .mount(&server)
            .await;
    }
    for i in 9..11 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/img/11"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = local_config();
    let urls: Vec<String> = (0..12).map(|i| format!("{}/img/{i}", server.uri())).collect();

    let store = Arc::new(TrackingStore::default());
    for url in &urls[9..11] {
        let key = derive_key(url, &config.allowed_hosts).unwrap();
        store
            .inner
            .put(&key.key, Bytes::from_static(b"cached"), seed_options(url))
            .await
            .unwrap();
    }

    let stats = mirror_with(store.clone())
        .mirror(&urls, &config, &NullProgressSink)
        .await;

    assert_eq!(
        stats,
        BatchStats {
            uploaded: 9,
            skipped: 2,
            failed: 1
        }
    );
    assert_eq!(stats.total(), 12);
    assert_eq!(store.probes.load(Ordering::SeqCst), 12);
    let peak = store.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak concurrency {peak}");
    assert!(peak > 1, "windows should run items concurrently");
    assert_eq!(store.inner.len(), 11);
}

#[tokio::test]
async fn uploads_carry_content_type_cache_control_and_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mmbiz_png/a/640"))
        .and(header("referer", "https://mp.weixin.qq.com/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![9u8; 8], "image/png"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/plain/b"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 3]))
        .mount(&server)
        .await;

    let config = local_config();
    let store = Arc::new(MemoryObjectStore::new());
    let first = format!("{}/mmbiz_png/a/640", server.uri());
    let second = format!("{}/plain/b", server.uri());
    let before = Utc::now();

    let stats = mirror_with(store.clone())
        .mirror(&[first.clone(), second.clone()], &config, &NullProgressSink)
        .await;
    assert_eq!(stats.uploaded, 2, "{stats}");

    let object = store.get("127_0_0_1/mmbiz_png/a/640.png").expect("png stored");
    assert_eq!(object.bytes, Bytes::from(vec![9u8; 8]));
    assert_eq!(object.options.content_type, "image/png");
    assert_eq!(object.options.cache_control(), "public, max-age=28800");
    assert_eq!(object.options.metadata.original_url, first);
    assert_eq!(object.options.metadata.extension, "png");
    let ttl = object.options.metadata.expires_at - before;
    assert!(ttl >= chrono::Duration::hours(8));
    assert!(ttl < chrono::Duration::hours(8) + chrono::Duration::minutes(1));

    let object = store.get("127_0_0_1/plain/b.jpg").expect("jpg stored");
    assert_eq!(object.options.content_type, "image/jpeg");
    assert_eq!(object.options.metadata.extension, "jpg");
}

#[tokio::test]
async fn disallowed_and_duplicate_urls_are_skipped_without_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1u8], "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let config = local_config();
    let store = Arc::new(MemoryObjectStore::new());
    let urls = vec![
        format!("{}/img/1?wx_fmt=png", server.uri()),
        format!("{}/img/1?wx_fmt=png&tp=webp", server.uri()),
        "https://example.com/img/2.png".to_string(),
    ];

    let stats = mirror_with(store.clone())
        .mirror(&urls, &config, &NullProgressSink)
        .await;
    assert_eq!(
        stats,
        BatchStats {
            uploaded: 1,
            skipped: 2,
            failed: 0
        }
    );
    assert_eq!(store.keys(), vec!["127_0_0_1/img/1.png".to_string()]);
}

#[tokio::test]
async fn store_failure_is_isolated_to_its_item() {
    let server = MockServer::start().await;
    for name in ["good-a", "bad", "good-b"] {
        Mock::given(method("GET"))
            .and(path(format!("/img/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1u8], "image/gif"))
            .mount(&server)
            .await;
    }

    let config = local_config();
    let store = Arc::new(TrackingStore::failing_on("bad"));
    let urls: Vec<String> = ["good-a", "bad", "good-b"]
        .iter()
        .map(|name| format!("{}/img/{name}", server.uri()))
        .collect();

    let stats = mirror_with(store.clone())
        .mirror(&urls, &config, &NullProgressSink)
        .await;
    assert_eq!(
        stats,
        BatchStats {
            uploaded: 2,
            skipped: 0,
            failed: 1
        }
    );
    assert_eq!(store.inner.len(), 2);
}

#[tokio::test]
async fn transient_download_failures_use_the_reduced_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/flaky"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let config = local_config();
    let store = Arc::new(MemoryObjectStore::new());
    let stats = mirror_with(store.clone())
        .mirror(&[format!("{}/img/flaky", server.uri())], &config, &NullProgressSink)
        .await;
    assert_eq!(stats.failed, 1);
    assert!(store.is_empty());
}
