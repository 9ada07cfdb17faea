use std::sync::{Arc, Mutex};

use mirror_engine::{
    ConversionError, ConversionErrorKind, ConversionService, FetchSettings, Html2MdConversion,
    MirrorConfig, MirrorJob, MirrorScheduler, NamedBlob, NullProgressSink, Pipeline,
    PipelineError, ReqwestFetcher,
};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Converter that records its input and answers with a fixed result.
struct StaticConversion {
    reply: Result<String, ConversionError>,
    seen: Mutex<Vec<NamedBlob>>,
}

impl StaticConversion {
    fn new(reply: Result<String, ConversionError>) -> Self {
        Self {
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl ConversionService for StaticConversion {
    async fn convert(&self, blob: NamedBlob) -> Result<String, ConversionError> {
        self.seen.lock().unwrap().push(blob);
        self.reply.clone()
    }
}

#[derive(Default)]
struct RecordingScheduler {
    jobs: Mutex<Vec<MirrorJob>>,
}

impl MirrorScheduler for RecordingScheduler {
    fn schedule(&self, job: MirrorJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

struct Harness {
    pipeline: Pipeline,
    converter: Arc<StaticConversion>,
    scheduler: Arc<RecordingScheduler>,
}

fn harness(reply: Result<String, ConversionError>) -> Harness {
    let fetcher = Arc::new(ReqwestFetcher::new(FetchSettings::default()).expect("client"));
    let converter = Arc::new(StaticConversion::new(reply));
    let scheduler = Arc::new(RecordingScheduler::default());
    let pipeline = Pipeline::new(fetcher, converter.clone(), scheduler.clone());
    Harness {
        pipeline,
        converter,
        scheduler,
    }
}

fn local_config(public_base_url: Option<&str>) -> MirrorConfig {
    MirrorConfig {
        allowed_hosts: vec!["127.0.0.1".to_string()],
        fetch_base_delay_ms: 5,
        public_base_url: public_base_url.map(str::to_string),
        ..MirrorConfig::default()
    }
}

async fn serve_article(server: &MockServer) -> String {
    let image = format!("{}/mmbiz_png/a/1?wx_fmt=png&amp;tp=webp", server.uri());
    let html = format!(
        r#"<html><body><img data-src="{image}"><img src="https://example.com/x.png"></body></html>"#
    );
    Mock::given(method("GET"))
        .and(path("/s/article"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html; charset=utf-8"))
        .mount(server)
        .await;
    image
}

#[tokio::test]
async fn rewrites_media_and_schedules_mirror() {
    pipeline_logging::initialize_for_tests();
    let server = MockServer::start().await;
    let image = serve_article(&server).await;
    let markdown = format!("![a]({image}) ![b](https://example.com/x.png)");
    let h = harness(Ok(markdown));

    let url = format!("{}/s/article", server.uri());
    let output = h
        .pipeline
        .run(&url, &local_config(Some("https://cdn.example/pub")), &NullProgressSink)
        .await
        .expect("pipeline ok");

    assert_eq!(
        output.text,
        "![a](https://cdn.example/pub/127_0_0_1/mmbiz_png/a/1.png) ![b](https://example.com/x.png)"
    );
    assert_eq!(output.media_urls, vec![image.clone()]);
    assert_eq!(output.mirror_job, Some(1));

    let jobs = h.scheduler.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].urls, vec![image]);
    assert_eq!(jobs[0].config.allowed_hosts, vec!["127.0.0.1".to_string()]);

    let seen = h.converter.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].media_type, "text/html; charset=utf-8");
    assert!(seen[0].name.starts_with("article--"), "{}", seen[0].name);
    assert!(seen[0].name.ends_with(".html"));
}

#[tokio::test]
async fn mirroring_is_skipped_without_public_base_url() {
    let server = MockServer::start().await;
    let image = serve_article(&server).await;
    let markdown = format!("![a]({image})");
    let h = harness(Ok(markdown.clone()));

    let url = format!("{}/s/article", server.uri());
    let output = h
        .pipeline
        .run(&url, &local_config(None), &NullProgressSink)
        .await
        .expect("pipeline ok");

    assert_eq!(output.text, markdown);
    assert!(output.media_urls.is_empty());
    assert_eq!(output.mirror_job, None);
    assert!(h.scheduler.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn document_status_failure_aborts_before_conversion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;
    let h = harness(Ok(String::new()));

    let url = format!("{}/gone", server.uri());
    let err = h
        .pipeline
        .run(&url, &local_config(Some("https://cdn.example/pub")), &NullProgressSink)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::HttpStatus {
            status: 410,
            attempts: 1
        }
    ));
    assert!(h.converter.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn conversion_failure_kind_is_passed_upward() {
    let server = MockServer::start().await;
    serve_article(&server).await;
    let failure = ConversionError::new(
        ConversionErrorKind::Service("unsupported_format".into()),
        "cannot read this document",
    );
    let h = harness(Err(failure.clone()));

    let url = format!("{}/s/article", server.uri());
    let err = h
        .pipeline
        .run(&url, &local_config(Some("https://cdn.example/pub")), &NullProgressSink)
        .await
        .unwrap_err();

    match err {
        PipelineError::Conversion(inner) => assert_eq!(inner, failure),
        other => panic!("unexpected error {other}"),
    }
    assert!(h.scheduler.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn converted_markdown_with_linked_and_adjacent_images_is_rewritten_cleanly() {
    let server = MockServer::start().await;
    let linked = format!("{}/a/1?wx_fmt=png", server.uri());
    let first = format!("{}/b/2", server.uri());
    let second = format!("{}/c/3#imgIndex=0", server.uri());
    let html = format!(
        r#"<html><body><a href="https://example.com/post"><img src="{linked}"></a><img src="{first}"><img src="{second}"></body></html>"#
    );
    Mock::given(method("GET"))
        .and(path("/s/gallery"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html"))
        .mount(&server)
        .await;

    let fetcher = Arc::new(ReqwestFetcher::new(FetchSettings::default()).expect("client"));
    let scheduler = Arc::new(RecordingScheduler::default());
    let pipeline = Pipeline::new(fetcher, Arc::new(Html2MdConversion), scheduler.clone());

    let url = format!("{}/s/gallery", server.uri());
    let output = pipeline
        .run(&url, &local_config(Some("https://cdn.example/pub")), &NullProgressSink)
        .await
        .expect("pipeline ok");

    assert_eq!(
        output.text,
        "[![](https://cdn.example/pub/127_0_0_1/a/1.png)](https://example.com/post)\
         ![](https://cdn.example/pub/127_0_0_1/b/2.jpg)\
         ![](https://cdn.example/pub/127_0_0_1/c/3.jpg)"
    );
    assert_eq!(output.media_urls, vec![linked.clone(), first.clone(), second.clone()]);
    let jobs = scheduler.jobs.lock().unwrap();
    assert_eq!(jobs[0].urls, vec![linked, first, second]);
}
