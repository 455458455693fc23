//! HTTP tuner sources, served by a wiremock upstream.

mod common;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{h264_stream, CountingResolver, TestServer};

#[tokio::test]
async fn http_source_is_repackaged() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auto/v2.1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/MP2T")
                .set_body_bytes(h264_stream(100, 25, 0)),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let resolver = CountingResolver::new();
    resolver.insert("news", format!("{}/auto/v2.1", upstream.uri()));
    let server = TestServer::start(resolver).await;

    let resp = reqwest::get(server.url("/channel/news.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let playlist = resp.text().await.unwrap();
    assert!(playlist.contains("#EXTINF:"), "{playlist}");

    server.shutdown().await;
    upstream.verify().await;
}

#[tokio::test]
async fn upstream_error_status_is_503() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&upstream)
        .await;

    let resolver = CountingResolver::new();
    resolver.insert("busy", format!("{}/auto/v7", upstream.uri()));
    let server = TestServer::start(resolver).await;

    // The tuner refused; the session exists but has no playlist.
    let resp = reqwest::get(server.url("/channel/busy.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 503);

    let stats = server
        .sessions
        .get(&common::channel("busy"))
        .unwrap()
        .stats();
    assert!(matches!(stats.state, th_server::PipelineState::Failed(_)));

    server.shutdown().await;
}
