//! The cache and instrumentation wrappers over a real upstream connection

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use portico_common::{MetricsSink, PrometheusSink};
use portico_proxy::transport::{ResponseBody, CACHE_HEADER, CACHE_HIT};
use portico_proxy::{
    Forwarder, Instrumented, PathNormalizer, ResponseCache, Transport, UpstreamTransport,
};
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Stack = ResponseCache<Instrumented<UpstreamTransport>>;

fn stack(sink: &Arc<PrometheusSink>) -> Stack {
    let metrics: Arc<dyn MetricsSink> = sink.clone();
    let normalizer = Arc::new(PathNormalizer::new("", false, Vec::new()).unwrap());
    let upstream = UpstreamTransport::new(false).unwrap();
    ResponseCache::new(
        Instrumented::new(upstream, normalizer, metrics.clone()),
        1 << 20,
        metrics,
    )
}

fn get(url: String) -> Request<Bytes> {
    Request::builder().uri(url).body(Bytes::new()).unwrap()
}

async fn body_of(response: http::Response<ResponseBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_static_asset_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/static/app.css"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("body { margin: 0 }", "text/css"))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(PrometheusSink::new().unwrap());
    let stack = stack(&sink);
    let url = format!("{}/static/app.css", server.uri());

    let first = stack.round_trip(get(url.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get(CACHE_HEADER).is_none());
    let first_body = body_of(first).await;

    let second = stack.round_trip(get(url)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get(CACHE_HEADER).unwrap(), CACHE_HIT);
    assert_eq!(body_of(second).await, first_body);

    let text = sink.gather_text();
    assert!(text.contains("cache_requests_total 2"), "{text}");
    assert!(text.contains("cache_hits_total 1"), "{text}");
    assert!(
        text.contains(r#"http_requests_total{method="GET",path="/static/app.css",status="2xx"} 1"#),
        "{text}"
    );
}

#[tokio::test]
async fn test_html_reaches_upstream_every_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<h1>hi</h1>", "text/html"))
        .expect(2)
        .mount(&server)
        .await;

    let sink = Arc::new(PrometheusSink::new().unwrap());
    let stack = stack(&sink);
    let url = format!("{}/index.html", server.uri());

    for _ in 0..2 {
        let response = stack.round_trip(get(url.clone())).await.unwrap();
        assert!(response.headers().get(CACHE_HEADER).is_none());
        assert_eq!(body_of(response).await, Bytes::from_static(b"<h1>hi</h1>"));
    }
    assert!(!sink.gather_text().contains("cache_hits_total 1"));
}

#[tokio::test]
async fn test_error_status_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/42.png"))
        .respond_with(ResponseTemplate::new(404).set_body_raw("", "image/png"))
        .expect(2)
        .mount(&server)
        .await;

    let sink = Arc::new(PrometheusSink::new().unwrap());
    let stack = stack(&sink);
    let url = format!("{}/img/42.png", server.uri());

    for _ in 0..2 {
        let response = stack.round_trip(get(url.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert!(sink
        .gather_text()
        .contains(r#"http_requests_total{method="GET",path="/img/_.png",status="4xx"} 2"#));
}

#[tokio::test]
async fn test_unreachable_upstream_is_an_error() {
    let sink = Arc::new(PrometheusSink::new().unwrap());
    let stack = stack(&sink);

    let result = stack.round_trip(get("http://127.0.0.1:1/app.js".to_string())).await;
    assert!(result.is_err());
    assert!(!sink.gather_text().contains("http_requests_total{"));
}

#[tokio::test]
async fn test_forwarder_rewrites_onto_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/base/orders"))
        .and(query_param("page", "2"))
        .and(header("x-forwarded-proto", "https"))
        .and(header("x-forwarded-for", "192.0.2.10"))
        .respond_with(ResponseTemplate::new(201).set_body_raw("{}", "application/json"))
        .expect(1)
        .mount(&server)
        .await;

    let upstream = Url::parse(&format!("{}/base", server.uri())).unwrap();
    let forwarder = Forwarder::new(upstream, UpstreamTransport::new(false).unwrap());

    let request = Request::builder()
        .method("POST")
        .uri("/orders?page=2")
        .header("connection", "keep-alive")
        .body(Full::new(Bytes::from_static(b"{\"id\":1}")))
        .unwrap();
    let response = forwarder
        .forward(request, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
}
