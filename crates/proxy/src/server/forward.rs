//! Single-host request forwarding

use std::collections::HashSet;
use std::net::IpAddr;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use http::uri::InvalidUri;
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use tracing::{debug, trace, warn};
use url::{Position, Url};

use crate::transport::{full_body, BoxError, ResponseBody, Transport};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body buffered for the upstream (32 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 << 20;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Rewrites inbound requests onto the upstream and relays the answer
pub struct Forwarder<T> {
    upstream: Url,
    transport: T,
    max_body_bytes: usize,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(upstream: Url, transport: T) -> Self {
        Self {
            upstream,
            transport,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Reject request bodies larger than `max_body_bytes` with `413`
    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Upstream URI for an inbound request URI
    ///
    /// The upstream base path is joined with the request path and both
    /// query strings are kept.
    pub fn upstream_uri(&self, uri: &Uri) -> Result<Uri, InvalidUri> {
        let path = join_path(self.upstream.path(), uri.path());
        let query = match (self.upstream.query(), uri.query()) {
            (Some(base), Some(extra)) if !base.is_empty() && !extra.is_empty() => {
                Some(format!("{base}&{extra}"))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_string()),
            (_, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
            _ => None,
        };

        let origin = &self.upstream[..Position::BeforePath];
        let target = match query {
            Some(query) => format!("{origin}{path}?{query}"),
            None => format!("{origin}{path}"),
        };
        target.parse()
    }

    /// Forward one request; transport failures become `502 Bad Gateway`
    ///
    /// Bodies over the limit are answered with `413 Payload Too Large`
    /// without contacting the upstream.
    pub async fn forward<B>(&self, request: Request<B>, client: IpAddr) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();

        let uri = match self.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "Failed to build upstream URI");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                debug!(limit = self.max_body_bytes, "Request body too large");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        let mut headers = without_hop_by_hop(&parts.headers);
        append_forwarded_headers(&mut headers, client, host.as_deref());

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;
        trace!(method = %outbound.method(), uri = %outbound.uri(), "Forwarding request");

        match self.transport.round_trip(outbound).await {
            Ok(mut response) => {
                let headers = without_hop_by_hop(response.headers());
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                warn!(error = %e, "Upstream request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Copy of `headers` without hop-by-hop headers or those named in `Connection`
fn without_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut blocked: HashSet<HeaderName> = HOP_BY_HOP_HEADERS
        .iter()
        .copied()
        .map(HeaderName::from_static)
        .collect();
    for value in headers.get_all(CONNECTION) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.to_ascii_lowercase().as_bytes()) {
                blocked.insert(name);
            }
        }
    }

    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !blocked.contains(name) {
            kept.append(name.clone(), value.clone());
        }
    }
    kept
}

fn append_forwarded_headers(headers: &mut HeaderMap, client: IpAddr, host: Option<&str>) {
    let client = client.to_string();
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{}, {client}", prior.trim()),
        _ => client,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(value) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use http_body_util::Full;
    use parking_lot::Mutex;

    use crate::transport::TransportError;

    /// Remembers the last request and answers 200, or fails
    #[derive(Default)]
    struct CapturingTransport {
        last: Mutex<Option<Request<Bytes>>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn round_trip(
            &self,
            request: Request<Bytes>,
        ) -> Result<Response<ResponseBody>, TransportError> {
            *self.last.lock() = Some(request);
            if self.fail {
                return Err(TransportError::Body("refused".into()));
            }
            Ok(Response::builder()
                .header("connection", "close")
                .header("x-upstream", "yes")
                .body(full_body("ok"))
                .unwrap())
        }
    }

    fn forwarder(base: &str, fail: bool) -> Forwarder<Arc<CapturingTransport>> {
        let transport = Arc::new(CapturingTransport {
            fail,
            ..Default::default()
        });
        Forwarder::new(Url::parse(base).unwrap(), transport)
    }

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "/a"), "/a");
        assert_eq!(join_path("/base", "/a"), "/base/a");
        assert_eq!(join_path("/base/", "/a"), "/base/a");
        assert_eq!(join_path("/base", "a"), "/base/a");
    }

    #[test]
    fn test_upstream_uri() {
        let f = forwarder("http://backend:8080", false);
        let uri = f.upstream_uri(&"/rest/api/1?x=1".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://backend:8080/rest/api/1?x=1");

        let f = forwarder("https://backend/app?token=abc", false);
        let uri = f.upstream_uri(&"/page?x=1".parse().unwrap()).unwrap();
        assert_eq!(uri, "https://backend/app/page?token=abc&x=1");

        let uri = f.upstream_uri(&"/page".parse().unwrap()).unwrap();
        assert_eq!(uri, "https://backend/app/page?token=abc");
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let kept = without_hop_by_hop(&headers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        append_forwarded_headers(&mut headers, client(), Some("example.com"));

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "198.51.100.1, 203.0.113.7");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[tokio::test]
    async fn test_forward_rewrites_request() {
        let f = forwarder("http://backend:8080/base", false);
        let request = Request::builder()
            .method("POST")
            .uri("/items?page=2")
            .header("host", "example.com")
            .header("proxy-authorization", "secret")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();

        let response = f.forward(request, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");

        let sent = f.transport.last.lock().take().unwrap();
        assert_eq!(sent.method(), "POST");
        assert_eq!(sent.uri(), "http://backend:8080/base/items?page=2");
        assert_eq!(sent.body().as_ref(), b"payload");
        assert_eq!(sent.headers().get("host").unwrap(), "example.com");
        assert_eq!(sent.headers().get("x-forwarded-host").unwrap(), "example.com");
        assert_eq!(sent.headers().get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert!(sent.headers().get("proxy-authorization").is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let f = forwarder("http://backend", false).with_body_limit(8);
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Full::new(Bytes::from_static(b"0123456789")))
            .unwrap();

        let response = f.forward(request, client()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(f.transport.last.lock().is_none());

        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Full::new(Bytes::from_static(b"01234567")))
            .unwrap();
        let response = f.forward(request, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let f = forwarder("http://backend", true);
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = f.forward(request, client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
