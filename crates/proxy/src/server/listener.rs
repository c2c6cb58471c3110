//! Accept loops for the three listeners

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use portico_common::PrometheusSink;
use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use super::forward::Forwarder;
use crate::acme::ChallengeResponder;
use crate::transport::{ResponseBody, Transport};

/// Pause after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Prometheus text exposition format
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// TLS settings whose certificates come from `resolver` during the handshake
pub fn tls_config(resolver: Arc<dyn ResolvesServerCert>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn boxed(body: Full<Bytes>) -> ResponseBody {
    body.map_err(|never| match never {}).boxed()
}

async fn accept(listener: &TcpListener) -> Option<(tokio::net::TcpStream, SocketAddr)> {
    match listener.accept().await {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            warn!(error = %e, "Failed to accept connection");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

async fn serve_connection<I, F, Fut>(io: I, peer: SocketAddr, handler: F)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<ResponseBody>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let service = service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler(request).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

/// Terminate TLS and forward every request upstream
pub async fn serve_https<T>(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    forwarder: Arc<Forwarder<T>>,
) -> io::Result<()>
where
    T: Transport + 'static,
{
    let acceptor = TlsAcceptor::from(tls);
    info!(address = %listener.local_addr()?, "HTTPS listener started");

    loop {
        let Some((stream, peer)) = accept(&listener).await else {
            continue;
        };
        let acceptor = acceptor.clone();
        let forwarder = forwarder.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            trace!(peer = %peer, "TLS handshake complete");

            serve_connection(stream, peer, move |request| {
                let forwarder = forwarder.clone();
                async move { forwarder.forward(request, peer.ip()).await }
            })
            .await;
        });
    }
}

/// Answer HTTP-01 challenges and redirect everything else to HTTPS
pub async fn serve_challenges(listener: TcpListener, responder: ChallengeResponder) -> io::Result<()> {
    info!(address = %listener.local_addr()?, "HTTP challenge listener started");

    loop {
        let Some((stream, peer)) = accept(&listener).await else {
            continue;
        };
        let responder = responder.clone();

        tokio::spawn(serve_connection(stream, peer, move |request| {
            let response = responder.respond(&request).map(boxed);
            async move { response }
        }));
    }
}

/// Expose `/metrics` in the Prometheus text format
pub async fn serve_metrics(listener: TcpListener, sink: Arc<PrometheusSink>) -> io::Result<()> {
    info!(address = %listener.local_addr()?, "Metrics listener started");

    loop {
        let Some((stream, peer)) = accept(&listener).await else {
            continue;
        };
        let sink = sink.clone();

        tokio::spawn(serve_connection(stream, peer, move |request| {
            let response = metrics_response(&request, &sink).map(boxed);
            async move { response }
        }));
    }
}

fn metrics_response<B>(request: &Request<B>, sink: &PrometheusSink) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    if request.uri().path() != "/metrics" {
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    *response.body_mut() = Full::new(Bytes::from(sink.gather_text()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(METRICS_CONTENT_TYPE),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_common::{MetricsSink, HTTP_REQUESTS_TOTAL};

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let sink = PrometheusSink::new().unwrap();
        sink.inc_counter(
            HTTP_REQUESTS_TOTAL,
            &[("method", "GET"), ("path", "/rest/api/1"), ("status", "2xx")],
        );

        let request = Request::builder().uri("/metrics").body(()).unwrap();
        let response = metrics_response(&request, &sink);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            METRICS_CONTENT_TYPE
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains(r#"path="/rest/api/1""#));
    }

    #[test]
    fn test_metrics_other_paths() {
        let sink = PrometheusSink::new().unwrap();
        let request = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(
            metrics_response(&request, &sink).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_tls_config_offers_h2_and_http1() {
        #[derive(Debug)]
        struct NoCertificates;

        impl ResolvesServerCert for NoCertificates {
            fn resolve(
                &self,
                _hello: rustls::server::ClientHello<'_>,
            ) -> Option<Arc<rustls::sign::CertifiedKey>> {
                None
            }
        }

        let config = tls_config(Arc::new(NoCertificates)).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
