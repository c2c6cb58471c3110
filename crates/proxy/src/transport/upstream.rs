//! Network transport to the upstream over `reqwest`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use reqwest::redirect::Policy;
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore};
use tracing::{trace, warn};

use super::verify::{PrivateUpstreamVerifier, RecordingResolver, ResolvedHosts};
use super::{BoxError, ResponseBody, Transport, TransportError};

/// Dial timeout for upstream connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keep-alive for upstream connections
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// How long an idle pooled connection is kept
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Sends requests with absolute URIs and streams responses back
///
/// Redirects are passed through to the client, never followed.
#[derive(Debug, Clone)]
pub struct UpstreamTransport {
    client: reqwest::Client,
}

impl UpstreamTransport {
    /// Build the transport
    ///
    /// With `insecure`, certificate checks are skipped for upstreams on
    /// private or loopback addresses; public upstreams are still verified.
    pub fn new(insecure: bool) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .redirect(Policy::none())
            .no_proxy();

        if insecure {
            warn!("Upstream TLS certificate verification is disabled for private addresses");
            let hosts = Arc::new(ResolvedHosts::new());
            builder = builder
                .use_preconfigured_tls(private_upstream_tls(Arc::clone(&hosts))?)
                .dns_resolver(Arc::new(RecordingResolver::new(hosts)));
        }

        let client = builder.build().map_err(TransportError::Client)?;
        Ok(Self { client })
    }
}

fn private_upstream_tls(hosts: Arc<ResolvedHosts>) -> Result<ClientConfig, TransportError> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PrivateUpstreamVerifier::new(webpki, hosts)))
        .with_no_client_auth();
    Ok(config)
}

#[async_trait]
impl Transport for UpstreamTransport {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let (parts, body) = request.into_parts();
        trace!(method = %parts.method, uri = %parts.uri, "Sending upstream request");

        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(TransportError::Upstream)?;

        let response: Response<reqwest::Body> = response.into();
        Ok(response.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed()))
    }
}
