//! Outbound transport to the upstream
//!
//! A [`Transport`] performs one request/response exchange. The gateway
//! stacks two wrappers on the network transport:
//!
//! ```text
//! ResponseCache -> Instrumented -> UpstreamTransport -> upstream
//! ```
//!
//! Neither wrapper alters or swallows transport errors.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

mod cache;
mod instrument;
mod upstream;
mod verify;

#[cfg(test)]
mod testing;

pub use cache::{ResponseCache, CACHEABLE_CONTENT_TYPES, CACHE_HEADER, CACHE_HIT};
pub use instrument::Instrumented;
pub use upstream::UpstreamTransport;

/// Boxed error carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming response body
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Errors produced while talking to the upstream
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be sent or no response arrived
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// Response body failed while being read
    #[error("failed to read upstream response body: {0}")]
    Body(#[source] BoxError),

    /// HTTP client could not be built
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),

    /// TLS settings for the upstream could not be built
    #[error("failed to build upstream TLS settings: {0}")]
    Tls(String),
}

/// One request/response exchange with the upstream
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        (**self).round_trip(request).await
    }
}

/// Body over an in-memory buffer
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}
