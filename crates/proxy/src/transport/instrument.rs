//! Request metrics for upstream exchanges

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use portico_common::{MetricsSink, HTTP_REQUESTS_TOTAL, HTTP_RESPONSE_TIME_SECONDS};
use tracing::trace;

use super::{ResponseBody, Transport, TransportError};
use crate::normalize::PathNormalizer;

/// Records a request counter and a latency histogram per exchange
///
/// Labels use the normalized path template. Paths the normalizer rejects
/// and failed exchanges are not recorded.
pub struct Instrumented<T> {
    inner: T,
    normalizer: Arc<PathNormalizer>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: Transport> Instrumented<T> {
    pub fn new(inner: T, normalizer: Arc<PathNormalizer>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner,
            normalizer,
            metrics,
        }
    }
}

/// `2xx`, `4xx` and so on
fn status_class(status: StatusCode) -> String {
    format!("{}xx", status.as_u16() / 100)
}

#[async_trait]
impl<T: Transport> Transport for Instrumented<T> {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let start = Instant::now();
        let response = self.inner.round_trip(request).await?;
        let elapsed = start.elapsed();

        let Some(template) = self.normalizer.normalize(&path) else {
            trace!(path = %path, "Path not instrumented");
            return Ok(response);
        };

        let status = status_class(response.status());
        self.metrics.inc_counter(
            HTTP_REQUESTS_TOTAL,
            &[
                ("method", method.as_str()),
                ("path", &template),
                ("status", &status),
            ],
        );
        self.metrics.observe_histogram(
            HTTP_RESPONSE_TIME_SECONDS,
            &[("method", method.as_str()), ("path", &template)],
            elapsed.as_secs_f64(),
        );

        Ok(response)
    }
}
