//! In-memory response cache for static assets
//!
//! Only `200 OK` responses whose `Content-Type` is exactly one of
//! [`CACHEABLE_CONTENT_TYPES`] are admitted. Entries are keyed by method and
//! full URI, weighted by body size, and evicted once the byte budget is
//! exceeded. There is no time-based expiry.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use moka::future::Cache;
use moka::notification::RemovalCause;
use portico_common::{MetricsSink, CACHE_HITS_TOTAL, CACHE_REQUESTS_TOTAL};
use tracing::{debug, trace};

use super::{full_body, ResponseBody, Transport, TransportError};

/// Content types admitted to the cache, compared verbatim
pub const CACHEABLE_CONTENT_TYPES: [&str; 5] = [
    "application/javascript",
    "text/css",
    "image/png",
    "application/font-woff",
    "image/x-icon",
];

/// Header added to responses served from the cache
pub const CACHE_HEADER: &str = "x-cache";

/// Value of [`CACHE_HEADER`] on a hit
pub const CACHE_HIT: &str = "HIT";

#[derive(Debug)]
struct CachedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl CachedResponse {
    fn to_response(&self) -> Response<ResponseBody> {
        let mut response = Response::new(full_body(self.body.clone()));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers.clone();
        response
            .headers_mut()
            .insert(CACHE_HEADER, HeaderValue::from_static(CACHE_HIT));
        response
    }
}

/// Caching wrapper around another [`Transport`]
pub struct ResponseCache<T> {
    inner: T,
    entries: Cache<String, Arc<CachedResponse>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: Transport> ResponseCache<T> {
    /// Wrap `inner` with a cache holding at most `max_bytes` of bodies
    pub fn new(inner: T, max_bytes: u64, metrics: Arc<dyn MetricsSink>) -> Self {
        let entries = Cache::builder()
            .name("portico-response-cache")
            .max_capacity(max_bytes)
            .weigher(|_key: &String, value: &Arc<CachedResponse>| {
                u32::try_from(value.body.len()).unwrap_or(u32::MAX)
            })
            .eviction_listener(|key: Arc<String>, _value, cause| match cause {
                RemovalCause::Size => debug!(key = %key, "Evicted cached response"),
                other => trace!(key = %key, cause = ?other, "Removed cached response"),
            })
            .build();

        debug!(max_bytes, "Response cache created");
        Self {
            inner,
            entries,
            metrics,
        }
    }

    /// Number of cached responses
    ///
    /// Reflects pending inserts only after [`Self::run_pending_tasks`].
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Total body bytes currently held
    pub fn weighted_size(&self) -> u64 {
        self.entries.weighted_size()
    }

    /// Apply pending admissions and evictions
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }
}

fn cache_key<B>(request: &Request<B>) -> String {
    format!("{}:{}", request.method(), request.uri())
}

fn is_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK {
        return false;
    }
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| CACHEABLE_CONTENT_TYPES.contains(&ct))
}

#[async_trait]
impl<T: Transport> Transport for ResponseCache<T> {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        self.metrics.inc_counter(CACHE_REQUESTS_TOTAL, &[]);

        let key = cache_key(&request);
        if let Some(cached) = self.entries.get(&key).await {
            self.metrics.inc_counter(CACHE_HITS_TOTAL, &[]);
            trace!(key = %key, "Cache hit");
            return Ok(cached.to_response());
        }

        let response = self.inner.round_trip(request).await?;
        if !is_cacheable(response.status(), response.headers()) {
            debug!(key = %key, status = %response.status(), "Response not cacheable");
            return Ok(response);
        }

        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(TransportError::Body)?.to_bytes();

        let cached = CachedResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers.clone(),
            body: body.clone(),
        };
        self.entries.insert(key, Arc::new(cached)).await;

        Ok(Response::from_parts(parts, full_body(body)))
    }
}
