//! HTTP-01 ACME challenge responder
//!
//! Handler for the plaintext listener: serves pending challenge tokens at
//! `/.well-known/acme-challenge/<token>` and redirects everything else to
//! HTTPS.

use std::sync::Arc;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use portico_common::KeyedStore;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Sink for challenge tokens handed out during an ACME authorization
///
/// The ACME client calls [`present`](Self::present) before asking the CA to
/// validate and [`clean_up`](Self::clean_up) once the authorization has
/// finished, whatever its outcome.
pub trait ChallengeProvider: Send + Sync {
    /// Make `key_authorization` available for `(domain, token)`
    fn present(&self, domain: &str, token: &str, key_authorization: &str);

    /// Forget the entry for `(domain, token)`
    fn clean_up(&self, domain: &str, token: &str);
}

/// Pending HTTP-01 challenges keyed by (domain, token)
///
/// Clones share the same token map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponder {
    challenges: Arc<KeyedStore<(String, String), String>>,
}

impl ChallengeResponder {
    /// Create a responder with no pending challenges
    pub fn new() -> Self {
        Self::default()
    }

    /// Key authorization registered for `(domain, token)`, if any
    pub fn get_response(&self, domain: &str, token: &str) -> Option<String> {
        let result = self
            .challenges
            .get(&(domain.to_string(), token.to_string()));
        if result.is_some() {
            trace!(domain = %domain, token = %token, "ACME challenge token found");
        } else {
            trace!(domain = %domain, token = %token, "ACME challenge token not found");
        }
        result
    }

    /// Token part of a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Answer a request arriving on the plaintext listener
    pub fn respond<B>(&self, request: &Request<B>) -> Response<Full<Bytes>> {
        let Some(host) = request_host(request) else {
            debug!(uri = %request.uri(), "Rejecting plaintext request without a host");
            return plain(StatusCode::BAD_REQUEST, "missing host");
        };

        let Some(token) = Self::extract_token(request.uri().path()) else {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let location = format!("https://{host}{path_and_query}");
            trace!(location = %location, "Redirecting to HTTPS");
            return Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(header::LOCATION, location)
                .body(Full::new(Bytes::new()))
                .unwrap_or_else(|_| plain(StatusCode::BAD_REQUEST, "invalid host"));
        };

        match self.get_response(host, token) {
            Some(key_authorization) => {
                debug!(domain = %host, token = %token, "Serving ACME challenge");
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Full::new(Bytes::from(key_authorization)))
                    .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, ""))
            }
            None => plain(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

impl ChallengeProvider for ChallengeResponder {
    fn present(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges.insert(
            (domain.to_string(), token.to_string()),
            key_authorization.to_string(),
        );
    }

    fn clean_up(&self, domain: &str, token: &str) {
        if self
            .challenges
            .remove(&(domain.to_string(), token.to_string()))
            .is_some()
        {
            debug!(domain = %domain, token = %token, "Removed ACME challenge");
        }
    }
}

/// Request host without any `:port` suffix
fn request_host<B>(request: &Request<B>) -> Option<&str> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())?;

    let host = if raw.starts_with('[') {
        // IPv6 literal, keep the brackets
        raw.split_once(']').map_or(raw, |(addr, _)| &raw[..=addr.len()])
    } else {
        raw.split(':').next().unwrap_or(raw)
    };

    (!host.is_empty()).then_some(host)
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
