//! Portico Proxy Library
//!
//! Drop-in HTTPS in front of a plaintext service.
//!
//! This library provides the data plane of the `portico` gateway:
//!
//! - **Certificates**: on-demand ACME issuance during the TLS handshake,
//!   background renewal and on-disk persistence
//! - **Challenges**: HTTP-01 token answers on the plaintext listener
//! - **Metrics**: request counters and latency histograms labelled with
//!   normalized path templates
//! - **Caching**: bounded in-memory cache for static asset responses
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use portico_common::{MetricsSink, PrometheusSink};
//! use portico_proxy::{Instrumented, PathNormalizer, ResponseCache, UpstreamTransport};
//!
//! let normalizer = Arc::new(PathNormalizer::new("/rest/api", true, Vec::new())?);
//! let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusSink::new()?);
//! let upstream = UpstreamTransport::new(false)?;
//! let transport = ResponseCache::new(
//!     Instrumented::new(upstream, normalizer, sink.clone()),
//!     1 << 30,
//!     sink,
//! );
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod normalize;
pub mod server;
pub mod transport;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate management
pub use acme::{
    AccountIdentity, AcmeClient, AcmeError, CertificateStorage, CertificateStore,
    ChallengeResponder, InstantAcmeClient, StoreSettings,
};

// Metric labels
pub use normalize::PathNormalizer;

// Listeners
pub use server::Forwarder;

// Upstream transport stack
pub use transport::{
    Instrumented, ResponseCache, Transport, TransportError, UpstreamTransport,
};
