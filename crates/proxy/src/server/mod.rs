//! Inbound listeners
//!
//! - HTTPS: TLS with certificates resolved per SNI from the certificate
//!   store, every request forwarded through the transport stack
//! - HTTP: ACME challenge answers, everything else redirected to HTTPS
//! - Metrics: Prometheus text exposition at `/metrics`
//!
//! Connections are served by hyper's auto builder, so both HTTP/1.1 and
//! HTTP/2 (via ALPN) are accepted.

mod forward;
mod listener;

pub use forward::Forwarder;
pub use listener::{serve_challenges, serve_https, serve_metrics, tls_config};
