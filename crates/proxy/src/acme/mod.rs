//! ACME automatic certificate management
//!
//! Certificates are obtained on demand: the first TLS handshake for an
//! allowed server name fails and starts an issuance, and later handshakes
//! are served from memory. Certificates close to expiry keep being served
//! while a renewal runs in the background.
//!
//! # Architecture
//!
//! - [`CertificateStore`] - certificate table, renewal decisions and the
//!   single-flight issuer; also the rustls certificate resolver
//! - [`AccountIdentity`] - persisted account email and key
//! - [`ChallengeResponder`] - HTTP-01 token map and plaintext listener handler
//! - [`AcmeClient`] - protocol seam, implemented by [`InstantAcmeClient`]
//! - [`CertificateStorage`] - JSON records on disk
//!
//! # Challenge Flow
//!
//! 1. [`CertificateStore`] asks the [`AcmeClient`] for a certificate for one domain
//! 2. The client creates an order and receives an HTTP-01 token per authorization
//! 3. [`ChallengeResponder`] stores the key authorization under (domain, token)
//! 4. The CA fetches `http://<domain>/.well-known/acme-challenge/<token>`
//! 5. Once validated, the tokens are cleaned up and the order is finalized
//! 6. The certificate is persisted to `<storage>/<domain>.json` and installed

mod account;
mod challenge;
mod client;
mod error;
mod storage;
mod store;

pub use account::AccountIdentity;
pub use challenge::{ChallengeProvider, ChallengeResponder, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, CertificateBundle, InstantAcmeClient};
pub use error::{AcmeError, StorageError};
pub use storage::CertificateStorage;
pub use store::{
    CertificateState, CertificateStore, DomainCertificate, StoreSettings, DEFAULT_RENEW_BEFORE,
};
