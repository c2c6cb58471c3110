//! Certificate store and issuer
//!
//! Owns the in-memory certificate table consulted during every TLS handshake
//! and decides when a domain needs a (re)issued certificate.
//!
//! # Issuance
//!
//! At most one issuance runs at a time for the whole store, not per domain.
//! A trigger that arrives while another issuance is in flight is dropped; a
//! later handshake for the same domain triggers again. An issuance that never
//! returns therefore blocks all further issuance.
//!
//! # Locking
//!
//! The certificate table sits behind its own reader-writer lock and the
//! in-flight flag is a separate atomic. Neither is held across a network call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portico_common::KeyedStore;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};

use super::account::AccountIdentity;
use super::challenge::ChallengeResponder;
use super::client::{AcmeClient, CertificateBundle};
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Default renewal window (31 days)
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(31 * 24 * 60 * 60);

/// An installed certificate with its parsed expiry
#[derive(Debug)]
pub struct DomainCertificate {
    /// Chain and signing key handed to rustls
    pub certified_key: Arc<CertifiedKey>,
    /// Leaf `notAfter`
    pub not_after: DateTime<Utc>,
}

impl DomainCertificate {
    /// Parse a PEM bundle into a servable certificate
    pub fn from_bundle(bundle: &CertificateBundle) -> Result<Self, AcmeError> {
        let chain = rustls_pemfile::certs(&mut bundle.certificate_pem.as_bytes())
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;

        let leaf = chain
            .first()
            .ok_or_else(|| AcmeError::InvalidCertificate("no certificate in bundle".to_string()))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;
        let not_after = DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
            .ok_or_else(|| AcmeError::InvalidCertificate("expiry out of range".to_string()))?;

        let key = rustls_pemfile::private_key(&mut bundle.private_key_pem.as_bytes())
            .map_err(|e| AcmeError::InvalidKey(e.to_string()))?
            .ok_or_else(|| AcmeError::InvalidKey("no private key in bundle".to_string()))?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after,
        })
    }
}

/// Freshness of a domain's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    /// Nothing installed; handshakes fail
    Missing,
    /// Expires after the renewal window
    Valid,
    /// Expires within the renewal window; still served
    Aging,
}

/// Static settings for a [`CertificateStore`]
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Server names certificates may be issued for
    pub allowed_domains: Vec<String>,
    /// Renew once the certificate expires within this window
    pub renew_before: Duration,
}

/// In-memory certificate table plus the single-flight issuer
///
/// Cheap to clone; clones share all state.
pub struct CertificateStore<C: AcmeClient> {
    inner: Arc<StoreInner<C>>,
}

struct StoreInner<C: AcmeClient> {
    certificates: KeyedStore<String, Arc<DomainCertificate>>,
    allowed_domains: Vec<String>,
    renew_before: chrono::Duration,
    storage: Arc<CertificateStorage>,
    identity: AccountIdentity,
    registration: OnceCell<C::Registration>,
    client: C,
    challenges: ChallengeResponder,
    issuing: Arc<AtomicBool>,
    runtime: Handle,
}

/// Clears the in-flight flag when the issuance task ends, including on panic
struct IssuanceGuard(Arc<AtomicBool>);

impl Drop for IssuanceGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: AcmeClient> CertificateStore<C> {
    /// Create a store; must be called from within a tokio runtime
    ///
    /// Background issuance is spawned onto the runtime captured here.
    pub fn new(
        settings: StoreSettings,
        client: C,
        identity: AccountIdentity,
        storage: Arc<CertificateStorage>,
        challenges: ChallengeResponder,
    ) -> Result<Self, AcmeError> {
        let runtime = Handle::try_current().map_err(|_| AcmeError::NoRuntime)?;
        let renew_before = chrono::Duration::from_std(settings.renew_before)
            .map_err(|_| AcmeError::Protocol("renewal window out of range".to_string()))?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                certificates: KeyedStore::new(),
                allowed_domains: settings.allowed_domains,
                renew_before,
                storage,
                identity,
                registration: OnceCell::new(),
                client,
                challenges,
                issuing: Arc::new(AtomicBool::new(false)),
                runtime,
            }),
        })
    }

    /// Resolve or register the CA account now rather than on first issuance
    pub async fn register(&self) -> Result<(), AcmeError> {
        self.inner.registration().await.map(|_| ())
    }

    /// Certificate to present for `server_name`
    ///
    /// Never waits for issuance. A missing certificate fails and starts an
    /// issuance; an aging one is returned and starts a forced renewal.
    pub fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let Some(cert) = self.inner.certificates.get(server_name) else {
            self.trigger_issuance(server_name, false);
            return Err(AcmeError::CertificateNotFound(server_name.to_string()));
        };

        if self.inner.is_aging(&cert) {
            trace!(domain = %server_name, not_after = %cert.not_after, "Certificate is aging");
            self.trigger_issuance(server_name, true);
        }

        Ok(Arc::clone(&cert.certified_key))
    }

    /// Load, or obtain, and install a certificate for `domain`
    ///
    /// With `force` unset a persisted record is installed without contacting
    /// the CA. Failures leave any installed certificate in place.
    pub async fn update_cert(&self, domain: &str, force: bool) -> Result<(), AcmeError> {
        self.inner.update_cert(domain, force).await
    }

    /// Freshness of the certificate installed for `domain`
    pub fn state(&self, domain: &str) -> CertificateState {
        match self.inner.certificates.get(domain) {
            None => CertificateState::Missing,
            Some(cert) if self.inner.is_aging(&cert) => CertificateState::Aging,
            Some(_) => CertificateState::Valid,
        }
    }

    /// Expiry of the certificate installed for `domain`
    pub fn not_after(&self, domain: &str) -> Option<DateTime<Utc>> {
        self.inner.certificates.get(domain).map(|c| c.not_after)
    }

    /// Whether an issuance task is currently running
    pub fn is_issuing(&self) -> bool {
        self.inner.issuing.load(Ordering::Acquire)
    }

    /// Start a background issuance unless one is already running
    ///
    /// Returns whether a task was started.
    fn trigger_issuance(&self, domain: &str, force: bool) -> bool {
        if self
            .inner
            .issuing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(domain = %domain, "Issuance already in flight, dropping trigger");
            return false;
        }

        let guard = IssuanceGuard(Arc::clone(&self.inner.issuing));
        let inner = Arc::clone(&self.inner);
        let domain = domain.to_string();

        self.inner.runtime.spawn(async move {
            let _guard = guard;
            if let Err(e) = inner.update_cert(&domain, force).await {
                error!(domain = %domain, force, error = %e, "Certificate issuance failed");
            }
        });
        true
    }
}

impl<C: AcmeClient> StoreInner<C> {
    fn is_aging(&self, cert: &DomainCertificate) -> bool {
        cert.not_after <= Utc::now() + self.renew_before
    }

    async fn registration(&self) -> Result<&C::Registration, AcmeError> {
        self.registration
            .get_or_try_init(|| self.identity.register(&self.client))
            .await
    }

    async fn update_cert(&self, domain: &str, force: bool) -> Result<(), AcmeError> {
        if !self.allowed_domains.iter().any(|d| d == domain) {
            return Err(AcmeError::DomainNotAllowed(domain.to_string()));
        }

        if !force {
            match self.storage.load_certificate(domain) {
                Ok(bundle) => {
                    let cert = DomainCertificate::from_bundle(&bundle)?;
                    info!(domain = %domain, not_after = %cert.not_after, "Installed stored certificate");
                    self.certificates.insert(domain.to_string(), Arc::new(cert));
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    trace!(domain = %domain, "No stored certificate");
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Unreadable certificate record, requesting a new one");
                }
            }
        }

        let registration = self.registration().await?;
        let bundle = self
            .client
            .obtain(registration, domain, &self.challenges)
            .await?;

        let cert = DomainCertificate::from_bundle(&bundle)?;
        self.storage.save_certificate(domain, &bundle)?;

        info!(domain = %domain, not_after = %cert.not_after, "Installed new certificate");
        self.certificates.insert(domain.to_string(), Arc::new(cert));
        Ok(())
    }
}

impl<C: AcmeClient> Clone for CertificateStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: AcmeClient> fmt::Debug for CertificateStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("certificates", &self.inner.certificates)
            .field("allowed_domains", &self.inner.allowed_domains)
            .field("issuing", &self.is_issuing())
            .finish_non_exhaustive()
    }
}

impl<C: AcmeClient> ResolvesServerCert for CertificateStore<C> {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            warn!("TLS handshake without SNI, no certificate to offer");
            return None;
        };

        match self.get_certificate(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(server_name = %server_name, error = %e, "Failing TLS handshake");
                None
            }
        }
    }
}
