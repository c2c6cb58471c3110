//! ACME protocol client
//!
//! [`AcmeClient`] is the seam between the certificate store and the ACME
//! wire protocol: it resolves or registers a CA account for an
//! [`AccountIdentity`] and obtains a certificate for exactly one domain,
//! handing HTTP-01 tokens to a [`ChallengeProvider`] along the way.
//! [`InstantAcmeClient`] implements it on top of `instant-acme`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tracing::{debug, info, warn};

use super::account::AccountIdentity;
use super::challenge::ChallengeProvider;
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Number of order status polls before giving up
const MAX_POLL_ATTEMPTS: u32 = 10;

/// First delay between order status polls; doubles up to [`MAX_POLL_DELAY`]
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(250);

const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

/// PEM certificate chain and private key as issued by the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// Leaf certificate followed by the intermediates
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// ACME account and order operations
#[async_trait]
pub trait AcmeClient: Send + Sync + 'static {
    /// Opaque handle for a registered CA account
    type Registration: Send + Sync + 'static;

    /// Look up the CA account already bound to the identity's key
    async fn resolve_account(
        &self,
        identity: &AccountIdentity,
    ) -> Result<Self::Registration, AcmeError>;

    /// Register a new CA account for the identity, accepting the terms of service
    async fn register_account(
        &self,
        identity: &AccountIdentity,
    ) -> Result<Self::Registration, AcmeError>;

    /// Obtain a certificate for exactly `domain`
    async fn obtain(
        &self,
        registration: &Self::Registration,
        domain: &str,
        challenges: &dyn ChallengeProvider,
    ) -> Result<CertificateBundle, AcmeError>;
}

/// [`AcmeClient`] backed by `instant-acme`
///
/// `instant-acme` signs requests with its own account key, kept inside
/// [`AccountCredentials`]. Those credentials are stored under the identity
/// key's thumbprint, which ties the CA account to the identity.
#[derive(Debug)]
pub struct InstantAcmeClient {
    directory_url: String,
    storage: Arc<CertificateStorage>,
}

impl InstantAcmeClient {
    pub fn new(directory_url: impl Into<String>, storage: Arc<CertificateStorage>) -> Self {
        Self {
            directory_url: directory_url.into(),
            storage,
        }
    }

    /// Run every pending authorization of `order` through `challenges`
    async fn authorize(
        order: &mut instant_acme::Order,
        domain: &str,
        challenges: &dyn ChallengeProvider,
        presented: &mut Vec<(String, String)>,
    ) -> Result<(), AcmeError> {
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcmeError::Challenge {
                        domain: domain.to_string(),
                        message: format!("authorization is {status:?}"),
                    });
                }
            }

            let Identifier::Dns(name) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::Challenge {
                    domain: domain.to_string(),
                    message: "no HTTP-01 challenge offered".to_string(),
                })?;

            let key_authorization = order.key_authorization(challenge);
            challenges.present(name, &challenge.token, key_authorization.as_str());
            presented.push((name.clone(), challenge.token.clone()));

            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut delay = INITIAL_POLL_DELAY;
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await?;
            match &state.status {
                OrderStatus::Ready => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::Challenge {
                        domain: domain.to_string(),
                        message: "order became invalid".to_string(),
                    });
                }
                status => {
                    debug!(domain = %domain, attempt, status = ?status, "Order not ready yet");
                }
            }
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        Err(AcmeError::Challenge {
            domain: domain.to_string(),
            message: "timed out waiting for validation".to_string(),
        })
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    type Registration = Account;

    async fn resolve_account(&self, identity: &AccountIdentity) -> Result<Account, AcmeError> {
        let credentials: AccountCredentials = self
            .storage
            .load_credentials(&identity.thumbprint())?;
        let account = Account::from_credentials(credentials).await?;
        debug!(email = %identity.email(), "Resolved existing ACME account");
        Ok(account)
    }

    async fn register_account(&self, identity: &AccountIdentity) -> Result<Account, AcmeError> {
        let contact = format!("mailto:{}", identity.email());
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) =
            Account::create(&new_account, &self.directory_url, None).await?;
        self.storage
            .save_credentials(&identity.thumbprint(), &credentials)?;

        info!(
            email = %identity.email(),
            directory = %self.directory_url,
            "Registered new ACME account"
        );
        Ok(account)
    }

    async fn obtain(
        &self,
        account: &Account,
        domain: &str,
        challenges: &dyn ChallengeProvider,
    ) -> Result<CertificateBundle, AcmeError> {
        info!(domain = %domain, "Requesting certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut presented = Vec::new();
        let authorized = Self::authorize(&mut order, domain, challenges, &mut presented).await;
        for (name, token) in &presented {
            challenges.clean_up(name, token);
        }
        authorized?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate().map_err(|e| AcmeError::InvalidKey(e.to_string()))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| AcmeError::InvalidCertificate(e.to_string()))?;

        order.finalize(csr.der()).await?;

        let mut delay = INITIAL_POLL_DELAY;
        for _ in 0..MAX_POLL_ATTEMPTS {
            if let Some(certificate_pem) = order.certificate().await? {
                info!(domain = %domain, "Certificate issued");
                return Ok(CertificateBundle {
                    certificate_pem,
                    private_key_pem: key.serialize_pem(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        warn!(domain = %domain, "Order finalized but no certificate was returned");
        Err(AcmeError::Protocol(format!(
            "no certificate returned for '{domain}'"
        )))
    }
}
