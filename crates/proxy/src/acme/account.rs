//! ACME account identity
//!
//! One identity per installation: the operator email and a P-256 key,
//! persisted as `user.json`. Once loaded both stay fixed for the life of the
//! process.

use std::fmt;

use rcgen::{KeyPair, PublicKeyData, PKCS_ECDSA_P256_SHA256};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::client::AcmeClient;
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Email and key pair identifying the gateway to the CA
pub struct AccountIdentity {
    email: String,
    key: KeyPair,
}

impl AccountIdentity {
    /// Load the persisted identity, or create one using `default_email`
    ///
    /// A missing, unreadable or unusable record is replaced by a fresh key.
    /// Either way the identity is written back, which normalizes the record
    /// and repairs a damaged file.
    pub fn load_or_create(
        storage: &CertificateStorage,
        default_email: &str,
    ) -> Result<Self, AcmeError> {
        let identity = match storage.load_account() {
            Ok(stored) => match KeyPair::try_from(stored.key_der.as_slice()) {
                Ok(key) if key.algorithm() == &PKCS_ECDSA_P256_SHA256 => {
                    info!(email = %stored.email, "Loaded ACME account identity");
                    Self {
                        email: stored.email,
                        key,
                    }
                }
                Ok(_) => {
                    warn!("Stored account key is not a P-256 key, generating a new one");
                    Self::generate(default_email)?
                }
                Err(e) => {
                    warn!(error = %e, "Stored account key is unreadable, generating a new one");
                    Self::generate(default_email)?
                }
            },
            Err(e) if e.is_not_found() => {
                debug!("No stored ACME account identity");
                Self::generate(default_email)?
            }
            Err(e) => {
                warn!(error = %e, "Failed to load ACME account identity, generating a new one");
                Self::generate(default_email)?
            }
        };

        storage.save_account(&identity.email, &identity.key.serialize_der())?;
        Ok(identity)
    }

    fn generate(email: &str) -> Result<Self, AcmeError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| AcmeError::InvalidKey(e.to_string()))?;
        info!(email = %email, "Created ACME account identity");
        Ok(Self {
            email: email.to_string(),
            key,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// Hex SHA-256 of the public key (SubjectPublicKeyInfo DER)
    pub fn thumbprint(&self) -> String {
        hex::encode(Sha256::digest(self.key.subject_public_key_info()))
    }

    /// Resolve the CA account bound to this identity, registering one if needed
    pub async fn register<C: AcmeClient>(&self, client: &C) -> Result<C::Registration, AcmeError> {
        match client.resolve_account(self).await {
            Ok(registration) => Ok(registration),
            Err(e) => {
                debug!(error = %e, "No existing ACME account, registering");
                client.register_account(self).await
            }
        }
    }
}

impl fmt::Debug for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountIdentity")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}
