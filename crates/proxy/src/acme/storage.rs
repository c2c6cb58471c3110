//! Certificate and account storage for ACME
//!
//! Every record is a single JSON file written through
//! [`portico_common::persist`], so a crash mid-write never leaves a torn
//! record behind.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── user.json             # account identity: email + base64 PKCS#8 key
//! ├── example.com.json      # certificate record per domain
//! └── accounts/
//!     └── <sha256>.json     # CA credentials bound to the identity key
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use portico_common::persist;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::client::CertificateBundle;
use super::error::StorageError;

/// On-disk certificate record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateRecord {
    /// base64 of the PEM certificate chain
    certificate: String,
    /// base64 of the PEM private key
    #[serde(rename = "privateKey")]
    private_key: String,
}

/// On-disk account identity record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    email: String,
    /// base64 of the DER private key
    #[serde(rename = "privateKey")]
    private_key: String,
}

/// Account identity as loaded from disk
#[derive(Debug, Clone)]
pub struct StoredAccount {
    pub email: String,
    pub key_der: Vec<u8>,
}

/// Filesystem storage for account and certificate records
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open storage at `base_path`, creating it with mode 0700 if needed
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let accounts_path = base_path.join("accounts");
        fs::create_dir_all(&accounts_path).map_err(StorageError::Directory)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone()).map_err(StorageError::Directory)?;
            fs::set_permissions(&accounts_path, perms).map_err(StorageError::Directory)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized ACME certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    fn account_path(&self) -> PathBuf {
        self.base_path.join("user.json")
    }

    /// Load the persisted account identity
    pub fn load_account(&self) -> Result<StoredAccount, StorageError> {
        let record: AccountRecord = persist::read_json(&self.account_path())?;
        let key_der = STANDARD
            .decode(record.private_key.trim())
            .map_err(|source| StorageError::Encoding {
                field: "privateKey",
                source,
            })?;

        debug!(email = %record.email, "Loaded ACME account identity");
        Ok(StoredAccount {
            email: record.email,
            key_der,
        })
    }

    /// Persist the account identity
    pub fn save_account(&self, email: &str, key_der: &[u8]) -> Result<(), StorageError> {
        let record = AccountRecord {
            email: email.to_string(),
            private_key: STANDARD.encode(key_der),
        };
        persist::write_json_atomic(&self.account_path(), &record)?;
        trace!(email = %email, "Saved ACME account identity");
        Ok(())
    }

    fn credentials_path(&self, key_thumbprint: &str) -> PathBuf {
        self.base_path
            .join("accounts")
            .join(format!("{key_thumbprint}.json"))
    }

    /// Load CA account credentials bound to an identity key
    pub fn load_credentials<T: DeserializeOwned>(
        &self,
        key_thumbprint: &str,
    ) -> Result<T, StorageError> {
        let creds = persist::read_json(&self.credentials_path(key_thumbprint))?;
        debug!("Loaded ACME credentials");
        Ok(creds)
    }

    /// Persist CA account credentials bound to an identity key
    pub fn save_credentials<T: Serialize>(
        &self,
        key_thumbprint: &str,
        credentials: &T,
    ) -> Result<(), StorageError> {
        persist::write_json_atomic(&self.credentials_path(key_thumbprint), credentials)?;
        info!("Saved ACME credentials");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    fn certificate_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{domain}.json"))
    }

    /// Load and decode the certificate record for `domain`
    pub fn load_certificate(&self, domain: &str) -> Result<CertificateBundle, StorageError> {
        let record: CertificateRecord = persist::read_json(&self.certificate_path(domain))?;

        let bundle = CertificateBundle {
            certificate_pem: decode_pem("certificate", &record.certificate)?,
            private_key_pem: decode_pem("privateKey", &record.private_key)?,
        };

        debug!(domain = %domain, "Loaded stored certificate");
        Ok(bundle)
    }

    /// Persist the certificate record for `domain`
    pub fn save_certificate(
        &self,
        domain: &str,
        bundle: &CertificateBundle,
    ) -> Result<(), StorageError> {
        let record = CertificateRecord {
            certificate: STANDARD.encode(&bundle.certificate_pem),
            private_key: STANDARD.encode(&bundle.private_key_pem),
        };
        persist::write_json_atomic(&self.certificate_path(domain), &record)?;

        info!(domain = %domain, "Saved certificate to storage");
        Ok(())
    }
}

fn decode_pem(field: &'static str, encoded: &str) -> Result<String, StorageError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|source| StorageError::Encoding { field, source })?;
    String::from_utf8(bytes).map_err(|_| StorageError::NotPem { field })
}
