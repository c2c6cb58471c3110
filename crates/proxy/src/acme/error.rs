//! Error types for ACME certificate management

use portico_common::PersistError;
use thiserror::Error;

/// Errors from the certificate store, account identity and ACME client
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Server name is not in the configured allow-list
    #[error("domain '{0}' is not allowed")]
    DomainNotAllowed(String),

    /// No certificate is installed for the server name yet
    #[error("certificate not found for '{0}'")]
    CertificateNotFound(String),

    /// ACME protocol operation failed
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Challenge validation failed or timed out
    #[error("challenge failed for '{domain}': {message}")]
    Challenge { domain: String, message: String },

    /// Certificate bundle could not be parsed
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Private key could not be decoded or is unusable
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Persisted record could not be read or written
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Background issuance was requested outside a tokio runtime
    #[error("no async runtime available for background issuance")]
    NoRuntime,
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<rustls::Error> for AcmeError {
    fn from(e: rustls::Error) -> Self {
        Self::InvalidKey(e.to_string())
    }
}

/// Errors from the record storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing a JSON record failed
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Storage directory could not be prepared
    #[error("failed to prepare storage directory: {0}")]
    Directory(#[source] std::io::Error),

    /// A base64 field in a record is malformed
    #[error("malformed {field} in record: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    /// A decoded field is not valid UTF-8 PEM text
    #[error("{field} is not valid PEM text")]
    NotPem { field: &'static str },
}

impl StorageError {
    /// Whether the record simply has not been written yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Persist(e) if e.is_not_found())
    }
}
