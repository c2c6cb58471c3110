//! Configuration for the portico gateway.
//!
//! The binary assembles a [`GatewayConfig`] from command-line flags and
//! environment variables, then calls [`GatewayConfig::validated`] before any
//! listener or certificate machinery starts. Validation failures are fatal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

mod validate;

pub use validate::{ConfigError, ValidatedConfig};

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GatewayConfig {
    /// Base URL of the single upstream service
    pub upstream: String,

    /// Contact address for the ACME account
    #[validate(email)]
    pub email: String,

    /// Server names certificates may be issued for
    #[validate(length(min = 1))]
    pub domains: Vec<String>,

    /// Skip certificate verification when talking to the upstream
    #[serde(default)]
    pub insecure_upstream: bool,

    /// How request paths become metric labels
    #[serde(default)]
    #[validate(nested)]
    pub metrics: MetricsLabelConfig,

    /// ACME settings
    #[serde(default)]
    #[validate(nested)]
    pub acme: AcmeSettings,

    /// Listener addresses
    #[serde(default)]
    pub listeners: ListenerAddresses,

    /// Largest request body forwarded upstream, in bytes
    #[serde(default = "default_max_body_bytes")]
    #[validate(range(min = 1))]
    pub max_body_bytes: u64,

    /// Response cache budget
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
}

/// Path template settings for metric labels
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct MetricsLabelConfig {
    /// Prefix every recorded path must carry, e.g. `/rest/api`
    #[serde(default)]
    pub prefix: String,

    /// Whether a version segment follows the prefix
    #[serde(default)]
    pub has_version: bool,

    /// Glob patterns for paths that are never recorded
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// ACME certificate management settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeSettings {
    /// Directory URL of the certificate authority
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Where account and certificate records are kept
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Renew once a certificate expires within this many days
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 365))]
    pub renew_before_days: u32,
}

/// Socket addresses the gateway binds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerAddresses {
    /// TLS-terminating proxy listener
    #[serde(default = "default_https_address")]
    pub https: String,

    /// Plaintext listener for HTTP-01 challenges and HTTPS redirects
    #[serde(default = "default_http_address")]
    pub http: String,

    /// Metrics exposition listener
    #[serde(default = "default_metrics_address")]
    pub metrics: String,
}

/// Response cache budget
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    /// Total cost (body bytes) the cache may hold
    #[serde(default = "default_cache_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: u64,
}

fn default_directory() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/portico")
}

fn default_renew_before_days() -> u32 {
    31
}

fn default_https_address() -> String {
    "0.0.0.0:443".to_string()
}

fn default_http_address() -> String {
    "0.0.0.0:80".to_string()
}

fn default_metrics_address() -> String {
    "0.0.0.0:9001".to_string()
}

/// Default request body limit (32 MiB)
pub fn default_max_body_bytes() -> u64 {
    32 << 20
}

fn default_cache_max_bytes() -> u64 {
    1 << 30 // 1GB
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            storage_path: default_storage_path(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

impl Default for ListenerAddresses {
    fn default() -> Self {
        Self {
            https: default_https_address(),
            http: default_http_address(),
            metrics: default_metrics_address(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
        }
    }
}

/// Split a comma separated flag value, trimming entries and dropping empty ones
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
