//! Startup validation
//!
//! Turns a raw [`GatewayConfig`] into a [`ValidatedConfig`] with parsed
//! addresses, a parsed upstream URL and compiled exclude patterns. Missing
//! required settings are reported before any format checks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use url::Url;
use validator::{Validate, ValidationErrors};

use crate::GatewayConfig;

/// Configuration errors; all of them are fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("an upstream URL is required")]
    MissingUpstream,

    #[error("a contact email is required")]
    MissingEmail,

    #[error("at least one domain is required")]
    MissingDomains,

    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidExclude {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid {name} listen address '{address}'")]
    InvalidListenAddress { name: &'static str, address: String },

    #[error("invalid ACME directory URL '{0}'")]
    InvalidDirectory(String),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// Configuration after all startup checks passed
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub upstream: Url,
    pub insecure_upstream: bool,
    pub email: String,
    /// Lowercased allow-list of server names
    pub domains: Vec<String>,
    pub metrics_prefix: String,
    pub metrics_has_version: bool,
    pub metrics_excluded: Vec<glob::Pattern>,
    pub acme_directory: Url,
    pub storage_path: PathBuf,
    pub renew_before: Duration,
    pub https_address: SocketAddr,
    pub http_address: SocketAddr,
    pub metrics_address: SocketAddr,
    pub cache_max_bytes: u64,
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    /// Check the configuration and resolve it into its parsed form
    pub fn validated(self) -> Result<ValidatedConfig, ConfigError> {
        if self.upstream.trim().is_empty() {
            return Err(ConfigError::MissingUpstream);
        }
        if self.email.trim().is_empty() {
            return Err(ConfigError::MissingEmail);
        }
        if self.domains.is_empty() {
            return Err(ConfigError::MissingDomains);
        }

        Validate::validate(&self)?;

        let upstream = parse_upstream(&self.upstream)?;

        let domains = self
            .domains
            .iter()
            .map(|d| normalize_domain(d))
            .collect::<Result<Vec<_>, _>>()?;

        let prefix = canonical_prefix(&self.metrics.prefix);

        let metrics_excluded = self
            .metrics
            .excluded
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|source| ConfigError::InvalidExclude {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let acme_directory = Url::parse(&self.acme.directory)
            .ok()
            .filter(|u| matches!(u.scheme(), "https" | "http"))
            .ok_or_else(|| ConfigError::InvalidDirectory(self.acme.directory.clone()))?;

        let https_address = parse_address("https", &self.listeners.https)?;
        let http_address = parse_address("http", &self.listeners.http)?;
        let metrics_address = parse_address("metrics", &self.listeners.metrics)?;

        debug!(
            upstream = %upstream,
            domains = ?domains,
            storage = %self.acme.storage_path.display(),
            "Configuration validated"
        );

        Ok(ValidatedConfig {
            upstream,
            insecure_upstream: self.insecure_upstream,
            email: self.email.trim().to_string(),
            domains,
            metrics_prefix: prefix,
            metrics_has_version: self.metrics.has_version,
            metrics_excluded,
            acme_directory,
            storage_path: self.acme.storage_path,
            renew_before: Duration::from_secs(u64::from(self.acme.renew_before_days) * 24 * 60 * 60),
            https_address,
            http_address,
            metrics_address,
            cache_max_bytes: self.cache.max_bytes,
            max_body_bytes: usize::try_from(self.max_body_bytes).unwrap_or(usize::MAX),
        })
    }
}

fn parse_upstream(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUpstream {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

fn normalize_domain(raw: &str) -> Result<String, ConfigError> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !domain.starts_with('.')
        && !domain.contains("..");
    if valid {
        Ok(domain)
    } else {
        Err(ConfigError::InvalidDomain(raw.to_string()))
    }
}

/// Leading `/`, no trailing `/`; empty stays empty
fn canonical_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_address(name: &'static str, address: &str) -> Result<SocketAddr, ConfigError> {
    address
        .parse()
        .map_err(|_| ConfigError::InvalidListenAddress {
            name,
            address: address.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcmeSettings, CacheSettings, ListenerAddresses, MetricsLabelConfig};

    fn base() -> GatewayConfig {
        GatewayConfig {
            upstream: "http://127.0.0.1:8080".to_string(),
            email: "ops@example.com".to_string(),
            domains: vec!["Example.com".to_string(), "www.example.com.".to_string()],
            insecure_upstream: false,
            metrics: MetricsLabelConfig {
                prefix: "/rest/api/".to_string(),
                has_version: true,
                excluded: vec!["/rest/api/*/health".to_string()],
            },
            acme: AcmeSettings::default(),
            listeners: ListenerAddresses::default(),
            max_body_bytes: crate::default_max_body_bytes(),
            cache: CacheSettings::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = base().validated().unwrap();
        assert_eq!(config.upstream.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(config.domains, vec!["example.com", "www.example.com"]);
        assert_eq!(config.metrics_prefix, "/rest/api");
        assert_eq!(config.metrics_excluded.len(), 1);
        assert_eq!(config.renew_before, Duration::from_secs(31 * 86_400));
        assert_eq!(config.https_address.port(), 443);
    }

    #[test]
    fn test_missing_required_settings() {
        let mut config = base();
        config.email = "  ".to_string();
        assert!(matches!(config.validated(), Err(ConfigError::MissingEmail)));

        let mut config = base();
        config.domains.clear();
        assert!(matches!(config.validated(), Err(ConfigError::MissingDomains)));

        let mut config = base();
        config.upstream.clear();
        assert!(matches!(config.validated(), Err(ConfigError::MissingUpstream)));
    }

    #[test]
    fn test_invalid_email() {
        let mut config = base();
        config.email = "not-an-email".to_string();
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_upstream() {
        let mut config = base();
        config.upstream = "ftp://files.example.com".to_string();
        assert!(matches!(
            config.validated(),
            Err(ConfigError::InvalidUpstream { .. })
        ));

        let mut config = base();
        config.upstream = "not a url".to_string();
        assert!(matches!(
            config.validated(),
            Err(ConfigError::InvalidUpstream { .. })
        ));
    }

    #[test]
    fn test_invalid_domain() {
        let mut config = base();
        config.domains = vec!["https://example.com".to_string()];
        assert!(matches!(config.validated(), Err(ConfigError::InvalidDomain(_))));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let mut config = base();
        config.metrics.excluded = vec!["/rest/[".to_string()];
        assert!(matches!(
            config.validated(),
            Err(ConfigError::InvalidExclude { .. })
        ));
    }

    #[test]
    fn test_prefix_is_canonicalized() {
        for raw in ["rest/api", "rest/api/", "/rest/api", " /rest/api// "] {
            let mut config = base();
            config.metrics.prefix = raw.to_string();
            assert_eq!(config.validated().unwrap().metrics_prefix, "/rest/api");
        }

        let mut config = base();
        config.metrics.prefix = "/".to_string();
        assert_eq!(config.validated().unwrap().metrics_prefix, "");
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = base();
        config.listeners.metrics = "localhost".to_string();
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("metrics"));
    }

    #[test]
    fn test_zero_renewal_window_rejected() {
        let mut config = base();
        config.acme.renew_before_days = 0;
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_body_limit_rejected() {
        let mut config = base();
        config.max_body_bytes = 0;
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));

        assert_eq!(base().validated().unwrap().max_body_bytes, 32 << 20);
    }

    #[test]
    fn test_zero_cache_budget_rejected() {
        let mut config = base();
        config.cache.max_bytes = 0;
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));
    }
}
