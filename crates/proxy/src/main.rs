//! Portico - Main entry point
//!
//! Drop-in HTTPS reverse proxy with automatic ACME certificates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portico_common::{MetricsSink, PrometheusSink};
use portico_config::{
    default_max_body_bytes, split_list, AcmeSettings, CacheSettings, GatewayConfig, ListenerAddresses,
    MetricsLabelConfig, ValidatedConfig, LETSENCRYPT_PRODUCTION,
};
use portico_proxy::server::{serve_challenges, serve_https, serve_metrics, tls_config};
use portico_proxy::{
    AccountIdentity, CertificateStorage, CertificateStore, ChallengeResponder, Forwarder,
    InstantAcmeClient, Instrumented, PathNormalizer, ResponseCache, StoreSettings,
    UpstreamTransport,
};

/// Portico - Drop-in HTTPS reverse proxy with automatic certificates
#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upstream base URL requests are forwarded to
    #[arg(long, env = "PORTICO_UPSTREAM")]
    upstream: Option<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "PORTICO_EMAIL")]
    email: Option<String>,

    /// Comma-separated domains certificates may be issued for
    #[arg(long, env = "PORTICO_DOMAINS")]
    domains: Option<String>,

    /// Skip certificate verification of an HTTPS upstream
    #[arg(long, env = "PORTICO_INSECURE")]
    insecure: bool,

    /// Only paths under this prefix are recorded in metrics
    #[arg(long = "metrics-prefix", env = "PORTICO_METRICS_PREFIX", default_value = "")]
    metrics_prefix: String,

    /// Keep the first path segment after the prefix as an API version
    #[arg(long = "metrics-has-version", env = "PORTICO_METRICS_HAS_VERSION")]
    metrics_has_version: bool,

    /// Comma-separated path globs never recorded in metrics
    #[arg(long, env = "PORTICO_EXCLUDED", default_value = "")]
    excluded: String,

    /// ACME directory URL
    #[arg(long = "acme-directory", env = "PORTICO_ACME_DIRECTORY", default_value = LETSENCRYPT_PRODUCTION)]
    acme_directory: String,

    /// Directory holding the account and certificate records
    #[arg(long, env = "PORTICO_STORAGE", default_value = "/var/lib/portico")]
    storage: PathBuf,

    /// Renew certificates expiring within this many days
    #[arg(long = "renew-before-days", env = "PORTICO_RENEW_BEFORE_DAYS", default_value_t = 31)]
    renew_before_days: u32,

    /// HTTPS listen address
    #[arg(long = "https-address", env = "PORTICO_HTTPS_ADDRESS", default_value = "0.0.0.0:443")]
    https_address: String,

    /// Plaintext listen address for ACME challenges and redirects
    #[arg(long = "http-address", env = "PORTICO_HTTP_ADDRESS", default_value = "0.0.0.0:80")]
    http_address: String,

    /// Metrics listen address
    #[arg(long = "metrics-address", env = "PORTICO_METRICS_ADDRESS", default_value = "0.0.0.0:9001")]
    metrics_address: String,

    /// Response cache budget in bytes
    #[arg(long = "cache-max-bytes", env = "PORTICO_CACHE_MAX_BYTES", default_value_t = 1 << 30)]
    cache_max_bytes: u64,

    /// Largest request body forwarded upstream, in bytes
    #[arg(long = "max-body-bytes", env = "PORTICO_MAX_BODY_BYTES", default_value_t = default_max_body_bytes())]
    max_body_bytes: u64,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", env = "PORTICO_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            upstream: self.upstream.unwrap_or_default(),
            email: self.email.unwrap_or_default(),
            domains: self.domains.as_deref().map(split_list).unwrap_or_default(),
            insecure_upstream: self.insecure,
            metrics: MetricsLabelConfig {
                prefix: self.metrics_prefix,
                has_version: self.metrics_has_version,
                excluded: split_list(&self.excluded),
            },
            acme: AcmeSettings {
                directory: self.acme_directory,
                storage_path: self.storage,
                renew_before_days: self.renew_before_days,
            },
            listeners: ListenerAddresses {
                https: self.https_address,
                http: self.http_address,
                metrics: self.metrics_address,
            },
            max_body_bytes: self.max_body_bytes,
            cache: CacheSettings {
                max_bytes: self.cache_max_bytes,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = cli
        .into_config()
        .validated()
        .context("Configuration validation failed")?;

    run(config).await
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Run the gateway until a shutdown signal arrives
async fn run(config: ValidatedConfig) -> Result<()> {
    let storage = Arc::new(
        CertificateStorage::new(&config.storage_path)
            .context("Failed to prepare certificate storage")?,
    );
    let identity = AccountIdentity::load_or_create(&storage, &config.email)
        .context("Failed to load ACME account identity")?;

    let challenges = ChallengeResponder::new();
    let client = InstantAcmeClient::new(config.acme_directory.as_str(), storage.clone());
    let store = CertificateStore::new(
        StoreSettings {
            allowed_domains: config.domains.clone(),
            renew_before: config.renew_before,
        },
        client,
        identity,
        storage,
        challenges.clone(),
    )
    .context("Failed to create certificate store")?;
    store
        .register()
        .await
        .context("Failed to register ACME account")?;

    let sink = Arc::new(PrometheusSink::new().context("Failed to create metrics registry")?);
    let metrics: Arc<dyn MetricsSink> = sink.clone();
    let normalizer = Arc::new(
        PathNormalizer::new(
            &config.metrics_prefix,
            config.metrics_has_version,
            config.metrics_excluded.clone(),
        )
        .context("Failed to create path normalizer")?,
    );

    let upstream = UpstreamTransport::new(config.insecure_upstream)
        .context("Failed to create upstream transport")?;
    let transport = ResponseCache::new(
        Instrumented::new(upstream, normalizer, metrics.clone()),
        config.cache_max_bytes,
        metrics,
    );
    let forwarder = Arc::new(
        Forwarder::new(config.upstream.clone(), transport).with_body_limit(config.max_body_bytes),
    );
    let tls = tls_config(Arc::new(store)).context("Failed to build TLS configuration")?;

    let https = bind(config.https_address, "HTTPS").await?;
    let http = bind(config.http_address, "HTTP").await?;
    let metrics_listener = bind(config.metrics_address, "metrics").await?;

    info!(
        upstream = %config.upstream,
        domains = ?config.domains,
        "Portico started successfully"
    );

    tokio::select! {
        result = serve_https(https, tls, forwarder) => result.context("HTTPS listener failed")?,
        result = serve_challenges(http, challenges) => result.context("HTTP listener failed")?,
        result = serve_metrics(metrics_listener, sink) => result.context("Metrics listener failed")?,
        _ = shutdown_signal() => info!("Received shutdown signal, stopping"),
    }

    Ok(())
}

async fn bind(address: std::net::SocketAddr, name: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {name} listener on {address}"))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
