//! Upstream certificate checks for `--insecure`
//!
//! Verification is only skipped for upstreams on private or loopback
//! addresses. Host names count as private when every address they last
//! resolved to is private; anything else goes through the webpki verifier.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use portico_common::KeyedStore;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::trace;

use super::BoxError;

/// Addresses each upstream host name last resolved to
pub type ResolvedHosts = KeyedStore<String, Vec<IpAddr>>;

/// Private ranges (10/8, 172.16/12, 192.168/16, fc00::/7) plus loopback
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| v4.is_private() || v4.is_loopback())
        }
    }
}

/// System resolver that remembers what each name resolved to
#[derive(Debug, Default)]
pub struct RecordingResolver {
    hosts: Arc<ResolvedHosts>,
}

impl RecordingResolver {
    pub fn new(hosts: Arc<ResolvedHosts>) -> Self {
        Self { hosts }
    }
}

impl Resolve for RecordingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let hosts = Arc::clone(&self.hosts);
        let host = name.as_str().to_ascii_lowercase();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
            hosts.insert(host, addrs.iter().map(SocketAddr::ip).collect());
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Skips chain and name checks for private upstreams only
#[derive(Debug)]
pub struct PrivateUpstreamVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    hosts: Arc<ResolvedHosts>,
}

impl PrivateUpstreamVerifier {
    pub fn new(webpki: Arc<WebPkiServerVerifier>, hosts: Arc<ResolvedHosts>) -> Self {
        Self { webpki, hosts }
    }

    fn is_private_upstream(&self, server_name: &ServerName<'_>) -> bool {
        match server_name {
            ServerName::IpAddress(ip) => is_private(IpAddr::from(*ip)),
            ServerName::DnsName(name) => self
                .hosts
                .get(&name.as_ref().to_ascii_lowercase())
                .is_some_and(|addrs| !addrs.is_empty() && addrs.iter().copied().all(is_private)),
            _ => false,
        }
    }
}

impl ServerCertVerifier for PrivateUpstreamVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.is_private_upstream(server_name) {
            trace!(server_name = ?server_name, "Skipping certificate verification for private upstream");
            return Ok(ServerCertVerified::assertion());
        }
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}
