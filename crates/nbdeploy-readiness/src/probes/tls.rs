//! TLS certificate probe
//!
//! The reverse proxy obtains its certificate from Let's Encrypt on its own,
//! which only works once public DNS points at the new server. Each attempt
//! walks the same path a browser would and reports the first step that is
//! not there yet:
//!
//! 1. DNS for the domain resolves to the server's address
//! 2. TCP connect to 443
//! 3. TLS handshake verified against the webpki roots, which also rejects a
//!    leaf outside its `notBefore`/`notAfter` window
//! 4. Leaf certificate inside that window, checked again after the handshake
//! 5. HTTPS request answered with a success or redirect status

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nbdeploy_common::DeploymentTarget;
use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::probe::{ConditionProbe, ProbeResult};

/// Failure building the probe's TLS client
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Validity window of a served certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertValidity {
    pub subject: String,
    pub not_before: i64,
    pub not_after: i64,
    /// `notAfter` in the certificate's own notation, for display
    pub expires: String,
}

/// Check that a DER certificate is valid at `now` (seconds since the epoch)
pub fn inspect_certificate(der: &[u8], now: i64) -> Result<CertValidity, String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| format!("unparseable certificate: {}", e))?;
    let validity = cert.validity();

    if now < validity.not_before.timestamp() {
        return Err(format!("certificate not valid before {}", validity.not_before));
    }
    if now > validity.not_after.timestamp() {
        return Err(format!("certificate expired at {}", validity.not_after));
    }
    Ok(CertValidity {
        subject: cert.subject().to_string(),
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
        expires: validity.not_after.to_string(),
    })
}

/// Ready once the domain serves a currently valid, trusted certificate
pub struct TlsCertProbe {
    port: u16,
    timeout: Duration,
    config: Arc<ClientConfig>,
}

impl TlsCertProbe {
    /// Probe port 443 trusting the Mozilla root set
    pub fn new() -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Probe port 443 trusting only `roots`
    pub fn with_roots(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            port: 443,
            timeout: Duration::from_secs(10),
            config: Arc::new(config),
        })
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bound each network step of an attempt
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn dns_points_at(&self, domain: &str, address: IpAddr) -> Result<(), ProbeResult> {
        let resolved: Vec<IpAddr> = match tokio::time::timeout(
            self.timeout,
            tokio::net::lookup_host((domain, self.port)),
        )
        .await
        {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
            Ok(Err(e)) => {
                return Err(ProbeResult::pending(format!(
                    "DNS lookup for {} failed: {}",
                    domain, e
                )))
            }
            Err(_) => return Err(ProbeResult::pending(format!("DNS lookup for {} timed out", domain))),
        };

        if resolved.contains(&address) {
            Ok(())
        } else {
            let shown: Vec<String> = resolved.iter().map(IpAddr::to_string).collect();
            Err(ProbeResult::pending(format!(
                "DNS for {} resolves to [{}], not {} yet",
                domain,
                shown.join(", "),
                address
            )))
        }
    }

    async fn served_certificate(&self, domain: &str, addr: SocketAddr) -> Result<CertValidity, ProbeResult> {
        let tcp = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ProbeResult::pending(format!(
                    "connection refused on port {}, proxy not up yet",
                    self.port
                )))
            }
            Ok(Err(e)) => return Err(ProbeResult::pending(format!("port {} unreachable: {}", self.port, e))),
            Err(_) => {
                return Err(ProbeResult::pending(format!(
                    "connection to port {} timed out",
                    self.port
                )))
            }
        };

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ProbeResult::permanent(format!("invalid domain {}: {}", domain, e)))?;
        let connector = TlsConnector::from(self.config.clone());
        let tls = match tokio::time::timeout(self.timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(handshake_failure(domain, &e)),
            Err(_) => return Err(ProbeResult::pending("TLS handshake timed out")),
        };

        let (_, session) = tls.get_ref();
        let Some(leaf) = session.peer_certificates().and_then(|certs| certs.first()) else {
            return Err(ProbeResult::pending("handshake succeeded but no certificate was presented"));
        };
        inspect_certificate(leaf.as_ref(), unix_now()).map_err(ProbeResult::pending)
    }

    async fn https_status(&self, domain: &str, addr: SocketAddr) -> Result<u16, ProbeResult> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(ClientConfig::clone(&self.config))
            .resolve(domain, addr)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeResult::pending(format!("http client: {}", e)))?;
        let url = if self.port == 443 {
            format!("https://{}/", domain)
        } else {
            format!("https://{}:{}/", domain, self.port)
        };
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeResult::pending(format!("HTTPS request failed: {}", e)))?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(status.as_u16())
        } else {
            Err(ProbeResult::pending(format!("HTTPS answered {}", status)))
        }
    }
}

#[async_trait]
impl ConditionProbe for TlsCertProbe {
    async fn check(&self, target: &DeploymentTarget) -> ProbeResult {
        let Some(domain) = target.domain_name() else {
            return ProbeResult::permanent("no domain configured for the deployment");
        };
        let Some(address) = target.address() else {
            return ProbeResult::permanent(format!(
                "address of {} is not known; the server must be running first",
                target.server_name()
            ));
        };

        if let Err(pending) = self.dns_points_at(domain, address).await {
            return pending;
        }
        let addr = SocketAddr::new(address, self.port);
        let cert = match self.served_certificate(domain, addr).await {
            Ok(cert) => cert,
            Err(result) => return result,
        };
        debug!(domain = %domain, subject = %cert.subject, expires = %cert.expires, "Certificate served");

        match self.https_status(domain, addr).await {
            Ok(status) => ProbeResult::ready(format!(
                "certificate valid until {}, HTTPS {}",
                cert.expires, status
            )),
            Err(result) => result,
        }
    }

    fn manual_command(&self, target: &DeploymentTarget) -> String {
        let domain = target.domain_name().unwrap_or("<domain>");
        format!(
            "openssl s_client -connect {}:{} -servername {} </dev/null | openssl x509 -noout -dates",
            domain, self.port, domain
        )
    }
}

/// Describe a failed handshake by what the served certificate got wrong
fn handshake_failure(domain: &str, err: &io::Error) -> ProbeResult {
    let cert_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .and_then(|e| match e {
            rustls::Error::InvalidCertificate(cert) => Some(cert),
            _ => None,
        });

    match cert_error {
        Some(CertificateError::Expired | CertificateError::ExpiredContext { .. }) => {
            ProbeResult::pending(format!(
                "served certificate for {} has expired, renewal has not happened yet",
                domain
            ))
        }
        Some(CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. }) => {
            ProbeResult::pending(format!(
                "served certificate for {} is not valid yet, check the server clock",
                domain
            ))
        }
        Some(CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }) => {
            ProbeResult::pending(format!("served certificate does not cover {}", domain))
        }
        Some(CertificateError::UnknownIssuer) => ProbeResult::pending(
            "served certificate is not publicly trusted, certificate not issued yet",
        ),
        _ => ProbeResult::pending(format!(
            "TLS handshake failed ({}), certificate not issued yet",
            err
        )),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
