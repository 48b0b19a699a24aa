//! Reachability probes against listen and backend endpoints
//!
//! Every probe carries its own short timeout so one unreachable endpoint
//! cannot stall a whole health check. Probes run sequentially; the caller
//! decides what each outcome means.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Probe timeouts
#[derive(Debug, Clone)]
pub struct EndpointChecker {
    connect_timeout: Duration,
    http_timeout: Duration,
    tls_timeout: Duration,
    http_client: reqwest::Client,
}

impl EndpointChecker {
    pub fn new() -> Self {
        let http_timeout = Duration::from_secs(10);
        let http_client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            connect_timeout: Duration::from_secs(5),
            http_timeout,
            tls_timeout: Duration::from_secs(10),
            http_client,
        }
    }

    /// Whether something is accepting TCP connections at `host:port`
    pub async fn tcp_reachable(&self, host: &str, port: u16) -> bool {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                debug!(%addr, "TCP probe connected");
                true
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "TCP probe refused");
                false
            }
            Err(_) => {
                debug!(%addr, "TCP probe timed out");
                false
            }
        }
    }

    /// GET the endpoint and record status plus latency. Any HTTP response,
    /// including an error status, proves the frontend answers.
    pub async fn http_probe(&self, endpoint: &str) -> HttpProbeResult {
        let start = Instant::now();
        match tokio::time::timeout(self.http_timeout, self.http_client.get(endpoint).send()).await
        {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                HttpProbeResult {
                    endpoint: endpoint.to_string(),
                    success: (200..400).contains(&status),
                    status: Some(status),
                    response_time_ms: Some(start.elapsed().as_millis() as u64),
                    message: format!("responded with status {status}"),
                }
            }
            Ok(Err(e)) => HttpProbeResult {
                endpoint: endpoint.to_string(),
                success: false,
                status: e.status().map(|s| s.as_u16()),
                response_time_ms: None,
                message: format!("request failed: {e}"),
            },
            Err(_) => HttpProbeResult {
                endpoint: endpoint.to_string(),
                success: false,
                status: None,
                response_time_ms: None,
                message: format!(
                    "no response within {}s",
                    self.http_timeout.as_secs()
                ),
            },
        }
    }

    /// Handshake with the endpoint and report the presented certificate's
    /// validity window. Verification is disabled on purpose: an expired or
    /// mis-issued certificate should still be inspected, not hidden behind
    /// a handshake failure.
    pub async fn certificate_status(&self, endpoint: &str) -> CertificateInfo {
        match tokio::time::timeout(self.tls_timeout, fetch_peer_certificate(endpoint)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => CertificateInfo::error(endpoint, e.to_string()),
            Err(_) => CertificateInfo::error(
                endpoint,
                format!("no TLS handshake within {}s", self.tls_timeout.as_secs()),
            ),
        }
    }
}

impl Default for EndpointChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one HTTP probe
#[derive(Debug, Clone, Serialize)]
pub struct HttpProbeResult {
    pub endpoint: String,
    pub success: bool,
    pub status: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub message: String,
}

/// Validity window of a presented server certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub endpoint: String,
    pub valid: bool,
    pub days_until_expiry: Option<i64>,
    pub not_before: Option<i64>,
    pub not_after: Option<i64>,
    pub error: Option<String>,
}

impl CertificateInfo {
    fn error(endpoint: &str, error: String) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            valid: false,
            days_until_expiry: None,
            not_before: None,
            not_after: None,
            error: Some(error),
        }
    }
}

/// Split an `https://host[:port]/...` endpoint into host and port
fn https_host_port(endpoint: &str) -> anyhow::Result<(String, u16)> {
    let rest = endpoint
        .strip_prefix("https://")
        .ok_or_else(|| anyhow::anyhow!("not an https endpoint: {endpoint}"))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((authority.to_string(), 443)),
    }
}

async fn fetch_peer_certificate(endpoint: &str) -> anyhow::Result<CertificateInfo> {
    use x509_parser::prelude::*;

    let (host, port) = https_host_port(endpoint)?;

    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {e}"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth();

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| anyhow::anyhow!("invalid server name: {host}"))?;
    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await?;

    let (_, session) = stream.get_ref();
    let cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| anyhow::anyhow!("server presented no certificate"))?;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to parse X.509 certificate: {e}"))?;

    let not_before = parsed.validity().not_before.timestamp();
    let not_after = parsed.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();
    let days_until_expiry = (not_after - now) / (24 * 60 * 60);

    Ok(CertificateInfo {
        endpoint: endpoint.to_string(),
        valid: now >= not_before && now < not_after,
        days_until_expiry: Some(days_until_expiry),
        not_before: Some(not_before),
        not_after: Some(not_after),
        error: None,
    })
}

/// Verifier that records nothing and rejects nothing; see
/// [`EndpointChecker::certificate_status`] for why verification is off.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: rustls::crypto::CryptoProvider,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_https_host_port_parsing() {
        assert_eq!(
            https_host_port("https://example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            https_host_port("https://example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            https_host_port("https://example.com:8443/path").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert!(https_host_port("http://example.com").is_err());
    }

    #[tokio::test]
    async fn test_tcp_reachable_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = EndpointChecker::new();

        assert!(checker.tcp_reachable("127.0.0.1", port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_tcp_unreachable_closed_port() {
        // bind then drop to get a port that is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = EndpointChecker::new();
        assert!(!checker.tcp_reachable("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = EndpointChecker::new();
        let result = checker
            .http_probe(&format!("http://127.0.0.1:{port}"))
            .await;
        assert!(!result.success);
        assert!(result.status.is_none());
    }
}
