//! TLS certificate probe
//!
//! The handshake always completes so the peer certificate can be captured
//! even when it would not validate. Whether the chain is trusted by the
//! system roots is recorded next to the certificate fields.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use super::Prober;
use crate::constants::{FAILED, OK};
use crate::error::ProbeError;
use crate::model::{CertRecord, ProbeValue};

/// TLS material shared by every handshake of a run.
pub(crate) struct TlsContext {
    provider: Arc<CryptoProvider>,
    roots: Option<Arc<WebPkiServerVerifier>>,
}

impl TlsContext {
    pub(crate) fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            store.add(cert).ok();
        }
        if let Some(err) = native.errors.first() {
            warn!("Failed to load some native root certificates: {}", err);
        }

        let roots = match WebPkiServerVerifier::builder_with_provider(Arc::new(store), provider.clone())
            .build()
        {
            Ok(verifier) => Some(verifier),
            Err(err) => {
                warn!(%err, "No usable root store, certificates will be reported untrusted");
                None
            }
        };

        Self { provider, roots }
    }
}

/// Accepts every certificate while remembering whether the system roots
/// would have. Handshake signatures are still checked.
#[derive(Debug)]
struct RecordingVerifier {
    roots: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    trusted: OnceLock<bool>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let trusted = self.roots.as_ref().map_or(false, |roots| {
            roots
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .is_ok()
        });
        let _ = self.trusted.set(trusted);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Summarise a DER certificate as a JSON record.
pub fn describe_certificate(der: &[u8], trusted: bool) -> Result<serde_json::Value, ProbeError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ProbeError::Malformed(format!("certificate: {}", e)))?;

    let mut alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => alt_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    let ip = match bytes.len() {
                        4 => <[u8; 4]>::try_from(*bytes).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(*bytes).ok().map(IpAddr::from),
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        alt_names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let validity = cert.validity();
    Ok(serde_json::json!({
        "subject": cert.subject().to_string(),
        "issuer": cert.issuer().to_string(),
        "serial": cert.raw_serial_as_string(),
        "not_before": validity.not_before.to_string(),
        "not_after": validity.not_after.to_string(),
        "subject_alt_names": alt_names,
        "trusted": trusted,
    }))
}

impl Prober {
    /// TCP connect plus TLS handshake to `addr:port` with SNI `domain`.
    /// Returns the stream and whether the system roots trust the peer.
    pub(crate) async fn tls_connect(
        &self,
        domain: &str,
        addr: IpAddr,
        port: u16,
    ) -> Result<(TlsStream<TcpStream>, bool), ProbeError> {
        let verifier = Arc::new(RecordingVerifier {
            roots: self.tls.roots.clone(),
            algorithms: self.tls.provider.signature_verification_algorithms,
            trusted: OnceLock::new(),
        });

        let config = ClientConfig::builder_with_provider(self.tls.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProbeError::Unclassified(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ProbeError::Malformed(format!("invalid server name {}: {:?}", domain, e)))?;

        let deadline = self.settings.tls_timeout;
        let tcp = tokio::time::timeout(deadline, TcpStream::connect((addr, port)))
            .await
            .map_err(|_| ProbeError::Timeout(deadline))??;
        let stream = tokio::time::timeout(deadline, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProbeError::Timeout(deadline))??;

        let trusted = verifier.trusted.get().copied().unwrap_or(false);
        Ok((stream, trusted))
    }

    async fn fetch_certificate(
        &self,
        domain: &str,
        addr: IpAddr,
        port: u16,
    ) -> Result<serde_json::Value, ProbeError> {
        let (stream, trusted) = self.tls_connect(domain, addr, port).await?;
        let (_, session) = stream.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ProbeError::Malformed("no peer certificate".into()))?;
        describe_certificate(leaf.as_ref(), trusted)
    }

    /// Capture the peer certificate. `port` is `None` when the target is
    /// not served over HTTPS, which reports "Failed" without connecting.
    pub async fn certificate(&self, domain: &str, addr: IpAddr, port: Option<u16>) -> CertRecord {
        let Some(port) = port else {
            return CertRecord { status: ProbeValue::text(FAILED), content: ProbeValue::na() };
        };

        match self.fetch_certificate(domain, addr, port).await {
            Ok(content) => CertRecord {
                status: ProbeValue::text(OK),
                content: ProbeValue::Record(content),
            },
            Err(err) => {
                debug!(domain, %addr, port, %err, "Certificate probe failed");
                CertRecord::unavailable()
            }
        }
    }
}
