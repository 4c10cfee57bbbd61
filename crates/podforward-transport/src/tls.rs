//! rustls client configuration built from [`TlsMaterial`]

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::config::TlsMaterial;
use crate::error::{TransportError, TransportResult};

/// Build a rustls TlsConnector for the API server
pub fn build_tls_connector(material: &TlsMaterial) -> TransportResult<TlsConnector> {
    ensure_crypto_provider();

    let builder = if material.insecure_skip_tls_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
    } else {
        let mut roots = rustls::RootCertStore::empty();

        match material.ca_data.as_deref() {
            Some(pem) => {
                for cert in parse_certs(pem)? {
                    roots.add(cert).map_err(|e| {
                        TransportError::TlsError(format!("Invalid CA certificate: {}", e))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let client_crypto = match (
        material.client_certificate_data.as_deref(),
        material.client_key_data.as_deref(),
    ) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = parse_certs(cert_pem)?;
            let key = parse_private_key(key_pem)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                TransportError::TlsError(format!("Invalid client certificate/key: {}", e))
            })?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TransportError::ConfigurationError(
                "client certificate and client key must be supplied together".to_string(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(client_crypto)))
}

/// Resolve the TLS server name for a host, honouring an explicit override
pub fn server_name(host: &str, override_name: Option<&str>) -> TransportResult<ServerName<'static>> {
    let name = override_name.unwrap_or(host);
    // url::Url keeps IPv6 hosts bracketed
    let name = name.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(name.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name '{}': {}", name, e)))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn parse_certs(pem: &str) -> TransportResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(
            "No certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> TransportResult<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connector_uses_webpki_roots() {
        assert!(build_tls_connector(&TlsMaterial::default()).is_ok());
    }

    #[test]
    fn test_insecure_connector() {
        let material = TlsMaterial {
            insecure_skip_tls_verify: true,
            ..Default::default()
        };
        assert!(build_tls_connector(&material).is_ok());
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let material = TlsMaterial {
            ca_data: Some("not a certificate".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_tls_connector(&material),
            Err(TransportError::TlsError(_))
        ));
    }

    #[test]
    fn test_key_without_certificate_is_rejected() {
        let material = TlsMaterial {
            client_key_data: Some("key".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_tls_connector(&material),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(server_name("cluster.example", None).is_ok());
        assert!(server_name("10.0.0.1", None).is_ok());
        assert!(server_name("[::1]", None).is_ok());
        assert!(matches!(
            server_name("10.0.0.1", Some("kubernetes.default.svc")).unwrap(),
            ServerName::DnsName(_)
        ));
    }
}
