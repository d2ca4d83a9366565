//! TLS material loading and peer-identity extraction.

use keywarden_core::config::ServerConfig;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> KeywardenResult<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(KeywardenError::Io)?;
    if certs.is_empty() {
        return Err(KeywardenError::Invalid(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first PEM private key in the file.
pub fn load_private_key(path: &Path) -> KeywardenResult<PrivateKeyDer<'static>> {
    let pem = fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(KeywardenError::Io)?
        .ok_or_else(|| {
            KeywardenError::Invalid(format!("no private key found in {}", path.display()))
        })
}

/// Build the listener-side TLS configuration. Client verification is wired
/// in when the server is configured with a CA bundle.
pub fn build_acceptor(config: &ServerConfig) -> KeywardenResult<TlsAcceptor> {
    let cert_path = config.tls_cert.as_deref().ok_or_else(|| {
        KeywardenError::Invalid("TLS_CERT is not configured; run init-server first".into())
    })?;
    let key_path = config.tls_key.as_deref().ok_or_else(|| {
        KeywardenError::Invalid("TLS_KEY is not configured; run init-server first".into())
    })?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let tls_config = if config.tls_validate_client {
        let ca_path = config.tls_ca.as_deref().ok_or_else(|| {
            KeywardenError::Invalid("TLS_VALIDATE_CLIENT requires TLS_CA".into())
        })?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert).map_err(|err| {
                KeywardenError::Invalid(format!("bad CA certificate in {}: {err}", ca_path.display()))
            })?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| {
                KeywardenError::Invalid(format!("client verifier setup failed: {err}"))
            })?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
    }
    .map_err(|err| KeywardenError::Invalid(format!("TLS configuration rejected: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Client identity from a verified leaf certificate: the first DNS SAN, or
/// failing that the first IP SAN.
pub fn peer_identity(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    let san = cert.subject_alternative_name().ok()??;

    let mut first_ip = None;
    for name in &san.value.general_names {
        match name {
            GeneralName::DNSName(dns) => return Some(dns.to_string()),
            GeneralName::IPAddress(bytes) if first_ip.is_none() => {
                first_ip = format_ip_address(bytes);
            }
            _ => {}
        }
    }
    first_ip
}

fn format_ip_address(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_san_formatting() {
        assert_eq!(
            format_ip_address(&[10, 0, 0, 5]).unwrap(),
            "10.0.0.5".to_string()
        );
        assert_eq!(format_ip_address(&[0u8; 16]).unwrap(), "::".to_string());
        assert!(format_ip_address(&[1, 2, 3]).is_none());
    }

    #[test]
    fn missing_tls_material_is_a_config_error() {
        let config = ServerConfig::from_sysconfig(&Default::default()).unwrap();
        assert!(build_acceptor(&config).is_err());
    }
}
