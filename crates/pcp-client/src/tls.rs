//! TLS context construction from PEM files (§4.1, §6).
//!
//! Builds a `rustls::ClientConfig` with TLSv1.2+, client certificate
//! authentication, CA verification, and an optional CRL. Wired into
//! `tokio_tungstenite::Connector::Rustls` by `Connection::connect`.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Once};

use pcp_protocol::error::{PcpError, Result};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};

static INSTALL_PROVIDER: Once = Once::new();

/// Installs the process-wide default `rustls` crypto provider exactly
/// once. `rustls::ClientConfig::builder()` panics if no provider has been
/// installed; every TLS-context construction path goes through here first.
fn ensure_crypto_provider_installed() {
    INSTALL_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn config_err(context: &str, path: &Path, detail: impl std::fmt::Display) -> PcpError {
    PcpError::ConnectionConfig(format!("{context} '{}': {detail}", path.display()))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).map_err(|e| config_err("certificate file does not exist", path, e))?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_err("certificate file is invalid", path, e))?;
    if certs.is_empty() {
        return Err(config_err(
            "certificate file contains no certificates",
            path,
            "empty PEM",
        ));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).map_err(|e| config_err("key file does not exist", path, e))?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| config_err("key file is invalid", path, e))?
        .ok_or_else(|| {
            config_err(
                "key file contains no recognizable private key",
                path,
                "it may be password-protected, which this client does not support",
            )
        })
}

fn load_crl(path: &Path) -> Result<CertificateRevocationListDer<'static>> {
    let data = fs::read(path).map_err(|e| config_err("CRL file is unreadable", path, e))?;
    Ok(CertificateRevocationListDer::from(data))
}

/// Builds the TLS client configuration used for every broker connection
/// attempt: CA-verified, client-cert-authenticated, TLSv1.2+, with RFC 2818
/// hostname verification performed by the default `rustls` webpki verifier.
pub fn build_client_config(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
    crl_path: Option<&Path>,
) -> Result<Arc<rustls::ClientConfig>> {
    ensure_crypto_provider_installed();

    let ca_certs = load_certs(ca_path)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| config_err("CA bundle contains an invalid certificate", ca_path, e))?;
    }
    let roots = Arc::new(roots);

    let mut verifier_builder = rustls::client::WebPkiServerVerifier::builder(roots);
    if let Some(crl_path) = crl_path {
        verifier_builder = verifier_builder.with_crls(vec![load_crl(crl_path)?]);
    }
    let verifier = verifier_builder
        .build()
        .map_err(|e| PcpError::ConnectionConfig(format!("building TLS verifier: {e}")))?;

    let client_certs = load_certs(cert_path)?;
    let client_key = load_private_key(key_path)?;

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .dangerous()
    .with_custom_certificate_verifier(verifier)
    .with_client_auth_cert(client_certs, client_key)
    .map_err(|e| PcpError::ConnectionConfig(format!("client key does not pair with cert: {e}")))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn load_certs_fails_on_missing_file() {
        let err = load_certs(Path::new("/nonexistent/path.pem")).unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }

    #[test]
    fn load_certs_fails_on_unparseable_content() {
        let file = write_temp(b"not a certificate");
        let err = load_certs(file.path()).unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }

    #[test]
    fn load_private_key_fails_on_missing_file() {
        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }
}
