//! Client identity: certificate material and the derived PCP URI (§3, §6).

use std::path::{Path, PathBuf};

use pcp_protocol::constants::{
    DEFAULT_ASSOCIATION_TIMEOUT_S, DEFAULT_CHECK_INTERVAL_S, DEFAULT_PONG_TIMEOUTS_BEFORE_RETRY,
    DEFAULT_WS_CONNECTION_TIMEOUT_MS, DEFAULT_WS_PONG_TIMEOUT_MS,
};
use pcp_protocol::error::{PcpError, Result};

use crate::tls;

const PCP_URI_SCHEME: &str = "pcp://";

/// Connection tuning knobs carried alongside the identity (§3).
#[derive(Debug, Clone)]
pub struct ConnectionTimeouts {
    pub ws_connection_timeout_ms: u64,
    pub ws_pong_timeout_ms: u64,
    pub pong_timeouts_before_retry: u32,
    pub assoc_timeout_s: u64,
    pub check_interval_s: u64,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            ws_connection_timeout_ms: DEFAULT_WS_CONNECTION_TIMEOUT_MS,
            ws_pong_timeout_ms: DEFAULT_WS_PONG_TIMEOUT_MS,
            pong_timeouts_before_retry: DEFAULT_PONG_TIMEOUTS_BEFORE_RETRY,
            assoc_timeout_s: DEFAULT_ASSOCIATION_TIMEOUT_S,
            check_interval_s: DEFAULT_CHECK_INTERVAL_S,
        }
    }
}

/// Certificate material plus the identity derived from it. Built once via
/// [`ClientIdentity::new`] and immutable thereafter.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_type: String,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub crl_path: Option<PathBuf>,
    pub proxy_uri: Option<String>,
    pub common_name: String,
    pub uri: String,
    pub timeouts: ConnectionTimeouts,
}

/// Extracts the value of the first RDN attribute of a certificate's subject,
/// rather than specifically a `CN`-tagged attribute. Diverges from a strict
/// "common name attribute" reading only for the atypical case of a
/// multi-RDN subject whose first attribute isn't `CN`.
fn first_rdn_value(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(cert_der)
        .map_err(|e| PcpError::ConnectionConfig(format!("certificate is invalid: {e}")))?;
    let subject = cert.subject();
    let first_attr = subject
        .iter_rdn()
        .next()
        .and_then(|rdn| rdn.iter().next())
        .ok_or_else(|| {
            PcpError::ConnectionConfig(
                "failed to retrieve the client common name from the certificate".into(),
            )
        })?;
    first_attr
        .as_str()
        .map(str::to_string)
        .map_err(|e| PcpError::ConnectionConfig(format!("certificate subject name is not a string: {e}")))
}

fn common_name_from_cert_file(cert_path: &Path) -> Result<String> {
    let pem_bytes = std::fs::read(cert_path).map_err(|e| {
        PcpError::ConnectionConfig(format!(
            "certificate file '{}' does not exist: {e}",
            cert_path.display()
        ))
    })?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes).map_err(|e| {
        PcpError::ConnectionConfig(format!(
            "certificate file '{}' is invalid: {e}",
            cert_path.display()
        ))
    })?;
    first_rdn_value(&pem.contents)
}

impl ClientIdentity {
    /// Loads certificate material, derives the common name and PCP URI, and
    /// validates that the private key pairs with the certificate by
    /// constructing a TLS client configuration from them.
    ///
    /// Fails with `ConnectionConfig` if the cert file is missing or
    /// unparseable, the key file is missing or password-protected, or the
    /// key does not pair with the certificate.
    pub fn new(
        client_type: impl Into<String>,
        ca_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client_type = client_type.into();
        let ca_path = ca_path.into();
        let cert_path = cert_path.into();
        let key_path = key_path.into();

        let common_name = common_name_from_cert_file(&cert_path)?;
        let uri = format!("{PCP_URI_SCHEME}{common_name}/{client_type}");

        // Validates the key/cert pairing as a side effect; the resulting
        // config itself is rebuilt per-connection by `Connection::connect`
        // (so CRL/CA files are re-read for a freshly rotated CRL on every
        // reconnect) rather than cached here.
        tls::build_client_config(&ca_path, &cert_path, &key_path, None)?;

        Ok(Self {
            client_type,
            ca_path,
            cert_path,
            key_path,
            crl_path: None,
            proxy_uri: None,
            common_name,
            uri,
            timeouts: ConnectionTimeouts::default(),
        })
    }

    pub fn with_crl_path(mut self, crl_path: impl Into<PathBuf>) -> Result<Self> {
        let crl_path = crl_path.into();
        if !crl_path.is_file() {
            return Err(PcpError::ConnectionConfig(format!(
                "CRL file '{}' is unreadable",
                crl_path.display()
            )));
        }
        self.crl_path = Some(crl_path);
        Ok(self)
    }

    pub fn with_proxy_uri(mut self, proxy_uri: impl Into<String>) -> Self {
        self.proxy_uri = Some(proxy_uri.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builds the TLS client config for a connection attempt, re-reading
    /// cert/key/CA/CRL files from disk so a rotated CRL takes effect on the
    /// next reconnect without restarting the process.
    pub fn build_tls_config(&self) -> Result<std::sync::Arc<rustls::ClientConfig>> {
        tls::build_client_config(
            &self.ca_path,
            &self.cert_path,
            &self.key_path,
            self.crl_path.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // A short-lived self-signed certificate/key pair, generated once for
    // these tests. CN=test-client.example.com.
    const TEST_CERT: &str = include_str!("../testdata/client.crt");
    const TEST_KEY: &str = include_str!("../testdata/client.key");
    const TEST_CA: &str = include_str!("../testdata/ca.crt");

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn construction_fails_on_missing_cert() {
        let key = write_temp(TEST_KEY);
        let ca = write_temp(TEST_CA);
        let err = ClientIdentity::new(
            "agent",
            ca.path(),
            "/nonexistent/cert.pem",
            key.path(),
        )
        .unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }

    #[test]
    fn construction_derives_uri_from_common_name() {
        let cert = write_temp(TEST_CERT);
        let key = write_temp(TEST_KEY);
        let ca = write_temp(TEST_CA);
        let identity = ClientIdentity::new("agent", ca.path(), cert.path(), key.path()).unwrap();
        assert_eq!(identity.common_name, "test-client.example.com");
        assert_eq!(identity.uri, "pcp://test-client.example.com/agent");
    }

    #[test]
    fn crl_path_must_exist() {
        let cert = write_temp(TEST_CERT);
        let key = write_temp(TEST_KEY);
        let ca = write_temp(TEST_CA);
        let identity = ClientIdentity::new("agent", ca.path(), cert.path(), key.path()).unwrap();
        let err = identity.with_crl_path("/nonexistent/crl.pem").unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }
}
