//! Certificate loading and mTLS configuration.
//!
//! The server and every client load their materials from a single
//! certificate directory: `ca.crt` plus `⟨name⟩.crt`/`⟨name⟩.key`, where the
//! server's name is fixed to `server` and clients are named after their
//! certificate (e.g. `alice.crt`). Both sides verify the peer against the
//! shared CA.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

const CA_CERT_FILE: &str = "ca.crt";
const SERVER_NAME: &str = "server";

/// Domain name clients expect in the server certificate.
const SERVER_DOMAIN: &str = "localhost";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("failed to read certificate material: {0}")]
    Io(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic: one identity
/// (certificate + private key) and the CA bundle used to verify peers.
#[derive(Clone)]
pub struct TlsMaterial {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsMaterial {
    /// Load the server's identity and the client CA from `cert_dir`.
    pub async fn load_server(cert_dir: &Path) -> Result<Self, TlsError> {
        Self::load(cert_dir, SERVER_NAME).await
    }

    /// Load a client's identity (named certificate pair) and the server CA
    /// from `cert_dir`.
    pub async fn load_client(cert_dir: &Path, client_name: &str) -> Result<Self, TlsError> {
        Self::load(cert_dir, client_name).await
    }

    async fn load(cert_dir: &Path, name: &str) -> Result<Self, TlsError> {
        let cert_path = cert_dir.join(format!("{name}.crt"));
        let key_path = cert_dir.join(format!("{name}.key"));
        let ca_path = cert_dir.join(CA_CERT_FILE);

        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path));
        }
        if !ca_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_path));
        }

        let cert_pem = fs::read(&cert_path).await?;
        let key_pem = fs::read(&key_path).await?;
        let ca_pem = fs::read(&ca_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server-side config: presents the server identity and requires clients
    /// to present a certificate signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client-side config: presents the client identity and verifies the
    /// server certificate against the CA.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(SERVER_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_reports_missing_cert_first() {
        let dir = tempfile::tempdir().unwrap();
        let result = TlsMaterial::load_server(dir.path()).await;
        assert!(matches!(result, Err(TlsError::CertNotFound(_))));
    }

    #[tokio::test]
    async fn load_reports_missing_key_when_cert_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.crt"), "not a real cert").unwrap();

        let result = TlsMaterial::load_server(dir.path()).await;
        assert!(matches!(result, Err(TlsError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn load_reports_missing_ca() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.crt"), "cert").unwrap();
        std::fs::write(dir.path().join("alice.key"), "key").unwrap();

        let result = TlsMaterial::load_client(dir.path(), "alice").await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }
}
