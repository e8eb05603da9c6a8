//! Transport credential provider.
//!
//! A [`ServerCredential`] bundles the certificate chain presented to clients
//! with the private key that proves possession of it. A [`ClientCredential`]
//! only holds the certificates used to validate the server identity; it never
//! carries a private key. The rustls configurations are built when the
//! credential is loaded, so broken material is reported before any
//! connection is attempted.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::error::{Error, Result};

/// Loads a server credential from PEM files.
pub fn server_credential(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ServerCredential> {
    let cert = read_file(cert_path.as_ref())?;
    let key = read_file(key_path.as_ref())?;
    ServerCredential::from_pem(&cert, &key)
}

/// Loads a client credential (trusted server certificates) from a PEM file.
pub fn client_credential(cert_path: impl AsRef<Path>) -> Result<ClientCredential> {
    let cert = read_file(cert_path.as_ref())?;
    ClientCredential::from_pem(&cert)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::CredentialLoad(format!("cannot read {}: {e}", path.display())))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CredentialLoad(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::CredentialLoad("no certificate found in PEM data".to_string()));
    }
    Ok(certs)
}

/// TLS material for a listener: certificate chain plus private key.
#[derive(Clone)]
pub struct ServerCredential {
    config: Arc<ServerConfig>,
}

impl ServerCredential {
    /// Builds a credential from PEM-encoded certificate chain and private key.
    ///
    /// Fails if either blob is malformed or the key does not belong to the
    /// leaf certificate.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certificates(cert_pem)?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| Error::CredentialLoad(format!("invalid private key PEM: {e}")))?;

        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::CredentialLoad(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::CredentialLoad(format!("certificate/key pair rejected: {e}")))?;
        debug!("Loaded server credential");

        Ok(Self { config: Arc::new(config) })
    }

    pub(crate) fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.config.clone())
    }
}

impl fmt::Debug for ServerCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerCredential").finish_non_exhaustive()
    }
}

/// TLS material for a dialer: the certificates trusted to identify the server.
#[derive(Clone)]
pub struct ClientCredential {
    config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl ClientCredential {
    /// Builds a credential trusting every certificate in `cert_pem`.
    pub fn from_pem(cert_pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certificates(cert_pem)? {
            roots
                .add(cert)
                .map_err(|e| Error::CredentialLoad(format!("untrustable certificate: {e}")))?;
        }

        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::CredentialLoad(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        debug!("Loaded client credential");

        Ok(Self { config: Arc::new(config), server_name: None })
    }

    /// Validates the server certificate against `name` instead of the dial host.
    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        let name = ServerName::try_from(name.to_string())
            .map_err(|e| Error::CredentialLoad(format!("invalid server name {name}: {e}")))?;
        self.server_name = Some(name);
        Ok(self)
    }

    pub(crate) fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.config.clone())
    }

    /// Name the server certificate must match when dialing `host`.
    pub(crate) fn server_name_for(
        &self,
        host: &str,
    ) -> std::result::Result<ServerName<'static>, String> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        ServerName::try_from(host.to_string())
            .map_err(|e| format!("invalid server name {host}: {e}"))
    }
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCredential").field("server_name", &self.server_name).finish()
    }
}
