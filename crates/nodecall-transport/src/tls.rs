use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{Result, TransportError};

/// File locations for a TLS context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM certificate chain presented to peers.
    pub cert_file: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1) for `cert_file`.
    pub key_file: PathBuf,
    /// PEM CA bundle. When set, peers must present a certificate signed by
    /// it (mutual TLS). When unset, peers are verified against `cert_file`
    /// itself, which suits self-signed deployments.
    pub ca_file: Option<PathBuf>,
    /// Passphrase for an encrypted key. Encrypted keys are rejected.
    pub passphrase: Option<String>,
    /// Name to verify on outbound connections instead of the dialed host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ..Self::default()
        }
    }

    pub fn with_ca_file(mut self, ca_file: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(ca_file.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }
}

/// Ready-to-use server and client TLS configurations for one context.
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    server_name: Option<String>,
    mutual: bool,
}

impl TlsContext {
    /// Load certificates and keys from the files named in `config`.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        if config.passphrase.is_some() {
            return Err(TransportError::EncryptedKey {
                path: config.key_file.clone(),
            });
        }

        let certs = load_certs(&config.cert_file)?;
        let key = PrivateKeyDer::from_pem_file(&config.key_file).map_err(|err| {
            TransportError::Certificate {
                path: config.key_file.clone(),
                message: err.to_string(),
            }
        })?;
        let ca = config.ca_file.as_deref().map(load_certs).transpose()?;

        debug!(
            cert = ?config.cert_file,
            ca = ?config.ca_file,
            "loaded TLS material"
        );
        Self::from_der(certs, key, ca, config.server_name.clone())
    }

    /// Build a context from in-memory PEM data.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: Option<&[u8]>) -> Result<Self> {
        let certs = parse_certs(cert_pem, Path::new("<memory cert>"))?;
        let key =
            PrivateKeyDer::from_pem_slice(key_pem).map_err(|err| TransportError::Certificate {
                path: PathBuf::from("<memory key>"),
                message: err.to_string(),
            })?;
        let ca = ca_pem
            .map(|pem| parse_certs(pem, Path::new("<memory ca>")))
            .transpose()?;
        Self::from_der(certs, key, ca, None)
    }

    /// Build a context from DER material.
    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        ca: Option<Vec<CertificateDer<'static>>>,
        server_name: Option<String>,
    ) -> Result<Self> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
        let mutual = ca.is_some();

        let mut roots = RootCertStore::empty();
        for cert in ca.unwrap_or_else(|| certs.clone()) {
            roots.add(cert)?;
        }
        let roots = Arc::new(roots);

        let server_builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;
        let server = if mutual {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                    .build()
                    .map_err(|err| TransportError::Verifier(err.to_string()))?;
            server_builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs.clone(), key.clone_key())?
        } else {
            server_builder
                .with_no_client_auth()
                .with_single_cert(certs.clone(), key.clone_key())?
        };

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            server_name,
            mutual,
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client))
    }

    /// Whether inbound peers must present a CA-signed certificate.
    pub fn is_mutual(&self) -> bool {
        self.mutual
    }

    /// The name to verify when dialing `host`.
    pub fn server_name_for(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|_| TransportError::InvalidServerName(name.to_string()))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("mutual", &self.mutual)
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|err| TransportError::Certificate {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    non_empty(certs, path)
}

fn parse_certs(pem: &[u8], label: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Certificate {
            path: label.to_path_buf(),
            message: err.to_string(),
        })?;
    non_empty(certs, label)
}

fn non_empty(
    certs: Vec<CertificateDer<'static>>,
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>> {
    if certs.is_empty() {
        return Err(TransportError::Certificate {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}
