//! TLS configuration for server-to-server streams.
//!
//! The same certificate serves two purposes: it is presented to peers that
//! STARTTLS on our inbound streams, and it is offered as client certificate on
//! outbound streams so that the remote can accept SASL EXTERNAL.

use std::{fs::File, io::BufReader, sync::Arc, time::Duration};

use parley_common::config::TlsConfig;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::{error::FederationError, stream::BoxedTransport};

#[derive(Clone)]
pub struct TlsSettings {
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsSettings {
    /// Build from configuration. `Ok(None)` when TLS is disabled.
    pub fn from_config(cfg: &TlsConfig) -> Result<Option<Self>, FederationError> {
        if !cfg.enabled {
            return Ok(None);
        }
        let identity = match (&cfg.cert_path, &cfg.key_path) {
            (Some(cert), Some(key)) => Some((load_certs(cert)?, load_key(key)?)),
            (None, None) => None,
            _ => return Err(FederationError::Tls("cert_path and key_path must be set together".into())),
        };

        let roots = native_roots();
        let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);
        let (client, server) = match identity {
            Some((certs, key)) => {
                let client = builder.with_client_auth_cert(certs.clone(), key.clone())?;
                let server = ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)?;
                (client, Some(Arc::new(server)))
            }
            None => (builder.with_no_client_auth(), None),
        };
        Ok(Some(Self { client: Arc::new(client), server }))
    }

    /// Assemble from prepared rustls configs.
    pub fn new(client: Arc<ClientConfig>, server: Option<Arc<ServerConfig>>) -> Self {
        Self { client, server }
    }

    /// Whether inbound STARTTLS can be offered.
    pub fn can_accept(&self) -> bool {
        self.server.is_some()
    }

    /// Client side of STARTTLS, verifying the peer as `domain`. The handshake
    /// must finish within `limit`.
    pub async fn connect(
        &self,
        domain: &str,
        transport: BoxedTransport,
        limit: Duration,
    ) -> Result<BoxedTransport, FederationError> {
        let name = ServerName::try_from(domain)
            .map_err(|_| FederationError::Tls(format!("'{domain}' is not a valid DNS name")))?;
        let handshake = TlsConnector::from(self.client.clone()).connect(name, transport);
        let tls = tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| FederationError::Timeout("tls handshake"))??;
        debug!(domain, "TLS established (client)");
        Ok(Box::new(tls))
    }

    /// Server side of STARTTLS, bounded by `limit`.
    pub async fn accept(&self, transport: BoxedTransport, limit: Duration) -> Result<BoxedTransport, FederationError> {
        let server = self
            .server
            .clone()
            .ok_or_else(|| FederationError::Tls("no server certificate configured".into()))?;
        let tls = tokio::time::timeout(limit, TlsAcceptor::from(server).accept(transport))
            .await
            .map_err(|_| FederationError::Timeout("tls handshake"))??;
        debug!("TLS established (server)");
        Ok(Box::new(tls))
    }
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                if let Err(e) = roots.add(&Certificate(cert.0)) {
                    debug!("skipping unparsable native root: {e}");
                }
            }
        }
        Err(e) => warn!("could not load native root certificates: {e}"),
    }
    roots
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, FederationError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?.into_iter().map(Certificate).collect();
    if certs.is_empty() {
        return Err(FederationError::Tls(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKey, FederationError> {
    let mut reader = BufReader::new(File::open(path)?);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)?.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::rsa_private_keys(&mut reader)?
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| FederationError::Tls(format!("no private key in {path}")))
}
