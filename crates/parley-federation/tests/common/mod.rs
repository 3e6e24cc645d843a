//! In-process network for driving several federations against each other.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::File,
    future::Future,
    io::BufReader,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use parley_common::config::TlsConfig;
use parley_federation::{
    discovery::{Connector, Endpoint, Resolver},
    stanza::Element,
    stream::BoxedTransport,
    tls::TlsSettings,
    DialbackSecret, Federation, FederationError, FederationSettings, IncomingServerSession, StanzaSink,
};
use tokio::{io::DuplexStream, sync::mpsc};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Hostname → listener table. Every `connect` creates a duplex pipe and hands
/// one end to the listener; the number of dials per host is recorded.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>,
    dials: Mutex<HashMap<String, usize>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listen(&self, host: &str) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(host.to_owned(), tx);
        rx
    }

    pub fn dials(&self, host: &str) -> usize {
        self.dials.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Resolver for MemoryNetwork {
    async fn resolve(&self, hostname: &str, default_port: u16) -> Result<Vec<Endpoint>, FederationError> {
        if self.listeners.lock().unwrap().contains_key(hostname) {
            Ok(vec![Endpoint::new(hostname, default_port)])
        } else {
            Err(FederationError::DiscoveryFailed(hostname.to_owned(), "no such host".into()))
        }
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport, FederationError> {
        let listener = self.listeners.lock().unwrap().get(&endpoint.host).cloned();
        let listener = listener.ok_or_else(|| FederationError::RemoteUnreachable(endpoint.host.clone()))?;
        *self.dials.lock().unwrap().entry(endpoint.host.clone()).or_default() += 1;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        listener
            .send(theirs)
            .map_err(|_| FederationError::RemoteUnreachable(endpoint.host.clone()))?;
        Ok(Box::new(ours))
    }
}

/// Collects delivered stanzas.
pub struct RecordingSink(pub mpsc::UnboundedSender<Element>);

#[async_trait]
impl StanzaSink for RecordingSink {
    async fn deliver(&self, _via: &IncomingServerSession, stanza: Element) {
        let _ = self.0.send(stanza);
    }
}

pub fn settings(domain: &str, hosted: &[&str]) -> FederationSettings {
    let mut settings = FederationSettings::new(domain);
    settings.hosted_domains = hosted.iter().map(|h| h.to_string()).collect();
    settings.read_timeout = Duration::from_secs(5);
    settings
}

/// A federation wired to `net`, not yet listening.
pub fn federation(net: &Arc<MemoryNetwork>, settings: FederationSettings, secret: &str) -> Arc<Federation> {
    Federation::builder(settings, DialbackSecret::new(secret))
        .resolver(net.clone())
        .connector(net.clone())
        .build()
}

/// Accept connections for `hosts` on behalf of `fed`.
pub fn serve(net: &MemoryNetwork, fed: &Arc<Federation>, hosts: &[&str]) {
    for host in hosts {
        let mut incoming = net.listen(host);
        let fed = fed.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            while let Some(conn) = incoming.recv().await {
                let fed = fed.clone();
                let peer = format!("peer-of-{host}");
                tokio::spawn(async move { fed.accept(Box::new(conn), &peer).await });
            }
        });
    }
}

/// Like [`serve`] for one host, except that the first connection is handed
/// to `first` instead of `fed`.
pub fn serve_after_first<F, Fut>(net: &MemoryNetwork, fed: &Arc<Federation>, host: &str, first: F)
where
    F: FnOnce(DuplexStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut incoming = net.listen(host);
    let fed = fed.clone();
    tokio::spawn(async move {
        if let Some(conn) = incoming.recv().await {
            tokio::spawn(first(conn));
        }
        while let Some(conn) = incoming.recv().await {
            let fed = fed.clone();
            tokio::spawn(async move { fed.accept(Box::new(conn), "peer").await });
        }
    });
}

/// TLS presenting the `b.example` test certificate (issued by the test CA).
pub fn b_example_tls() -> TlsSettings {
    TlsSettings::from_config(&TlsConfig {
        enabled: true,
        cert_path: Some(format!("{FIXTURES}/b.example.crt")),
        key_path: Some(format!("{FIXTURES}/b.example.key")),
    })
    .unwrap()
    .unwrap()
}

/// Client-only TLS that trusts the test CA and nothing else.
pub fn trusting_test_ca() -> TlsSettings {
    let mut reader = BufReader::new(File::open(format!("{FIXTURES}/ca.crt")).unwrap());
    let mut roots = rustls::RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut reader).unwrap() {
        roots.add(&rustls::Certificate(der)).unwrap();
    }
    let client = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsSettings::new(Arc::new(client), None)
}

/// Client-only TLS over the system roots, which do not include the test CA.
pub fn system_roots_tls() -> TlsSettings {
    TlsSettings::from_config(&TlsConfig { enabled: true, cert_path: None, key_path: None })
        .unwrap()
        .unwrap()
}

/// A listening server for `domain` (plus `hosted` names).
pub fn server(net: &Arc<MemoryNetwork>, domain: &str, hosted: &[&str], secret: &str) -> Arc<Federation> {
    let fed = federation(net, settings(domain, hosted), secret);
    let mut hosts = vec![domain];
    hosts.extend_from_slice(hosted);
    serve(net, &fed, &hosts);
    fed
}

/// Wait up to two seconds for `fed` to have (or no longer have) an incoming
/// session from `remote`.
pub async fn wait_incoming(fed: &Federation, remote: &str, present: bool) -> bool {
    for _ in 0..200 {
        if fed.registry().incoming(remote).await.is_empty() != present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait up to two seconds for `fed`'s outgoing route to `hostname` to go away.
pub async fn wait_outgoing_gone(fed: &Federation, hostname: &str) -> bool {
    for _ in 0..200 {
        if fed.registry().outgoing(hostname).await.is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
