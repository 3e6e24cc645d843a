//! Server discovery and connection establishment.
//!
//! Resolution turns a remote domain into candidate endpoints; connecting
//! turns an endpoint into a byte transport. Both are traits so the core can
//! run over real DNS and TCP in production and over an in-memory network in
//! tests.
//!
//! [`DnsResolver`] performs plain host lookups with an in-memory cache.
//! SRV lookups are left to an alternative [`Resolver`] implementation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::RwLock};
use tracing::debug;

use crate::{error::FederationError, stream::BoxedTransport};

/// How long to cache resolved endpoints before re-resolving.
const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// One place a remote server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Hostname → candidate endpoints, in preference order.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str, default_port: u16) -> Result<Vec<Endpoint>, FederationError>;

    /// Forget anything cached for `hostname`, e.g. after none of its
    /// endpoints could be reached.
    async fn invalidate(&self, _hostname: &str) {}
}

#[derive(Debug)]
struct CacheEntry {
    endpoints: Vec<Endpoint>,
    resolved_at: Instant,
}

/// System DNS resolver with a TTL cache.
#[derive(Debug, Clone, Default)]
pub struct DnsResolver {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn do_resolve(&self, hostname: &str, port: u16) -> Result<Vec<Endpoint>, FederationError> {
        let addrs = tokio::net::lookup_host((hostname, port))
            .await
            .map_err(|e| FederationError::DiscoveryFailed(hostname.to_owned(), e.to_string()))?;
        let endpoints: Vec<Endpoint> =
            addrs.map(|addr| Endpoint::new(addr.ip().to_string(), addr.port())).collect();
        if endpoints.is_empty() {
            return Err(FederationError::DiscoveryFailed(hostname.to_owned(), "no addresses".into()));
        }
        Ok(endpoints)
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, hostname: &str, default_port: u16) -> Result<Vec<Endpoint>, FederationError> {
        // Fast path: cache hit.
        {
            let cache = self.inner.read().await;
            if let Some(entry) = cache.get(hostname) {
                if entry.resolved_at.elapsed() < CACHE_TTL {
                    debug!("Discovery cache hit: {} → {:?}", hostname, entry.endpoints);
                    return Ok(entry.endpoints.clone());
                }
            }
        }

        let endpoints = self.do_resolve(hostname, default_port).await?;
        debug!("Discovery (dns): {} → {:?}", hostname, endpoints);

        self.inner.write().await.insert(
            hostname.to_owned(),
            CacheEntry { endpoints: endpoints.clone(), resolved_at: Instant::now() },
        );
        Ok(endpoints)
    }

    async fn invalidate(&self, hostname: &str) {
        if self.inner.write().await.remove(hostname).is_some() {
            debug!("Discovery cache invalidated: {}", hostname);
        }
    }
}

/// Fixed hostname → endpoint table. Unknown names fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<Endpoint>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, hostname: impl Into<String>, endpoint: Endpoint) -> Self {
        self.table.entry(hostname.into()).or_default().push(endpoint);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, hostname: &str, _default_port: u16) -> Result<Vec<Endpoint>, FederationError> {
        self.table
            .get(hostname)
            .cloned()
            .ok_or_else(|| FederationError::DiscoveryFailed(hostname.to_owned(), "not in static table".into()))
    }
}

// ─── Connecting ──────────────────────────────────────────────────────────────

/// Endpoint → fresh byte transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport, FederationError>;
}

/// Plain TCP with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport, FederationError> {
        let stream = tokio::time::timeout(
            self.timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| FederationError::Timeout("tcp connect"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
