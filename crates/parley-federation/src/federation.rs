//! The federation context: settings, secret, and the external collaborators
//! every procedure needs.
//!
//! One [`Federation`] per local server. Integration tests build several in the
//! same process, each with its own registry, wired to a shared in-memory
//! network through the [`Connector`] and [`Resolver`] seams.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parley_common::{config::AppConfig, domain};
use tracing::debug;

use crate::{
    access::{AccessPolicy, AllowAll, ListAccessPolicy},
    discovery::{Connector, DnsResolver, Resolver, TcpConnector},
    error::FederationError,
    keys::DialbackSecret,
    locks::KeyedMutex,
    registry::{InMemorySessionRegistry, SessionRegistry},
    session::IncomingServerSession,
    stanza::Element,
    tls::TlsSettings,
};

// ─── Settings ────────────────────────────────────────────────────────────────

/// When to give up stripping labels off an unreachable hostname.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub stop_suffixes: Vec<String>,
    pub stop_at_top_level: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            stop_suffixes: ["com", "net", "org", "edu", "gov"].iter().map(|s| s.to_string()).collect(),
            stop_at_top_level: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederationSettings {
    /// The local server's own domain.
    pub domain: String,
    /// Additional locally recognized domains.
    pub hosted_domains: Vec<String>,
    pub dialback_enabled: bool,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub default_port: u16,
    pub fallback: FallbackPolicy,
}

impl FederationSettings {
    /// Defaults for a server whose own domain is `domain`.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain::normalize(domain),
            hosted_domains: Vec::new(),
            dialback_enabled: true,
            read_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            default_port: parley_common::config::DEFAULT_S2S_PORT,
            fallback: FallbackPolicy::default(),
        }
    }

    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            domain: domain::normalize(&cfg.server.domain),
            hosted_domains: cfg.server.hosted_domains.iter().map(|d| domain::normalize(d)).collect(),
            dialback_enabled: cfg.dialback.enabled,
            read_timeout: Duration::from_secs(cfg.dialback.read_timeout_secs),
            connect_timeout: Duration::from_secs(cfg.federation.connect_timeout_secs),
            default_port: cfg.federation.default_port,
            fallback: FallbackPolicy {
                stop_suffixes: cfg.federation.fallback_stop_suffixes.clone(),
                stop_at_top_level: cfg.federation.stop_at_top_level,
            },
        }
    }

    /// Whether `domain` is served by this process.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.domain || self.hosted_domains.iter().any(|d| d == domain)
    }
}

// ─── Routing seam ────────────────────────────────────────────────────────────

/// Receives stanzas that arrived over a validated incoming session.
#[async_trait]
pub trait StanzaSink: Send + Sync {
    async fn deliver(&self, via: &IncomingServerSession, stanza: Element);
}

/// Drops every stanza (logging it at debug level).
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl StanzaSink for DiscardSink {
    async fn deliver(&self, via: &IncomingServerSession, stanza: Element) {
        debug!(stream_id = %via.stream_id(), "no router installed, dropping <{}>", stanza.name);
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

pub struct Federation {
    pub(crate) settings: FederationSettings,
    pub(crate) secret: DialbackSecret,
    pub(crate) registry: Arc<dyn SessionRegistry>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) access: Arc<dyn AccessPolicy>,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) sink: Arc<dyn StanzaSink>,
    pub(crate) connect_locks: KeyedMutex,
    /// Held by the Receiving role from the duplicate check until the pair is
    /// registered, keyed by `remote|local`.
    pub(crate) pair_locks: KeyedMutex,
}

impl Federation {
    pub fn builder(settings: FederationSettings, secret: DialbackSecret) -> FederationBuilder {
        FederationBuilder {
            settings,
            secret,
            registry: None,
            resolver: None,
            connector: None,
            access: None,
            tls: None,
            sink: None,
        }
    }

    /// Production wiring from application config: DNS, TCP, list-based
    /// access policy and TLS when enabled.
    pub fn from_app_config(cfg: &AppConfig) -> Result<Arc<Self>, FederationError> {
        let settings = FederationSettings::from_app_config(cfg);
        let secret = DialbackSecret::from_config(&cfg.dialback.secret);
        let mut builder = Federation::builder(settings, secret)
            .access(Arc::new(ListAccessPolicy::from_config(&cfg.federation)));
        if let Some(tls) = TlsSettings::from_config(&cfg.tls)? {
            builder = builder.tls(tls);
        }
        Ok(builder.build())
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    pub fn secret(&self) -> &DialbackSecret {
        &self.secret
    }
}

pub struct FederationBuilder {
    settings: FederationSettings,
    secret: DialbackSecret,
    registry: Option<Arc<dyn SessionRegistry>>,
    resolver: Option<Arc<dyn Resolver>>,
    connector: Option<Arc<dyn Connector>>,
    access: Option<Arc<dyn AccessPolicy>>,
    tls: Option<TlsSettings>,
    sink: Option<Arc<dyn StanzaSink>>,
}

impl FederationBuilder {
    pub fn registry(mut self, registry: Arc<dyn SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn access(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn StanzaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Arc<Federation> {
        let connect_timeout = self.settings.connect_timeout;
        Arc::new(Federation {
            settings: self.settings,
            secret: self.secret,
            registry: self.registry.unwrap_or_else(|| Arc::new(InMemorySessionRegistry::new())),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(DnsResolver::new())),
            connector: self.connector.unwrap_or_else(|| Arc::new(TcpConnector::new(connect_timeout))),
            access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
            tls: self.tls,
            sink: self.sink.unwrap_or_else(|| Arc::new(DiscardSink)),
            connect_locks: KeyedMutex::new(),
            pair_locks: KeyedMutex::new(),
        })
    }
}
