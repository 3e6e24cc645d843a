//! Session registry: the process-wide route table for server sessions.
//!
//! Outgoing sessions are indexed by every hostname they serve (the remote
//! peer's name plus its aliases). Incoming sessions are indexed by every
//! remote domain they have validated. The registry is the only state shared
//! between sessions; all mutations happen under a single lock so that
//! concurrent creation and teardown never leave stale or duplicate routes.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::{IncomingServerSession, OutgoingServerSession};

/// Register / unregister / lookup of server sessions.
///
/// Registering the same session under the same name twice is a no-op.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn outgoing(&self, hostname: &str) -> Option<Arc<OutgoingServerSession>>;

    /// Map `hostname` to `session`. Returns `false` (and changes nothing) if a
    /// different session already serves that hostname.
    async fn register_outgoing(&self, hostname: &str, session: Arc<OutgoingServerSession>) -> bool;

    /// Drop `hostname` if it currently maps to the session `id`.
    async fn unregister_outgoing_hostname(&self, hostname: &str, id: Uuid);

    /// Drop every hostname mapped to the session `id`.
    async fn unregister_outgoing(&self, id: Uuid);

    async fn incoming(&self, hostname: &str) -> Vec<Arc<IncomingServerSession>>;

    async fn register_incoming(&self, hostname: &str, session: Arc<IncomingServerSession>);

    async fn unregister_incoming_domain(&self, hostname: &str, id: Uuid);

    async fn unregister_incoming(&self, id: Uuid);

    /// Hostnames with an outgoing route, sorted.
    async fn outgoing_hostnames(&self) -> Vec<String>;

    /// Remote domains with at least one incoming session, sorted.
    async fn incoming_domains(&self) -> Vec<String>;
}

#[derive(Default)]
struct Routes {
    outgoing: HashMap<String, Arc<OutgoingServerSession>>,
    incoming: HashMap<String, Vec<Arc<IncomingServerSession>>>,
}

/// In-process registry backed by one `RwLock` over both indexes.
#[derive(Default)]
pub struct InMemorySessionRegistry {
    routes: RwLock<Routes>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn outgoing(&self, hostname: &str) -> Option<Arc<OutgoingServerSession>> {
        self.routes.read().await.outgoing.get(hostname).cloned()
    }

    async fn register_outgoing(&self, hostname: &str, session: Arc<OutgoingServerSession>) -> bool {
        let mut routes = self.routes.write().await;
        match routes.outgoing.get(hostname) {
            Some(existing) if existing.id() != session.id() && !existing.is_closed() => false,
            _ => {
                routes.outgoing.insert(hostname.to_owned(), session);
                true
            }
        }
    }

    async fn unregister_outgoing_hostname(&self, hostname: &str, id: Uuid) {
        let mut routes = self.routes.write().await;
        if routes.outgoing.get(hostname).is_some_and(|s| s.id() == id) {
            routes.outgoing.remove(hostname);
        }
    }

    async fn unregister_outgoing(&self, id: Uuid) {
        self.routes.write().await.outgoing.retain(|_, s| s.id() != id);
    }

    async fn incoming(&self, hostname: &str) -> Vec<Arc<IncomingServerSession>> {
        self.routes.read().await.incoming.get(hostname).cloned().unwrap_or_default()
    }

    async fn register_incoming(&self, hostname: &str, session: Arc<IncomingServerSession>) {
        let mut routes = self.routes.write().await;
        let sessions = routes.incoming.entry(hostname.to_owned()).or_default();
        if !sessions.iter().any(|s| s.id() == session.id()) {
            sessions.push(session);
        }
    }

    async fn unregister_incoming_domain(&self, hostname: &str, id: Uuid) {
        let mut routes = self.routes.write().await;
        if let Some(sessions) = routes.incoming.get_mut(hostname) {
            sessions.retain(|s| s.id() != id);
            if sessions.is_empty() {
                routes.incoming.remove(hostname);
            }
        }
    }

    async fn unregister_incoming(&self, id: Uuid) {
        let mut routes = self.routes.write().await;
        routes.incoming.retain(|_, sessions| {
            sessions.retain(|s| s.id() != id);
            !sessions.is_empty()
        });
    }

    async fn outgoing_hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().await.outgoing.keys().cloned().collect();
        names.sort();
        names
    }

    async fn incoming_domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().await.incoming.keys().cloned().collect();
        names.sort();
        names
    }
}
