//! Server sessions: one per authenticated physical connection.
//!
//! ```text
//! ┌─────────────────┐ round ok ┌──────────────────────┐ close ┌────────┐
//! │ Unauthenticated │─────────>│ Trusted(1..N domains)│──────>│ Closed │
//! └─────────────────┘          └──────────────────────┘       └────────┘
//!                                 ▲        │ more rounds /
//!                                 └────────┘ explicit removal
//! ```
//!
//! A domain only enters a session's trusted set after verification for that
//! domain succeeded. Closing a session tears down its stream and removes
//! every route it held from the [`SessionRegistry`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FederationError, StreamErrorCondition},
    registry::SessionRegistry,
    stanza::{parse_stream_error, DialbackResult, Element, Verdict},
    stream::XmlStream,
};

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Trusted(usize),
    Closed,
}

/// How an outgoing session was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Dialback,
    SaslExternal,
}

// ─── Incoming ────────────────────────────────────────────────────────────────

/// A connection a remote server opened to us. The remote may send stanzas
/// claiming to be from any validated domain, addressed to the local domain it
/// was validated for.
pub struct IncomingServerSession {
    id: Uuid,
    stream_id: String,
    stream: Arc<XmlStream>,
    registry: Arc<dyn SessionRegistry>,
    /// remote domain → local domains it was validated against
    validated: RwLock<HashMap<String, HashSet<String>>>,
}

impl IncomingServerSession {
    pub fn new(stream_id: impl Into<String>, stream: Arc<XmlStream>, registry: Arc<dyn SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            stream_id: stream_id.into(),
            stream,
            registry,
            validated: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The identifier we generated for this stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn connection(&self) -> &Arc<XmlStream> {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub async fn state(&self) -> SessionState {
        if self.is_closed() {
            return SessionState::Closed;
        }
        match self.validated.read().await.len() {
            0 => SessionState::Unauthenticated,
            n => SessionState::Trusted(n),
        }
    }

    /// Remote domains validated on this connection, sorted.
    pub async fn validated_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.validated.read().await.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub async fn is_validated(&self, remote: &str) -> bool {
        self.validated.read().await.contains_key(remote)
    }

    /// Whether `remote` was validated for sending to `local`.
    pub async fn is_validated_pair(&self, remote: &str, local: &str) -> bool {
        self.validated.read().await.get(remote).is_some_and(|locals| locals.contains(local))
    }

    /// Record a successful verification and publish the route.
    pub async fn add_validated_domain(self: &Arc<Self>, remote: &str, local: &str) {
        self.validated
            .write()
            .await
            .entry(remote.to_owned())
            .or_default()
            .insert(local.to_owned());
        self.registry.register_incoming(remote, self.clone()).await;
        info!(stream_id = %self.stream_id, remote, local, "incoming session validated domain");
    }

    /// Stop trusting `remote` on this connection.
    pub async fn remove_validated_domain(&self, remote: &str) -> bool {
        let removed = self.validated.write().await.remove(remote).is_some();
        if removed {
            self.registry.unregister_incoming_domain(remote, self.id).await;
        }
        removed
    }

    pub async fn close(&self) {
        self.stream.close().await;
        self.deregister().await;
    }

    pub async fn close_with_error(&self, condition: StreamErrorCondition) {
        self.stream.close_with_error(condition).await;
        self.deregister().await;
    }

    async fn deregister(&self) {
        self.registry.unregister_incoming(self.id).await;
        debug!(stream_id = %self.stream_id, "incoming session closed");
    }
}

// ─── Outgoing ────────────────────────────────────────────────────────────────

struct PendingRound {
    local: String,
    remote: String,
    reply: oneshot::Sender<Verdict>,
}

/// A connection we opened to a remote server. We may send as any
/// authenticated local domain, to any of the remote's known hostnames.
pub struct OutgoingServerSession {
    id: Uuid,
    stream_id: String,
    stream: Arc<XmlStream>,
    registry: Arc<dyn SessionRegistry>,
    method: AuthMethod,
    /// Whether the remote accepts `db:result` rounds on this stream.
    dialback_rounds: bool,
    authenticated: RwLock<HashSet<String>>,
    hostnames: RwLock<HashSet<String>>,
    /// Held for the whole of a dialback round: one answer in flight at a time.
    round: Mutex<()>,
    pending: StdMutex<Option<PendingRound>>,
}

impl OutgoingServerSession {
    pub fn new(
        stream_id: impl Into<String>,
        stream: Arc<XmlStream>,
        registry: Arc<dyn SessionRegistry>,
        method: AuthMethod,
    ) -> Arc<Self> {
        Self::build(stream_id.into(), stream, registry, method, method == AuthMethod::Dialback)
    }

    /// A session authenticated with SASL EXTERNAL. `dialback_offered` records
    /// whether the post-authentication stream features advertised dialback,
    /// in which case further local domains can still be added with rounds.
    pub fn sasl_external(
        stream_id: impl Into<String>,
        stream: Arc<XmlStream>,
        registry: Arc<dyn SessionRegistry>,
        dialback_offered: bool,
    ) -> Arc<Self> {
        Self::build(stream_id.into(), stream, registry, AuthMethod::SaslExternal, dialback_offered)
    }

    fn build(
        stream_id: String,
        stream: Arc<XmlStream>,
        registry: Arc<dyn SessionRegistry>,
        method: AuthMethod,
        dialback_rounds: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            stream_id,
            stream,
            registry,
            method,
            dialback_rounds,
            authenticated: RwLock::new(HashSet::new()),
            hostnames: RwLock::new(HashSet::new()),
            round: Mutex::new(()),
            pending: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The identifier the remote server generated for this stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Whether further local domains can be added with dialback rounds.
    pub fn uses_dialback(&self) -> bool {
        self.dialback_rounds
    }

    pub fn connection(&self) -> &Arc<XmlStream> {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub async fn state(&self) -> SessionState {
        if self.is_closed() {
            return SessionState::Closed;
        }
        match self.authenticated.read().await.len() {
            0 => SessionState::Unauthenticated,
            n => SessionState::Trusted(n),
        }
    }

    pub async fn authenticated_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.authenticated.read().await.iter().cloned().collect();
        domains.sort();
        domains
    }

    pub async fn is_authenticated(&self, local: &str) -> bool {
        self.authenticated.read().await.contains(local)
    }

    pub async fn add_authenticated_domain(&self, local: &str) {
        if self.authenticated.write().await.insert(local.to_owned()) {
            info!(stream_id = %self.stream_id, local, "outgoing session authenticated domain");
        }
    }

    pub async fn remove_authenticated_domain(&self, local: &str) -> bool {
        self.authenticated.write().await.remove(local)
    }

    pub async fn hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hostnames.read().await.iter().cloned().collect();
        names.sort();
        names
    }

    /// Fold `hostname` into this session and route it here. Returns `false`
    /// if it was already known or another live session serves it.
    pub async fn add_hostname(self: &Arc<Self>, hostname: &str) -> bool {
        let mut hostnames = self.hostnames.write().await;
        if hostnames.contains(hostname) {
            return false;
        }
        if !self.registry.register_outgoing(hostname, self.clone()).await {
            debug!(hostname, "hostname already served by another outgoing session");
            return false;
        }
        hostnames.insert(hostname.to_owned());
        true
    }

    /// Stop routing `hostname` here. The connection stays up.
    pub async fn remove_hostname(&self, hostname: &str) -> bool {
        let removed = self.hostnames.write().await.remove(hostname);
        if removed {
            self.registry.unregister_outgoing_hostname(hostname, self.id).await;
        }
        removed
    }

    /// Send a result-offer on this established stream and wait for the answer
    /// routed back by [`run`](Self::run).
    pub async fn dialback_round(&self, offer: DialbackResult, limit: Duration) -> Result<Verdict, FederationError> {
        let _round = self.round.lock().await;
        let (reply, answer) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(PendingRound {
            local: offer.from.clone(),
            remote: offer.to.clone(),
            reply,
        });

        if let Err(e) = self.stream.send(&offer.to_element()).await {
            self.clear_pending();
            return Err(e);
        }

        match tokio::time::timeout(limit, answer).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(_)) => Err(FederationError::StreamClosed),
            Err(_) => {
                self.clear_pending();
                Err(FederationError::Timeout("dialback result"))
            }
        }
    }

    /// Write a stanza sent as `from_domain`, which must be authenticated.
    pub async fn deliver(&self, from_domain: &str, stanza: &Element) -> Result<(), FederationError> {
        if !self.is_authenticated(from_domain).await {
            return Err(FederationError::NotAuthenticated(from_domain.to_owned()));
        }
        self.stream.send(stanza).await
    }

    /// Drive the read side until the stream ends, then close the session.
    pub async fn run(self: Arc<Self>) {
        loop {
            let next = tokio::select! {
                next = self.stream.read_element() => next,
                _ = self.stream.wait_closed() => break,
            };
            match next {
                Ok(Some(el)) if el.name == "db:result" => match DialbackResult::parse(&el) {
                    Some(answer) if answer.verdict.is_some() => {
                        if !self.resolve_pending(&answer) {
                            debug!(from = %answer.from, to = %answer.to, "unsolicited dialback answer");
                        }
                    }
                    _ => debug!("ignoring malformed db:result on outgoing stream"),
                },
                Ok(Some(el)) if el.name == "stream:error" => {
                    warn!(stream_id = %self.stream_id, condition = %parse_stream_error(&el), "remote closed outgoing stream");
                    break;
                }
                Ok(Some(el)) => debug!("ignoring <{}> on outgoing stream", el.name),
                Ok(None) => {
                    debug!(stream_id = %self.stream_id, "outgoing stream closed by remote");
                    break;
                }
                Err(e) => {
                    warn!(stream_id = %self.stream_id, "outgoing stream failed: {e}");
                    if let Some(condition) = e.condition() {
                        self.stream.close_with_error(condition).await;
                    }
                    break;
                }
            }
        }
        self.close().await;
    }

    pub async fn close(&self) {
        self.stream.close().await;
        self.clear_pending();
        self.registry.unregister_outgoing(self.id).await;
        debug!(stream_id = %self.stream_id, "outgoing session closed");
    }

    fn resolve_pending(&self, answer: &DialbackResult) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = pending
            .as_ref()
            .is_some_and(|p| p.remote == answer.from && p.local == answer.to);
        if !matches {
            return false;
        }
        match (pending.take(), answer.verdict) {
            (Some(round), Some(verdict)) => round.reply.send(verdict).is_ok(),
            _ => false,
        }
    }

    fn clear_pending(&self) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
