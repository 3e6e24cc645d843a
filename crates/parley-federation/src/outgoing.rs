//! Outbound authentication: `authenticate_domain` and outgoing session
//! creation.
//!
//! Resolution order for `(local → remote)`:
//!
//! 1. an outgoing session already routed to `remote`, extended with another
//!    dialback round when `local` is new to it;
//! 2. an outgoing session to a domain that connected to us *from* `remote`,
//!    aliased to `remote`;
//! 3. a new connection (TLS + SASL EXTERNAL first, plain dialback second);
//! 4. the same for parent domains of `remote` (`xmpp.b.example` → `b.example`).
//!
//! Steps 3 and 4 run under a per-hostname lock so concurrent callers for the
//! same remote end up sharing one connection.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info, warn};

use parley_common::domain;

use crate::{
    dialback::{OpenedStream, ServerDialback},
    error::FederationError,
    federation::{FallbackPolicy, Federation},
    session::{AuthMethod, OutgoingServerSession},
    stanza::{DialbackResult, Element, Verdict, NS_SASL, NS_TLS},
    stream::XmlStream,
    tls::TlsSettings,
};

impl Federation {
    /// Make sure `local` may send stanzas to `remote`. Returns `true` once an
    /// outgoing session routed to `remote` has `local` authenticated.
    pub async fn authenticate_domain(&self, local: &str, remote: &str) -> bool {
        let (local, remote) = match (domain::validate(local), domain::validate(remote)) {
            (Ok(l), Ok(r)) => (l, r),
            (l, r) => {
                warn!(local, remote, ?l, ?r, "refusing to authenticate malformed domain");
                return false;
            }
        };
        if !self.settings.is_local_domain(&local) {
            warn!(%local, "not a locally hosted domain");
            return false;
        }
        if self.settings.is_local_domain(&remote) {
            debug!(%remote, "remote domain is local, nothing to authenticate");
            return false;
        }
        if !self.access.is_allowed(&remote) {
            info!(%remote, "remote domain blocked by access policy");
            return false;
        }

        if let Some(session) = self.registry.outgoing(&remote).await {
            return self.extend_session(&session, &local, &remote).await;
        }

        if let Some(session) = self.find_reciprocal_session(&remote).await {
            debug!(%remote, stream_id = %session.stream_id(), "reusing session of reciprocal domain");
            if self.extend_session(&session, &local, &remote).await {
                session.add_hostname(&remote).await;
                return true;
            }
        }

        let _guard = self.connect_locks.lock(&remote).await;
        if let Some(session) = self.registry.outgoing(&remote).await {
            // Another caller connected while we waited for the lock.
            return self.extend_session(&session, &local, &remote).await;
        }
        if let Some(session) = self.create_outgoing_session(&local, &remote).await {
            if self.publish(session, &[remote.clone()]).await {
                return true;
            }
            // An alias claimed `remote` while we were connecting.
            return match self.registry.outgoing(&remote).await {
                Some(existing) => self.extend_session(&existing, &local, &remote).await,
                None => false,
            };
        }
        self.connect_via_parent_domains(&local, &remote).await
    }

    /// Authenticate `local` on an established session (no new connection).
    ///
    /// Only dialback sessions can take more domains. A timed-out round fails
    /// without closing the session.
    pub async fn authenticate_subdomain(
        &self,
        session: &OutgoingServerSession,
        local: &str,
        remote: &str,
    ) -> bool {
        if !session.uses_dialback() || !self.settings.dialback_enabled || session.is_closed() {
            return false;
        }
        let key = self.secret.derive(session.stream_id());
        let offer = DialbackResult::offer(local, remote, &key);
        match session.dialback_round(offer, self.settings.read_timeout).await {
            Ok(Verdict::Valid) => {
                session.add_authenticated_domain(local).await;
                true
            }
            Ok(Verdict::Invalid) => {
                warn!(local, remote, "additional domain rejected by remote");
                false
            }
            Err(e) => {
                warn!(local, remote, "dialback round failed: {e}");
                false
            }
        }
    }

    async fn extend_session(&self, session: &OutgoingServerSession, local: &str, remote: &str) -> bool {
        session.is_authenticated(local).await || self.authenticate_subdomain(session, local, remote).await
    }

    /// An outgoing dialback session to some domain that was validated on an
    /// incoming session from `remote`: the same peer server under another name.
    async fn find_reciprocal_session(&self, remote: &str) -> Option<Arc<OutgoingServerSession>> {
        for incoming in self.registry.incoming(remote).await {
            for validated in incoming.validated_domains().await {
                if let Some(outgoing) = self.registry.outgoing(&validated).await {
                    if outgoing.uses_dialback() && !outgoing.is_closed() {
                        return Some(outgoing);
                    }
                }
            }
        }
        None
    }

    async fn connect_via_parent_domains(&self, local: &str, remote: &str) -> bool {
        let mut tried = vec![remote.to_owned()];
        for candidate in fallback_candidates(remote, &self.settings.fallback, &self.settings.domain) {
            debug!(remote, %candidate, "trying parent domain");
            tried.push(candidate.clone());

            let _guard = self.connect_locks.lock(&candidate).await;
            if let Some(session) = self.registry.outgoing(&candidate).await {
                if self.extend_session(&session, local, &candidate).await {
                    for hostname in &tried {
                        session.add_hostname(hostname).await;
                    }
                    return true;
                }
                continue;
            }
            if let Some(session) = self.create_outgoing_session(local, &candidate).await {
                if self.publish(session, &tried).await {
                    return true;
                }
            }
        }
        warn!(local, remote, "could not authenticate to remote server");
        false
    }

    /// Route `hostnames` to a freshly created session and start its reader.
    /// A session that ends up with no hostname of its own is closed and
    /// `false` returned.
    async fn publish(&self, session: Arc<OutgoingServerSession>, hostnames: &[String]) -> bool {
        let mut routed = false;
        for hostname in hostnames {
            routed |= session.add_hostname(hostname).await;
        }
        if !routed {
            debug!(stream_id = %session.stream_id(), ?hostnames, "every hostname already routed, dropping new session");
            session.close().await;
            return false;
        }
        tokio::spawn(session.run());
        true
    }

    /// Open and authenticate a new connection to `hostname` as `local`.
    ///
    /// With TLS configured, STARTTLS + SASL EXTERNAL is attempted first; any
    /// failure there falls back to dialback over a fresh plain connection.
    pub async fn create_outgoing_session(
        &self,
        local: &str,
        hostname: &str,
    ) -> Option<Arc<OutgoingServerSession>> {
        if let Some(tls) = &self.tls {
            match self.connect_secure(tls, local, hostname).await {
                Ok(session) => return Some(session),
                Err(e) => debug!(local, hostname, "TLS/SASL EXTERNAL failed, falling back to dialback: {e}"),
            }
        }
        if !self.settings.dialback_enabled {
            return None;
        }
        match ServerDialback::new(self).originate(local, hostname).await {
            Ok(Some(originated)) => {
                let session = OutgoingServerSession::new(
                    originated.stream_id,
                    Arc::new(originated.stream),
                    self.registry.clone(),
                    AuthMethod::Dialback,
                );
                session.add_authenticated_domain(local).await;
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(local, hostname, "dialback with remote failed: {e}");
                None
            }
        }
    }

    async fn connect_secure(
        &self,
        tls: &TlsSettings,
        local: &str,
        hostname: &str,
    ) -> Result<Arc<OutgoingServerSession>, FederationError> {
        let dialback = ServerDialback::new(self);
        let opened = dialback.open_stream(local, hostname).await?;
        if !opened.features.as_ref().is_some_and(|f| f.starttls) {
            opened.stream.close().await;
            return Err(FederationError::StartTlsUnavailable(hostname.to_owned()));
        }

        let stream = opened.stream;
        stream.send(&Element::new("starttls").with_attr("xmlns", NS_TLS)).await?;
        let reply = match stream.expect_element(self.settings.read_timeout).await {
            Ok(el) => el,
            Err(e) => return abandon(stream, e).await,
        };
        if reply.name != "proceed" {
            return abandon(stream, FederationError::Tls(format!("remote answered <{}> to STARTTLS", reply.name))).await;
        }
        let transport = stream.into_transport()?;
        let secured = XmlStream::new(
            tls.connect(hostname, transport, self.settings.read_timeout).await?,
            true,
            hostname,
        );

        let OpenedStream { stream, features, .. } = dialback.start_stream(secured, local, hostname).await?;
        if !features.as_ref().is_some_and(|f| f.offers_external()) {
            return abandon(stream, FederationError::SaslRejected(hostname.to_owned())).await;
        }
        let auth = Element::new("auth")
            .with_attr("xmlns", NS_SASL)
            .with_attr("mechanism", "EXTERNAL")
            .with_text(BASE64.encode(local));
        stream.send(&auth).await?;
        let reply = match stream.expect_element(self.settings.read_timeout).await {
            Ok(el) => el,
            Err(e) => return abandon(stream, e).await,
        };
        if reply.name != "success" {
            return abandon(stream, FederationError::SaslRejected(hostname.to_owned())).await;
        }

        // SASL success resets the stream.
        let OpenedStream { stream, header, features } = dialback.start_stream(stream, local, hostname).await?;
        let dialback_offered =
            self.settings.dialback_enabled && header.declares_dialback && features.is_some_and(|f| f.dialback);
        let session = OutgoingServerSession::sasl_external(
            header.id.unwrap_or_default(),
            Arc::new(stream),
            self.registry.clone(),
            dialback_offered,
        );
        session.add_authenticated_domain(local).await;
        info!(local, hostname, "outgoing session authenticated with SASL EXTERNAL");
        Ok(session)
    }
}

async fn abandon<T>(stream: XmlStream, err: FederationError) -> Result<T, FederationError> {
    stream.close().await;
    Err(err)
}

/// Parent domains to try when `hostname` itself cannot be authenticated,
/// nearest first. Stops before a configured suffix, a top-level label (when
/// enabled) or the local domain. IP literals yield nothing.
pub fn fallback_candidates(hostname: &str, policy: &FallbackPolicy, local_domain: &str) -> Vec<String> {
    if !domain::has_alphabetic(hostname) {
        return Vec::new();
    }
    let mut candidates = Vec::new();
    let mut rest = hostname;
    while let Some((_, parent)) = rest.split_once('.') {
        let top_level = !parent.contains('.');
        if parent.is_empty()
            || parent == local_domain
            || policy.stop_suffixes.iter().any(|s| s == parent)
            || (policy.stop_at_top_level && top_level)
        {
            break;
        }
        candidates.push(parent.to_owned());
        rest = parent;
    }
    candidates
}
