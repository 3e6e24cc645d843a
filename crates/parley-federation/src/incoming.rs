//! Inbound connections: stream negotiation, the first dialback exchange and
//! the read loop of a validated incoming session.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_common::domain;

use crate::{
    dialback::{ReceiverOutcome, ServerDialback},
    error::{FederationError, StreamErrorCondition},
    federation::Federation,
    session::IncomingServerSession,
    stanza::{parse_stream_error, DialbackResult, DialbackVerify, Element, StreamFeatures, StreamHeader, NS_SERVER, NS_TLS},
    stream::{BoxedTransport, XmlStream},
};

/// Where the pre-authentication phase left a connection.
enum Negotiated {
    /// STARTTLS completed; the peer's new header has been read.
    Restart(XmlStream, StreamHeader),
    Session(Arc<IncomingServerSession>),
    /// Closed, or a one-shot verify exchange finished.
    Done,
}

/// A fresh stream identifier: 128 random bits, hex encoded.
pub fn new_stream_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Federation {
    /// Serve one accepted connection until it closes.
    pub async fn accept(&self, transport: BoxedTransport, peer: &str) {
        let stream = XmlStream::new(transport, false, peer);
        let header = match stream.read_header_timeout(self.settings.read_timeout).await {
            Ok(header) => header,
            Err(e) => {
                debug!(peer, "no usable stream header: {e}");
                close_on_error(&stream, &e).await;
                return;
            }
        };
        if let Some(session) = self.create_incoming_session(stream, header).await {
            self.serve_incoming(session).await;
        }
    }

    /// Answer the peer's stream header and run the exchange up to the first
    /// validated domain.
    ///
    /// Returns `None` when the connection was refused, closed, or only used
    /// for a verify-request.
    pub async fn create_incoming_session(
        &self,
        stream: XmlStream,
        header: StreamHeader,
    ) -> Option<Arc<IncomingServerSession>> {
        let (mut stream, mut header) = (stream, header);
        loop {
            let stream_id = new_stream_id();
            let local = header
                .to
                .as_deref()
                .map(domain::normalize)
                .unwrap_or_else(|| self.settings.domain.clone());
            let response = StreamHeader::responding(
                &local,
                header.from.as_deref(),
                &stream_id,
                header.supports_features().then_some("1.0"),
            );
            if stream.send_header(&response).await.is_err() {
                stream.close().await;
                return None;
            }
            if let Err(condition) = self.check_header(&header, &local) {
                warn!(peer = %stream.peer(), %condition, "refusing stream");
                stream.close_with_error(condition).await;
                return None;
            }
            if header.supports_features() {
                let features = StreamFeatures {
                    starttls: !stream.is_secure() && self.tls.as_ref().is_some_and(|t| t.can_accept()),
                    dialback: self.settings.dialback_enabled,
                    mechanisms: Vec::new(),
                };
                if stream.send(&features.to_element()).await.is_err() {
                    stream.close().await;
                    return None;
                }
            }

            match self.negotiate(stream, &stream_id).await {
                Negotiated::Restart(next, next_header) => {
                    stream = next;
                    header = next_header;
                }
                Negotiated::Session(session) => return Some(session),
                Negotiated::Done => return None,
            }
        }
    }

    fn check_header(&self, header: &StreamHeader, local: &str) -> Result<(), StreamErrorCondition> {
        if header.default_ns.as_deref() != Some(NS_SERVER) {
            return Err(StreamErrorCondition::InvalidNamespace);
        }
        if !header.declares_dialback {
            return Err(StreamErrorCondition::InvalidNamespace);
        }
        if !self.settings.is_local_domain(local) {
            return Err(StreamErrorCondition::HostUnknown);
        }
        Ok(())
    }

    async fn negotiate(&self, stream: XmlStream, stream_id: &str) -> Negotiated {
        let el = match stream.read_element_timeout(self.settings.read_timeout).await {
            Ok(Some(el)) => el,
            Ok(None) => {
                stream.close().await;
                return Negotiated::Done;
            }
            Err(e) => {
                debug!(peer = %stream.peer(), "negotiation read failed: {e}");
                close_on_error(&stream, &e).await;
                return Negotiated::Done;
            }
        };

        match el.name.as_str() {
            "starttls" if el.attr("xmlns") == Some(NS_TLS) => self.accept_starttls(stream).await,
            "db:result" if self.settings.dialback_enabled => {
                let Some(offer) = DialbackResult::parse(&el) else {
                    stream.close_with_error(StreamErrorCondition::InvalidXml).await;
                    return Negotiated::Done;
                };
                let stream = Arc::new(stream);
                let _pair = self.pair_locks.lock(&pair_key(&offer)).await;
                match ServerDialback::new(self).verify_as_receiver(&stream, &offer, stream_id).await {
                    ReceiverOutcome::Validated { remote, local } => {
                        let session = IncomingServerSession::new(stream_id, stream, self.registry.clone());
                        session.add_validated_domain(&remote, &local).await;
                        Negotiated::Session(session)
                    }
                    ReceiverOutcome::Invalid | ReceiverOutcome::Rejected(_) => Negotiated::Done,
                }
            }
            "db:verify" if self.settings.dialback_enabled => {
                let Some(request) = DialbackVerify::parse(&el) else {
                    stream.close_with_error(StreamErrorCondition::InvalidXml).await;
                    return Negotiated::Done;
                };
                match ServerDialback::new(self).verify_as_authority(&stream, &request).await {
                    Ok(_) => stream.close().await,
                    Err(e) => close_on_error(&stream, &e).await,
                }
                Negotiated::Done
            }
            "stream:error" => {
                debug!(peer = %stream.peer(), condition = %parse_stream_error(&el), "peer aborted negotiation");
                stream.close().await;
                Negotiated::Done
            }
            other => {
                warn!(peer = %stream.peer(), "<{other}> before authentication");
                stream.close_with_error(StreamErrorCondition::NotAuthorized).await;
                Negotiated::Done
            }
        }
    }

    async fn accept_starttls(&self, stream: XmlStream) -> Negotiated {
        let Some(tls) = self.tls.as_ref().filter(|t| t.can_accept() && !stream.is_secure()) else {
            let _ = stream.send(&Element::new("failure").with_attr("xmlns", NS_TLS)).await;
            stream.close().await;
            return Negotiated::Done;
        };
        if stream.send(&Element::new("proceed").with_attr("xmlns", NS_TLS)).await.is_err() {
            stream.close().await;
            return Negotiated::Done;
        }
        let peer = stream.peer().to_owned();
        let secured = match stream.into_transport() {
            Ok(transport) => tls.accept(transport, self.settings.read_timeout).await,
            Err(e) => Err(e),
        };
        let stream = match secured {
            Ok(transport) => XmlStream::new(transport, true, peer),
            Err(e) => {
                warn!(%peer, "inbound TLS negotiation failed: {e}");
                return Negotiated::Done;
            }
        };
        match stream.read_header_timeout(self.settings.read_timeout).await {
            Ok(header) => Negotiated::Restart(stream, header),
            Err(e) => {
                close_on_error(&stream, &e).await;
                Negotiated::Done
            }
        }
    }

    /// Read loop of a validated incoming session: further dialback rounds,
    /// verify-requests and stanzas.
    pub async fn serve_incoming(&self, session: Arc<IncomingServerSession>) {
        let stream = session.connection().clone();
        loop {
            let next = tokio::select! {
                next = stream.read_element() => next,
                _ = stream.wait_closed() => break,
            };
            let el = match next {
                Ok(Some(el)) => el,
                Ok(None) => break,
                Err(e) => {
                    warn!(stream_id = %session.stream_id(), "incoming stream failed: {e}");
                    match e.condition() {
                        Some(condition) => session.close_with_error(condition).await,
                        None => session.close().await,
                    }
                    return;
                }
            };

            match el.name.as_str() {
                "db:result" => {
                    let Some(offer) = DialbackResult::parse(&el) else {
                        session.close_with_error(StreamErrorCondition::InvalidXml).await;
                        return;
                    };
                    let _pair = self.pair_locks.lock(&pair_key(&offer)).await;
                    let outcome = ServerDialback::new(self)
                        .verify_as_receiver(&stream, &offer, session.stream_id())
                        .await;
                    match outcome {
                        ReceiverOutcome::Validated { remote, local } => {
                            session.add_validated_domain(&remote, &local).await;
                        }
                        ReceiverOutcome::Invalid | ReceiverOutcome::Rejected(_) => {
                            // The stream is already closed.
                            session.close().await;
                            return;
                        }
                    }
                }
                "db:verify" => {
                    let Some(request) = DialbackVerify::parse(&el) else {
                        session.close_with_error(StreamErrorCondition::InvalidXml).await;
                        return;
                    };
                    if let Err(e) = ServerDialback::new(self).verify_as_authority(&stream, &request).await {
                        warn!(stream_id = %session.stream_id(), "verify request refused: {e}");
                        match e.condition() {
                            Some(condition) => session.close_with_error(condition).await,
                            None => session.close().await,
                        }
                        return;
                    }
                }
                "stream:error" => {
                    info!(
                        stream_id = %session.stream_id(),
                        condition = %parse_stream_error(&el),
                        "remote closed incoming stream"
                    );
                    break;
                }
                _ => {
                    if let Err(condition) = self.check_stanza(&session, &el).await {
                        warn!(stream_id = %session.stream_id(), %condition, "rejecting <{}>", el.name);
                        session.close_with_error(condition).await;
                        return;
                    }
                    self.sink.deliver(&session, el).await;
                }
            }
        }
        session.close().await;
    }

    /// A stanza must be addressed to a local domain that its sender's domain
    /// was validated for on this session.
    async fn check_stanza(&self, session: &IncomingServerSession, el: &Element) -> Result<(), StreamErrorCondition> {
        let from = el.attr("from").map(domain::jid_domain).ok_or(StreamErrorCondition::InvalidFrom)?;
        if !session.is_validated(&from).await {
            return Err(StreamErrorCondition::InvalidFrom);
        }
        let to = el.attr("to").map(domain::jid_domain).ok_or(StreamErrorCondition::HostUnknown)?;
        if !self.settings.is_local_domain(&to) {
            return Err(StreamErrorCondition::HostUnknown);
        }
        if !session.is_validated_pair(&from, &to).await {
            return Err(StreamErrorCondition::InvalidFrom);
        }
        Ok(())
    }
}

/// Lock key for one `(remote, local)` pairing.
fn pair_key(offer: &DialbackResult) -> String {
    format!("{}|{}", domain::normalize(&offer.from), domain::normalize(&offer.to))
}

async fn close_on_error(stream: &XmlStream, err: &FederationError) {
    match err.condition() {
        Some(condition) => stream.close_with_error(condition).await,
        None => stream.close().await,
    }
}
