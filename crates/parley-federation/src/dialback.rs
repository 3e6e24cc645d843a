//! Server dialback (XEP-0220): the three protocol roles.
//!
//! ```text
//!  Originating (a.example)        Receiving (b.example)        Authoritative (a.example)
//!        │── stream header ────────────►│                               │
//!        │◄─────────── header id=S1 ────│                               │
//!        │── db:result key=K ──────────►│                               │
//!        │                              │── stream header ─────────────►│
//!        │                              │── db:verify id=S1 key=K ─────►│
//!        │                              │◄──────────── type=valid ──────│ (closed)
//!        │◄─────────── db:result valid ─│                               │
//! ```
//!
//! [`ServerDialback`] is instantiated per attempt and holds nothing but a
//! borrow of the [`Federation`] context. The Authoritative role needs only
//! the key derivation and the secret; it never reads or writes session state.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_common::domain;

use crate::{
    error::{FederationError, StreamErrorCondition},
    federation::Federation,
    keys::DialbackSecret,
    stanza::{DialbackResult, DialbackVerify, StreamFeatures, StreamHeader, Verdict},
    stream::XmlStream,
};

/// A stream we initiated, after the header exchange.
pub struct OpenedStream {
    pub stream: XmlStream,
    pub header: StreamHeader,
    pub features: Option<StreamFeatures>,
}

/// A stream on which the remote accepted our result-offer.
pub struct Originated {
    pub stream: XmlStream,
    /// The identifier the remote assigned to the stream.
    pub stream_id: String,
}

/// What the Receiving role decided about a result-offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverOutcome {
    /// Answered `valid`; the stream stays open.
    Validated { remote: String, local: String },
    /// Answered `invalid`; the stream was closed.
    Invalid,
    /// Refused with a stream error; the stream was closed.
    Rejected(StreamErrorCondition),
}

pub struct ServerDialback<'a> {
    fed: &'a Federation,
}

impl<'a> ServerDialback<'a> {
    pub fn new(fed: &'a Federation) -> Self {
        Self { fed }
    }

    // ── Stream setup ─────────────────────────────────────────────────────────

    /// Resolve `hostname`, connect to the first endpoint that answers and
    /// exchange stream headers.
    pub async fn open_stream(&self, local: &str, hostname: &str) -> Result<OpenedStream, FederationError> {
        let endpoints = self.fed.resolver.resolve(hostname, self.fed.settings.default_port).await?;
        let mut last_err = None;
        for endpoint in endpoints {
            let transport = match self.fed.connector.connect(&endpoint).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(hostname, %endpoint, "connect failed: {e}");
                    last_err = Some(e);
                    continue;
                }
            };
            let stream = XmlStream::new(transport, false, hostname);
            match self.start_stream(stream, local, hostname).await {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    debug!(hostname, %endpoint, "stream setup failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        self.fed.resolver.invalidate(hostname).await;
        Err(last_err.unwrap_or_else(|| FederationError::RemoteUnreachable(hostname.to_owned())))
    }

    /// Send our header on `stream` and read the peer's header and features.
    /// Closes the stream on failure.
    pub async fn start_stream(
        &self,
        stream: XmlStream,
        local: &str,
        hostname: &str,
    ) -> Result<OpenedStream, FederationError> {
        match self.exchange_headers(&stream, local, hostname).await {
            Ok((header, features)) => Ok(OpenedStream { stream, header, features }),
            Err(e) => {
                stream.close().await;
                Err(e)
            }
        }
    }

    async fn exchange_headers(
        &self,
        stream: &XmlStream,
        local: &str,
        hostname: &str,
    ) -> Result<(StreamHeader, Option<StreamFeatures>), FederationError> {
        let limit = self.fed.settings.read_timeout;
        stream.send_header(&StreamHeader::initiating(local, hostname)).await?;
        let header = stream.read_header_timeout(limit).await?;
        if !header.supports_features() {
            return Ok((header, None));
        }
        let el = stream.expect_element(limit).await?;
        if el.name != "stream:features" {
            return Err(FederationError::UnexpectedElement(el.name));
        }
        Ok((header, Some(StreamFeatures::parse(&el))))
    }

    // ── Originating Server ───────────────────────────────────────────────────

    /// Prove to `hostname` that we may send as `local`.
    ///
    /// `Ok(None)` means the remote answered `invalid`. The stream is closed on
    /// every outcome except success.
    pub async fn originate(&self, local: &str, hostname: &str) -> Result<Option<Originated>, FederationError> {
        let opened = self.open_stream(local, hostname).await?;
        self.originate_on(opened, local, hostname).await
    }

    /// Run the result-offer round on an already opened stream.
    pub async fn originate_on(
        &self,
        opened: OpenedStream,
        local: &str,
        hostname: &str,
    ) -> Result<Option<Originated>, FederationError> {
        let OpenedStream { stream, header, .. } = opened;
        let outcome = self.offer_and_wait(&stream, &header, local, hostname).await;
        match outcome {
            Ok(Verdict::Valid) => {
                let stream_id = header.id.unwrap_or_default();
                info!(local, hostname, "dialback accepted by remote");
                Ok(Some(Originated { stream, stream_id }))
            }
            Ok(Verdict::Invalid) => {
                warn!(local, hostname, "dialback rejected by remote");
                stream.close().await;
                Ok(None)
            }
            Err(e) => {
                stream.close().await;
                Err(e)
            }
        }
    }

    async fn offer_and_wait(
        &self,
        stream: &XmlStream,
        header: &StreamHeader,
        local: &str,
        hostname: &str,
    ) -> Result<Verdict, FederationError> {
        if !header.declares_dialback {
            return Err(FederationError::DialbackUnsupported(hostname.to_owned()));
        }
        let stream_id = header
            .id
            .as_deref()
            .ok_or_else(|| FederationError::protocol(StreamErrorCondition::InvalidId, "stream header without id"))?;

        let key = self.fed.secret.derive(stream_id);
        stream.send(&DialbackResult::offer(local, hostname, &key).to_element()).await?;

        let deadline = Instant::now() + self.fed.settings.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let el = stream.expect_element(remaining).await?;
            match DialbackResult::parse(&el) {
                Some(answer) if answer.from == hostname && answer.to == local => {
                    return answer.verdict.ok_or_else(|| {
                        FederationError::protocol(StreamErrorCondition::InvalidXml, "db:result answer without type")
                    });
                }
                _ => debug!(hostname, "ignoring <{}> while awaiting dialback result", el.name),
            }
        }
    }

    // ── Receiving Server ─────────────────────────────────────────────────────

    /// Decide on a result-offer received on `stream`, whose identifier we
    /// generated as `stream_id`. The answer (or stream error) is written to
    /// `stream` before returning.
    pub async fn verify_as_receiver(
        &self,
        stream: &XmlStream,
        offer: &DialbackResult,
        stream_id: &str,
    ) -> ReceiverOutcome {
        match self.check_offer(offer).await {
            Ok(()) => {}
            Err(condition) => {
                warn!(from = %offer.from, to = %offer.to, %condition, "rejecting dialback offer");
                stream.close_with_error(condition).await;
                return ReceiverOutcome::Rejected(condition);
            }
        }
        let remote = domain::normalize(&offer.from);
        let local = domain::normalize(&offer.to);
        let key = offer.key.as_deref().unwrap_or_default();

        let verdict = match self.verify_with_authority(&local, &remote, stream_id, key).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(%remote, %local, "authoritative verification failed: {e}");
                let answer = DialbackResult::answer(&local, &remote, Verdict::Invalid);
                let _ = stream.send(&answer.to_element()).await;
                stream.close_with_error(StreamErrorCondition::RemoteConnectionFailed).await;
                return ReceiverOutcome::Rejected(StreamErrorCondition::RemoteConnectionFailed);
            }
        };

        let answer = DialbackResult::answer(&local, &remote, verdict);
        if let Err(e) = stream.send(&answer.to_element()).await {
            debug!(%remote, "could not deliver dialback answer: {e}");
            stream.close().await;
            return ReceiverOutcome::Invalid;
        }
        if verdict.is_valid() {
            info!(%remote, %local, "dialback verified");
            ReceiverOutcome::Validated { remote, local }
        } else {
            warn!(%remote, %local, "dialback key rejected by authoritative server");
            stream.close().await;
            ReceiverOutcome::Invalid
        }
    }

    /// Policy checks preceding any network work.
    async fn check_offer(&self, offer: &DialbackResult) -> Result<(), StreamErrorCondition> {
        let remote = domain::validate(&offer.from).map_err(|_| StreamErrorCondition::InvalidFrom)?;
        let local = domain::validate(&offer.to).map_err(|_| StreamErrorCondition::HostUnknown)?;
        if !self.fed.access.is_allowed(&remote) {
            return Err(StreamErrorCondition::HostUnknown);
        }
        if !self.fed.settings.is_local_domain(&local) {
            return Err(StreamErrorCondition::HostUnknown);
        }
        for session in self.fed.registry.incoming(&remote).await {
            if !session.is_closed() && session.is_validated_pair(&remote, &local).await {
                return Err(StreamErrorCondition::NotAuthorized);
            }
        }
        if offer.key.is_none() {
            return Err(StreamErrorCondition::NotAuthorized);
        }
        Ok(())
    }

    /// Open a fresh connection to `remote`'s authoritative server and ask it
    /// whether `key` is valid for `stream_id`. The connection is closed
    /// before returning.
    async fn verify_with_authority(
        &self,
        local: &str,
        remote: &str,
        stream_id: &str,
        key: &str,
    ) -> Result<Verdict, FederationError> {
        let opened = self.open_stream(local, remote).await?;
        let stream = opened.stream;
        let result = self.exchange_verify(&stream, &opened.header, local, remote, stream_id, key).await;
        match result.as_ref().err().and_then(FederationError::condition) {
            Some(condition) => stream.close_with_error(condition).await,
            None => stream.close().await,
        }
        result
    }

    async fn exchange_verify(
        &self,
        stream: &XmlStream,
        header: &StreamHeader,
        local: &str,
        remote: &str,
        stream_id: &str,
        key: &str,
    ) -> Result<Verdict, FederationError> {
        if !header.declares_dialback {
            return Err(FederationError::protocol(
                StreamErrorCondition::InvalidNamespace,
                "authoritative server did not declare dialback",
            ));
        }
        stream.send(&DialbackVerify::request(local, remote, stream_id, key).to_element()).await?;

        let deadline = Instant::now() + self.fed.settings.read_timeout;
        let response = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let el = stream.expect_element(remaining).await?;
            if el.name == "db:verify" {
                break DialbackVerify::parse(&el).ok_or_else(|| {
                    FederationError::protocol(StreamErrorCondition::InvalidXml, "malformed db:verify response")
                })?;
            }
            debug!(remote, "ignoring <{}> while awaiting verify response", el.name);
        };

        if response.id != stream_id {
            return Err(FederationError::protocol(StreamErrorCondition::InvalidId, "verify response id mismatch"));
        }
        if domain::normalize(&response.from) != remote {
            return Err(FederationError::protocol(StreamErrorCondition::InvalidFrom, "verify response from mismatch"));
        }
        if domain::normalize(&response.to) != local {
            return Err(FederationError::protocol(StreamErrorCondition::HostUnknown, "verify response to mismatch"));
        }
        Ok(response.verdict.unwrap_or(Verdict::Invalid))
    }

    // ── Authoritative Server ─────────────────────────────────────────────────

    /// Answer a verify-request received on `stream`. Closing the stream is
    /// left to the caller.
    pub async fn verify_as_authority(
        &self,
        stream: &XmlStream,
        request: &DialbackVerify,
    ) -> Result<Verdict, FederationError> {
        if !self.fed.settings.is_local_domain(&domain::normalize(&request.to)) {
            return Err(FederationError::protocol(
                StreamErrorCondition::HostUnknown,
                format!("verify request for foreign domain '{}'", request.to),
            ));
        }
        let response = answer_verify(&self.fed.secret, request);
        stream.send(&response.to_element()).await?;
        let verdict = response.verdict.unwrap_or(Verdict::Invalid);
        debug!(from = %request.from, id = %request.id, verdict = verdict.as_str(), "answered verify request");
        Ok(verdict)
    }
}

/// Pure Authoritative-role decision: `valid` iff the key is the one we
/// derive for the request's stream identifier.
pub fn answer_verify(secret: &DialbackSecret, request: &DialbackVerify) -> DialbackVerify {
    let valid = request.key.as_deref().is_some_and(|key| secret.verify(&request.id, key));
    DialbackVerify::response(&request.to, &request.from, &request.id, Verdict::from_bool(valid))
}
