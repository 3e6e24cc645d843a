//! Federation-specific error types.

use std::fmt;

use thiserror::Error;

/// Stream-level error conditions (RFC 6120 §4.9.3) raised or understood by
/// the federation layer. Every one of them terminates the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorCondition {
    InvalidNamespace,
    HostUnknown,
    NotAuthorized,
    InvalidId,
    InvalidFrom,
    RemoteConnectionFailed,
    InvalidXml,
    ConnectionTimeout,
    UnsupportedStanzaType,
    UndefinedCondition,
}

impl StreamErrorCondition {
    /// Element name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidNamespace => "invalid-namespace",
            Self::HostUnknown => "host-unknown",
            Self::NotAuthorized => "not-authorized",
            Self::InvalidId => "invalid-id",
            Self::InvalidFrom => "invalid-from",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::InvalidXml => "invalid-xml",
            Self::ConnectionTimeout => "connection-timeout",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UndefinedCondition => "undefined-condition",
        }
    }

    /// Inverse of [`as_str`](Self::as_str). Unknown names map to
    /// `undefined-condition`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "invalid-namespace" => Self::InvalidNamespace,
            "host-unknown" => Self::HostUnknown,
            "not-authorized" => Self::NotAuthorized,
            "invalid-id" => Self::InvalidId,
            "invalid-from" => Self::InvalidFrom,
            "remote-connection-failed" => Self::RemoteConnectionFailed,
            "invalid-xml" => Self::InvalidXml,
            "connection-timeout" => Self::ConnectionTimeout,
            "unsupported-stanza-type" => Self::UnsupportedStanzaType,
            _ => Self::UndefinedCondition,
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Transport ───────────────────────────────────────────────────────────

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Stream closed by peer")]
    StreamClosed,

    #[error("Failed to resolve server '{0}': {1}")]
    DiscoveryFailed(String, String),

    #[error("No reachable endpoint for '{0}'")]
    RemoteUnreachable(String),

    // ── Stream protocol ─────────────────────────────────────────────────────

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// A violation we detected; the stream is answered with `condition`.
    #[error("Protocol violation ({condition}): {detail}")]
    Protocol { condition: StreamErrorCondition, detail: String },

    /// The peer terminated the stream with a stream error.
    #[error("Peer sent stream error '{0}'")]
    PeerStreamError(StreamErrorCondition),

    #[error("Unexpected element <{0}>")]
    UnexpectedElement(String),

    #[error("Domain '{0}' is not authenticated on this session")]
    NotAuthenticated(String),

    #[error("Server '{0}' does not support dialback")]
    DialbackUnsupported(String),

    // ── TLS / SASL ──────────────────────────────────────────────────────────

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("STARTTLS not offered by '{0}'")]
    StartTlsUnavailable(String),

    #[error("SASL EXTERNAL rejected by '{0}'")]
    SaslRejected(String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FederationError {
    /// Shorthand for a protocol violation answered with `condition`.
    pub fn protocol(condition: StreamErrorCondition, detail: impl Into<String>) -> Self {
        Self::Protocol { condition, detail: detail.into() }
    }

    /// Stream error condition to send to the peer before closing, if any.
    pub fn condition(&self) -> Option<StreamErrorCondition> {
        match self {
            Self::Protocol { condition, .. } => Some(*condition),
            Self::Xml(_) => Some(StreamErrorCondition::InvalidXml),
            Self::Timeout(_) => Some(StreamErrorCondition::ConnectionTimeout),
            Self::UnexpectedElement(_) => Some(StreamErrorCondition::UnsupportedStanzaType),
            _ => None,
        }
    }
}

impl From<rustls::Error> for FederationError {
    fn from(e: rustls::Error) -> Self {
        FederationError::Tls(e.to_string())
    }
}
