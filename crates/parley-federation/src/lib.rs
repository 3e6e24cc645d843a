//! # parley-federation
//!
//! XMPP server-to-server federation core for Parley.
//!
//! ## Architecture
//!
//! A local server proves its identity to a remote server either with TLS and
//! SASL EXTERNAL, or with server dialback: the remote calls back to an
//! authoritative server for the claimed domain and checks a key derived from
//! a shared secret and the stream identifier.
//!
//! ```text
//!  a.example                    b.example
//!     │── outgoing session ──────►│   a.example may send to b.example
//!     │◄────── incoming session ──│   (b.example's own connection back)
//! ```
//!
//! ## Key concepts
//!
//! - **Keys** (`keys.rs`): HMAC-SHA256 dialback keys and constant-time checks.
//! - **Streams** (`stream.rs`, `stanza.rs`): XML stream framing over any
//!   byte transport, with in-place STARTTLS upgrade.
//! - **Dialback** (`dialback.rs`): the Originating, Receiving and
//!   Authoritative roles.
//! - **Sessions** (`session.rs`, `registry.rs`): authenticated connections
//!   and the hostname → session routing table.
//! - **Outgoing / incoming** (`outgoing.rs`, `incoming.rs`): the policies
//!   layered on top, i.e. session reuse, aliasing, subdomain fallback,
//!   inbound negotiation and the stanza gate.
//! - **Discovery** (`discovery.rs`): hostname → endpoint resolution and
//!   connecting, both replaceable for tests.

pub mod access;
pub mod dialback;
pub mod discovery;
pub mod error;
pub mod federation;
pub mod incoming;
pub mod keys;
pub mod locks;
pub mod outgoing;
pub mod registry;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod tls;

pub use error::{FederationError, StreamErrorCondition};
pub use federation::{Federation, FederationBuilder, FederationSettings, StanzaSink};
pub use keys::DialbackSecret;
pub use registry::{InMemorySessionRegistry, SessionRegistry};
pub use session::{IncomingServerSession, OutgoingServerSession, SessionState};
