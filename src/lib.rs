//! Core of a public-edge HTTP reverse tunnel broker.
//!
//! A user behind NAT dials outbound TCP connections to a per-client
//! [`agent::TunnelAgent`], which pools them. When external HTTP (or
//! WebSocket) traffic addressed to that client arrives, a [`client::Client`]
//! checks a socket out of the pool, writes the request over it verbatim, and
//! streams the response back to the external caller. The
//! [`manager::ClientManager`] owns the identifier registry and the client
//! lifecycle.
//!
//! The public-facing HTTP server that routes by hostname or path, admin
//! endpoints, and TLS termination are collaborators outside this crate; they
//! drive the broker through [`manager::ClientManager`] and the per-client
//! proxy API on [`client::Client`].

/// Per-client tunnel socket pool and presence events.
pub mod agent;
/// Per-client forwarding and grace-period lifecycle.
pub mod client;
/// Identifier registry and client creation.
pub mod manager;
mod error;
mod parse;
mod util;

pub use error::{AgentError, ForwardError};
pub use manager::{BrokerOpts, BrokerStats, ClientInfo, ClientManager};
pub use parse::{BodyFraming, RawHeaders, RequestHead, ResponseHead};
pub use util::prebuffered::Prebuffered;

/// How much data to read for an HTTP head section before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
