//! A minimal length-prefixed message-framing protocol over reliable byte
//! streams (TCP).
//!
//! Three cooperating roles: [`connection::Connection`] (handshake, framed
//! transmit/receive, the per-connection worker loop),
//! [`server::Server`] (listener setup, accept loop, connection registry,
//! connection-limit policy) and [`client::Client`] (outbound connection
//! factory and registry). Applications plug in behaviour via
//! [`connection::ConnectionDelegate`], [`server::ServerDelegate`],
//! [`client::ClientDelegate`] and, for payload transforms,
//! [`plugin::Plugin`].
//!
//! No encryption, authentication, compression, cross-connection message
//! ordering, persistence, reconnect logic, or IPv6 support — see each
//! module for what it does and does not do.

pub mod client;
pub mod connection;
pub mod error;
pub mod framer;
pub mod host;
pub mod id;
pub mod plugin;
pub(crate) mod readiness;
pub mod server;
pub mod status;

pub use client::Client;
pub use connection::Connection;
pub use id::ConnId;
pub use plugin::Plugin;
pub use server::Server;
