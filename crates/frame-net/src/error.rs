use thiserror::Error;

/// Raised synchronously from configuration calls; never from the I/O path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {0} out of range 1..=65535")]
    PortOutOfRange(u32),
    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),
    #[error("unresolvable host: {0}")]
    UnresolvableHost(String),
    #[error("no addresses configured for listening")]
    NoAddresses,
}

/// Operation invoked in the wrong lifecycle state, e.g. starting listeners
/// twice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("listeners are already active")]
    ListenersAlreadyActive,
}

/// Everything that can go wrong starting a [`Server`](crate::server::Server):
/// either its configuration was invalid, or it was already running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerStartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Peer sent a non-[`SC_OK`](crate::status::SC_OK) byte during handshake.
/// Fatal to the [`Connection`](crate::connection::Connection).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("handshake failed: peer responded with status byte {0:#04x}")]
pub struct HandshakeError(pub u8);

/// Peer returned a non-OK ACK to a size header. Fatal to the current
/// transmit; the connection remains usable only if the caller chooses to
/// retry (policy not mandated by this crate).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transmit rejected by peer: status byte {0:#04x}")]
pub struct TransmitRejected(pub u8);
