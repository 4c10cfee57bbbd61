use podforward_transport::{TransportError, UrlParseError};
use thiserror::Error;

/// Errors surfaced by the tunnel runner.
///
/// The first three are returned synchronously by `start`; `Forwarding` is
/// reported through the task group after the tunnel started.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("could not build URL for portforward: {0}")]
    UrlConstruction(#[source] UrlParseError),

    #[error("could not create a round tripper: {0}")]
    TransportConstruction(#[source] TransportError),

    #[error("could not create a port forwarder: {0}")]
    SessionConstruction(#[source] SessionError),

    #[error("could not run the forwarder: {0}")]
    Forwarding(#[source] ForwardError),
}

/// Errors creating a forwarding session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("must specify at least one port")]
    NoPorts,

    #[error("must specify at least one listen address")]
    NoAddresses,

    #[error("invalid port specification '{spec}': {reason}")]
    InvalidPort { spec: String, reason: String },
}

/// Fatal errors of a running forwarding session
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("error upgrading connection: {0}")]
    Upgrade(#[source] TransportError),

    #[error("unable to listen on any of the requested addresses for port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("lost connection to pod: {0}")]
    LostConnection(#[source] TransportError),
}
