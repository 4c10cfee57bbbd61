//! Upgrade transport for pod port forwarding
//!
//! This crate builds everything needed to reach a port inside a pod through
//! the Kubernetes API server:
//!
//! - **Upgrade URL**: `<host><resource link>/portforward`
//! - **Round tripper**: TCP + rustls + HTTP/1.1 with upgrades, carrying the
//!   bearer token of the [`ConnectionDescriptor`]
//! - **Upgrader**: WebSocket handshake negotiating `v4.channel.k8s.io`
//! - **Dialer**: binds the above to a method and URL and opens one
//!   [`PortStream`] per forwarded connection
//!
//! # Stream Framing
//!
//! Every binary WebSocket message starts with a channel byte:
//! - `0`: data for the forwarded port
//! - `1`: error text reported by the kubelet
//!
//! The first message on each channel carries the port number (2 bytes,
//! little-endian) and no payload.

pub mod builder;
pub mod config;
pub mod dialer;
pub mod error;
pub mod round_tripper;
pub mod stream;
pub mod tls;
pub mod upgrader;

pub use builder::{build_dialer, build_transport, build_upgrade_url};
pub use config::{ConnectionDescriptor, ConnectionDescriptorBuilder, TlsMaterial};
pub use dialer::{Dial, Dialer};
pub use error::{TransportError, TransportResult};
pub use round_tripper::RoundTripper;
pub use stream::PortStream;
pub use upgrader::{Upgrader, PORT_FORWARD_PROTOCOL};

pub use url::{ParseError as UrlParseError, Url};
