//! Tunnel runner for pod port forwarding
//!
//! [`PortForwarder::start`] builds the transport for one tunnel, creates a
//! forwarding session and registers two tasks in a shared [`TaskGroup`]:
//!
//! - a cancellation watcher that closes the session's stop [`Signal`] once the
//!   caller's token is cancelled
//! - the forwarding task, which listens locally and relays every accepted
//!   connection to the pod until stopped or a fatal error occurs
//!
//! `start` returns as soon as both tasks are registered. The caller observes
//! the outcome through the task group and readiness through [`Readiness`].

pub mod error;
pub mod forwarder;
pub mod group;
pub mod output;
pub mod ports;
pub mod session;
pub mod signal;

pub use error::{ForwardError, SessionError, TunnelError};
pub use forwarder::{
    port_spec, Options, PortForwarder, Readiness, Source, StartPortForward, Target,
};
pub use group::TaskGroup;
pub use output::Output;
pub use ports::{parse_ports, ForwardedPorts, PortPair};
pub use session::{ForwardPorts, SessionFactory, SessionParams, TunnelSession, TunnelSessionFactory};
pub use signal::Signal;
