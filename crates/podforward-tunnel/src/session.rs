//! Forwarding session
//!
//! A [`TunnelSession`] listens on local addresses for each port pair and
//! relays every accepted connection to the pod over its own upgraded stream.
//! It runs until the stop signal closes or the connection to the API server
//! is lost.

use async_trait::async_trait;
use podforward_transport::Dial;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{ForwardError, SessionError};
use crate::output::Output;
use crate::ports::{parse_ports, ForwardedPorts, PortPair};
use crate::signal::Signal;

/// The blocking forwarding operation of a session
#[async_trait]
pub trait ForwardPorts: Send {
    /// Forward until stopped (`Ok`) or a fatal error occurs
    async fn forward_ports(self) -> Result<(), ForwardError>;
}

/// Everything a session is constructed from
#[derive(Clone)]
pub struct SessionParams {
    pub dialer: Arc<dyn Dial>,
    /// Port pairs in `LOCAL:REMOTE` form
    pub ports: Vec<String>,
    pub stop: Signal,
    pub ready: Signal,
    pub output: Output,
    pub forwarded: ForwardedPorts,
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("ports", &self.ports)
            .field("stop", &self.stop)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

/// Creates forwarding sessions
pub trait SessionFactory: Send + Sync {
    type Session: ForwardPorts + 'static;

    fn create(&self, params: SessionParams) -> Result<Self::Session, SessionError>;
}

/// Creates [`TunnelSession`]s listening on a fixed set of local addresses
#[derive(Debug, Clone)]
pub struct TunnelSessionFactory {
    addresses: Vec<IpAddr>,
}

impl Default for TunnelSessionFactory {
    fn default() -> Self {
        Self {
            addresses: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

impl TunnelSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on these addresses instead of the loopback pair
    pub fn with_addresses(addresses: Vec<IpAddr>) -> Self {
        Self { addresses }
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }
}

impl SessionFactory for TunnelSessionFactory {
    type Session = TunnelSession;

    fn create(&self, params: SessionParams) -> Result<TunnelSession, SessionError> {
        TunnelSession::new(params, self.addresses.clone())
    }
}

/// One active forward
pub struct TunnelSession {
    id: Uuid,
    dialer: Arc<dyn Dial>,
    ports: Vec<PortPair>,
    addresses: Vec<IpAddr>,
    stop: Signal,
    ready: Signal,
    output: Output,
    forwarded: ForwardedPorts,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("ports", &self.ports)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    pub fn new(params: SessionParams, addresses: Vec<IpAddr>) -> Result<Self, SessionError> {
        let ports = parse_ports(&params.ports)?;
        if addresses.is_empty() {
            return Err(SessionError::NoAddresses);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            dialer: params.dialer,
            ports,
            addresses,
            stop: params.stop,
            ready: params.ready,
            output: params.output,
            forwarded: params.forwarded,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ports(&self) -> &[PortPair] {
        &self.ports
    }

    /// Bind every listen address for one port pair.
    ///
    /// With local port 0 the first successful bind picks the port and the
    /// remaining addresses reuse it.
    async fn listen(&self, pair: PortPair) -> Result<(Vec<TcpListener>, u16), ForwardError> {
        let mut local = pair.local;
        let mut listeners = Vec::new();
        let mut last_error = None;

        for address in &self.addresses {
            let bound = TcpListener::bind(SocketAddr::new(*address, local))
                .await
                .and_then(|listener| Ok((listener.local_addr()?, listener)));

            match bound {
                Ok((addr, listener)) => {
                    if local == 0 {
                        local = addr.port();
                    }
                    self.output
                        .line(format_args!("Forwarding from {} -> {}", addr, pair.remote));
                    listeners.push(listener);
                }
                Err(e) => {
                    self.output.error_line(format_args!(
                        "Unable to listen on port {} ({}): {}",
                        local, address, e
                    ));
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(ForwardError::Listen {
                port: pair.local,
                source: last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no listen addresses")
                }),
            });
        }

        Ok((listeners, local))
    }
}

#[async_trait]
impl ForwardPorts for TunnelSession {
    async fn forward_ports(self) -> Result<(), ForwardError> {
        let session_id = self.id;

        // Verify the upgrade works before listening. The kubelet connects to
        // the pod port on every upgrade, so the workload sees one empty
        // connection per session. The error channel is not read here: a port
        // nobody listens on only shows up on the first real connection.
        let check_port = self.ports.first().map(|p| p.remote).unwrap_or_default();
        let check = tokio::select! {
            biased;
            _ = self.stop.closed() => {
                debug!(session_id = %session_id, "Stopped before forwarding started");
                return Ok(());
            }
            check = self.dialer.dial(check_port) => check.map_err(ForwardError::Upgrade)?,
        };
        // Dropping the stream closes the WebSocket, which ends the empty
        // connection inside the pod
        drop(check);
        debug!(session_id = %session_id, "Upgrade verified");

        let mut listeners = Vec::new();
        let mut forwarded = Vec::new();
        for pair in &self.ports {
            let (bound, local) = self.listen(*pair).await?;
            let actual = PortPair::new(local, pair.remote);
            forwarded.push(actual);
            listeners.extend(bound.into_iter().map(|listener| (listener, actual)));
        }

        self.forwarded.publish(forwarded);
        self.ready.close();
        info!(session_id = %session_id, ports = ?self.forwarded.get(), "Port forward ready");

        let shutdown = self.stop.child_token();
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let relay = Relay {
            session_id,
            dialer: self.dialer.clone(),
            output: self.output.clone(),
            fatal: fatal_tx,
        };

        let mut accept_loops = JoinSet::new();
        for (listener, pair) in listeners {
            accept_loops.spawn(relay.clone().accept_loop(listener, pair, shutdown.clone()));
        }
        drop(relay);

        let result = tokio::select! {
            _ = self.stop.closed() => {
                debug!(session_id = %session_id, "Stop requested");
                Ok(())
            }
            Some(e) = fatal_rx.recv() => {
                error!(session_id = %session_id, "Forwarding failed: {}", e);
                Err(e)
            }
        };

        shutdown.cancel();
        accept_loops.shutdown().await;
        result
    }
}

/// Per-session state shared by the accept loops
#[derive(Clone)]
struct Relay {
    session_id: Uuid,
    dialer: Arc<dyn Dial>,
    output: Output,
    fatal: mpsc::Sender<ForwardError>,
}

impl Relay {
    async fn accept_loop(self, listener: TcpListener, pair: PortPair, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    trace!(session_id = %self.session_id, peer = %peer, "Accepted connection");
                    self.output
                        .line(format_args!("Handling connection for {}", pair.local));

                    let relay = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = relay.handle_connection(stream, peer, pair) => {}
                        }
                    });
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, "Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut conn: TcpStream, peer: SocketAddr, pair: PortPair) {
        let mut stream = match self.dialer.dial(pair.remote).await {
            Ok(stream) => stream,
            Err(e) => {
                self.output.error_line(format_args!(
                    "error creating stream for port {} -> {}: {}",
                    pair.local, pair.remote, e
                ));
                let _ = self.fatal.try_send(ForwardError::LostConnection(e));
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut conn, &mut stream).await {
            Ok((to_pod, from_pod)) => {
                debug!(
                    session_id = %self.session_id,
                    peer = %peer,
                    bytes_to_pod = to_pod,
                    bytes_from_pod = from_pod,
                    "Connection closed"
                );
            }
            Err(e) => {
                self.output.error_line(format_args!(
                    "an error occurred forwarding {} -> {}: {}",
                    pair.local, pair.remote, e
                ));
            }
        }

        let _ = stream.shutdown().await;
        if let Some(message) = stream.remote_error().await {
            self.output.error_line(format_args!(
                "an error occurred forwarding {} -> {}: {}",
                pair.local, pair.remote, message
            ));
        }
    }
}
