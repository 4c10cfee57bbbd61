//! Port forwarder lifecycle

use podforward_transport::{
    build_dialer, build_transport, build_upgrade_url, ConnectionDescriptor, Dial,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;
use crate::group::TaskGroup;
use crate::output::Output;
use crate::ports::{ForwardedPorts, PortPair};
use crate::session::{ForwardPorts, SessionFactory, SessionParams, TunnelSessionFactory};
use crate::signal::Signal;

/// Local side of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    /// Local port to listen on; 0 picks a free port
    pub port: u16,
}

impl Source {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Remote side of a tunnel: a workload and a port inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// API path of the workload, e.g. `/api/v1/namespaces/default/pods/web-0`
    pub resource_link: String,
    pub container_port: u16,
}

impl Target {
    pub fn new(resource_link: impl Into<String>, container_port: u16) -> Self {
        Self {
            resource_link: resource_link.into(),
            container_port,
        }
    }

    /// Target a pod by namespace and name
    pub fn pod(namespace: &str, name: &str, container_port: u16) -> Self {
        Self::new(
            format!("/api/v1/namespaces/{}/pods/{}", namespace, name),
            container_port,
        )
    }
}

/// Inputs of one tunnel
#[derive(Debug, Clone)]
pub struct Options {
    pub connection: ConnectionDescriptor,
    pub source: Source,
    pub target: Target,
}

/// The `LOCAL:REMOTE` specification handed to the session
pub fn port_spec(source: Source, target: &Target) -> String {
    format!("{}:{}", source.port, target.container_port)
}

/// Starts a tunnel into a caller-owned task group.
///
/// Callers that only need to start tunnels can depend on this trait and
/// substitute a fake in tests.
pub trait StartPortForward {
    fn start<E>(
        &self,
        cancel: &CancellationToken,
        group: &mut TaskGroup<E>,
        options: &Options,
    ) -> Result<Readiness, TunnelError>
    where
        E: From<TunnelError> + Send + 'static;
}

/// Starts tunnels. Each `start` creates one session and never reuses it.
#[derive(Debug, Clone)]
pub struct PortForwarder<F = TunnelSessionFactory> {
    factory: F,
    output: Output,
}

impl Default for PortForwarder<TunnelSessionFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl PortForwarder<TunnelSessionFactory> {
    pub fn new() -> Self {
        Self::with_factory(TunnelSessionFactory::default())
    }
}

impl<F: SessionFactory> PortForwarder<F> {
    pub fn with_factory(factory: F) -> Self {
        Self {
            factory,
            output: Output::stdio(),
        }
    }

    /// Write session diagnostics to `output` instead of stdout/stderr
    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// Build the transport for `options` and start the tunnel.
    ///
    /// Returns once the watcher and forwarding tasks are registered in
    /// `group`. An error here means the tunnel never started.
    pub fn start<E>(
        &self,
        cancel: &CancellationToken,
        group: &mut TaskGroup<E>,
        options: &Options,
    ) -> Result<Readiness, TunnelError>
    where
        E: From<TunnelError> + Send + 'static,
    {
        let url = build_upgrade_url(&options.connection, &options.target.resource_link)
            .map_err(TunnelError::UrlConstruction)?;
        let (round_tripper, upgrader) =
            build_transport(&options.connection).map_err(TunnelError::TransportConstruction)?;
        let dialer = build_dialer(round_tripper, upgrader, url);

        self.start_with_dialer(cancel, group, Arc::new(dialer), options.source, &options.target)
    }

    /// Start a tunnel over an existing dialer
    pub fn start_with_dialer<E>(
        &self,
        cancel: &CancellationToken,
        group: &mut TaskGroup<E>,
        dialer: Arc<dyn Dial>,
        source: Source,
        target: &Target,
    ) -> Result<Readiness, TunnelError>
    where
        E: From<TunnelError> + Send + 'static,
    {
        let spec = port_spec(source, target);
        let stop = Signal::new();
        let ready = Signal::new();
        let forwarded = ForwardedPorts::new();

        let session = self
            .factory
            .create(SessionParams {
                dialer,
                ports: vec![spec.clone()],
                stop: stop.clone(),
                ready: ready.clone(),
                output: self.output.clone(),
                forwarded: forwarded.clone(),
            })
            .map_err(TunnelError::SessionConstruction)?;

        let done = Signal::new();

        let cancel = cancel.clone();
        let forwarding_done = done.clone();
        group.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("stopping the port forwarder"),
                _ = forwarding_done.closed() => {}
            }
            stop.close();
            Ok(())
        });

        let forwarding_done = done.clone();
        group.spawn(async move {
            debug!(port_pair = %spec, "starting a port forwarder for {}", spec);
            let result = session.forward_ports().await;
            forwarding_done.close();
            match result {
                Ok(()) => {
                    debug!("stopped the port forwarder");
                    Ok(())
                }
                Err(e) => Err(E::from(TunnelError::Forwarding(e))),
            }
        });

        Ok(Readiness::new(ready, done, forwarded))
    }
}

impl<F: SessionFactory> StartPortForward for PortForwarder<F> {
    fn start<E>(
        &self,
        cancel: &CancellationToken,
        group: &mut TaskGroup<E>,
        options: &Options,
    ) -> Result<Readiness, TunnelError>
    where
        E: From<TunnelError> + Send + 'static,
    {
        PortForwarder::start(self, cancel, group, options)
    }
}

/// Readiness of a started tunnel
#[derive(Debug, Clone)]
pub struct Readiness {
    ready: Signal,
    done: Signal,
    forwarded: ForwardedPorts,
}

impl Readiness {
    /// `done` closes when the forwarding task has ended
    pub fn new(ready: Signal, done: Signal, forwarded: ForwardedPorts) -> Self {
        Self {
            ready,
            done,
            forwarded,
        }
    }

    /// Wait until the tunnel accepts connections.
    ///
    /// Returns `false` if the forwarding task ended before becoming ready.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.ready.closed() => true,
            _ = self.done.closed() => self.ready.is_closed(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_closed()
    }

    /// Port pairs actually forwarded, once ready
    pub fn ports(&self) -> Option<Vec<PortPair>> {
        self.forwarded.get().map(<[PortPair]>::to_vec)
    }
}
