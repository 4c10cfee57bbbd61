//! podforward - forward a local port to a port inside a Kubernetes pod
//!
//! Tunnels local connections through the API server's port-forward
//! subresource until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use podforward_transport::ConnectionDescriptor;
use podforward_tunnel::{
    Options, PortForwarder, PortPair, Source, StartPortForward, TaskGroup, Target,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// podforward - Forward a local port to a port inside a Kubernetes pod
#[derive(Parser, Debug)]
#[command(name = "podforward")]
#[command(about = "Forward a local port to a port inside a Kubernetes pod")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Forward a local port to a port inside a Kubernetes pod through the API
server's port-forward subresource. Runs until interrupted with Ctrl+C.

EXAMPLES:
  # Forward localhost:9090 to port 8080 of pod web-0
  podforward --server https://cluster.example:6443 \
    --token-file /var/run/secrets/token \
    --certificate-authority ca.crt \
    --pod web-0 9090:8080

  # Let the OS pick the local port
  podforward --connection-file cluster.json --pod web-0 :8080

ENVIRONMENT VARIABLES:
  PODFORWARD_SERVER           API server address
  PODFORWARD_NAMESPACE        Namespace of the pod
  PODFORWARD_POD              Pod name
  PODFORWARD_TOKEN            Bearer token
  PODFORWARD_TOKEN_FILE       File containing the bearer token
  PODFORWARD_CONNECTION_FILE  JSON connection descriptor
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// API server address (e.g., https://cluster.example:6443)
    #[arg(long, env = "PODFORWARD_SERVER")]
    server: Option<String>,

    /// Namespace of the pod
    #[arg(short, long, env = "PODFORWARD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the pod
    #[arg(long, env = "PODFORWARD_POD")]
    pod: String,

    /// Ports to forward: REMOTE, LOCAL:REMOTE or :REMOTE
    #[arg(value_name = "LOCAL:REMOTE")]
    ports: String,

    /// Bearer token for the API server
    #[arg(long, env = "PODFORWARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// File containing the bearer token
    #[arg(long, env = "PODFORWARD_TOKEN_FILE", conflicts_with = "token")]
    token_file: Option<PathBuf>,

    /// PEM file with the CA bundle of the API server
    #[arg(long, env = "PODFORWARD_CERTIFICATE_AUTHORITY")]
    certificate_authority: Option<PathBuf>,

    /// PEM file with the client certificate
    #[arg(long, env = "PODFORWARD_CLIENT_CERTIFICATE", requires = "client_key")]
    client_certificate: Option<PathBuf>,

    /// PEM file with the client private key
    #[arg(long, env = "PODFORWARD_CLIENT_KEY", requires = "client_certificate")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (insecure, for development only)
    #[arg(long, env = "PODFORWARD_INSECURE_SKIP_TLS_VERIFY")]
    insecure_skip_tls_verify: bool,

    /// JSON file with a connection descriptor; flags override its fields
    #[arg(long, env = "PODFORWARD_CONNECTION_FILE")]
    connection_file: Option<PathBuf>,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", what, path.display()))
}

/// Assemble the connection descriptor from the connection file and flags
fn load_connection(cli: &Cli) -> Result<ConnectionDescriptor> {
    let mut connection = match &cli.connection_file {
        Some(path) => serde_json::from_str(&read_file(path, "connection file")?)
            .with_context(|| format!("Invalid connection file {}", path.display()))?,
        None => ConnectionDescriptor::default(),
    };

    if let Some(server) = &cli.server {
        connection.host = server.trim_end_matches('/').to_string();
    }

    if let Some(token) = &cli.token {
        connection.bearer_token = Some(token.clone());
    } else if let Some(path) = &cli.token_file {
        connection.bearer_token = Some(read_file(path, "token")?.trim().to_string());
    }

    if let Some(path) = &cli.certificate_authority {
        connection.tls.ca_data = Some(read_file(path, "certificate authority")?);
    }
    if let Some(path) = &cli.client_certificate {
        connection.tls.client_certificate_data = Some(read_file(path, "client certificate")?);
    }
    if let Some(path) = &cli.client_key {
        connection.tls.client_key_data = Some(read_file(path, "client key")?);
    }
    if cli.insecure_skip_tls_verify {
        warn!("TLS verification of the API server is disabled");
        connection.tls.insecure_skip_tls_verify = true;
    }

    connection
        .validate()
        .context("Incomplete connection settings (use --server or --connection-file)")?;
    Ok(connection)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let pair: PortPair = cli.ports.parse().context("Invalid port specification")?;
    let connection = load_connection(&cli)?;

    let options = Options {
        connection,
        source: Source::new(pair.local),
        target: Target::pod(&cli.namespace, &cli.pod, pair.remote),
    };

    info!(
        "Forwarding {} to pod {}/{} via {}",
        pair, cli.namespace, cli.pod, options.connection.host
    );

    let cancel = CancellationToken::new();

    // Cancel on Ctrl+C; not part of the group so it never holds it open
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                interrupt.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    if let Err(e) = run(&PortForwarder::new(), &options, &cli.pod, cancel).await {
        error!("❌ Port forward failed: {:#}", e);
        return Err(e);
    }

    info!("Port forward stopped");
    Ok(())
}

/// Run one tunnel until `cancel` fires or forwarding fails
async fn run<P: StartPortForward>(
    forwarder: &P,
    options: &Options,
    pod: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let mut group = TaskGroup::<anyhow::Error>::with_cancellation(cancel.clone());

    let readiness = forwarder
        .start(&cancel, &mut group, options)
        .context("Failed to start the port forward")?;

    let pod = pod.to_string();
    group.spawn(async move {
        if readiness.wait().await {
            for ports in readiness.ports().unwrap_or_default() {
                info!("✅ Ready: localhost:{} -> {}:{}", ports.local, pod, ports.remote);
            }
        }
        Ok(())
    });

    group.wait().await
}
