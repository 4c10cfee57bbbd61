//! HTTP/1.1 round tripper with upgrade support
//!
//! Each round trip opens a fresh connection to the API server: the
//! connection is consumed by the protocol upgrade, so there is nothing to pool.

use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, HOST};
use http::{Request, Response};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use url::Url;

use crate::config::ConnectionDescriptor;
use crate::error::{TransportError, TransportResult};
use crate::tls::{build_tls_connector, server_name};

/// Any byte stream the HTTP handshake can run over
trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Authenticated transport to the API server
#[derive(Clone)]
pub struct RoundTripper {
    tls_connector: TlsConnector,
    server_name_override: Option<String>,
    authorization: Option<HeaderValue>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RoundTripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripper")
            .field("server_name_override", &self.server_name_override)
            .field("authenticated", &self.authorization.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RoundTripper {
    pub fn new(descriptor: &ConnectionDescriptor) -> TransportResult<Self> {
        descriptor.validate()?;

        let tls_connector = build_tls_connector(&descriptor.tls)?;

        let authorization = descriptor
            .bearer_token
            .as_deref()
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|_| {
                        TransportError::ConfigurationError(
                            "bearer token contains invalid header characters".to_string(),
                        )
                    })?;
                value.set_sensitive(true);
                Ok::<_, TransportError>(value)
            })
            .transpose()?;

        debug!("Round tripper created");

        Ok(Self {
            tls_connector,
            server_name_override: descriptor.tls.server_name.clone(),
            authorization,
            connect_timeout: descriptor.connect_timeout,
        })
    }

    /// Send a single request to `url` over a new connection.
    ///
    /// The connection driver runs with upgrades enabled, so the returned
    /// response can be handed to `hyper::upgrade::on`.
    pub async fn round_trip(
        &self,
        url: &Url,
        mut request: Request<Empty<Bytes>>,
    ) -> TransportResult<Response<Incoming>> {
        let io = self.connect(url).await?;

        let (mut sender, conn) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io)).await?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Connection closed: {}", e);
            }
        });

        let headers = request.headers_mut();
        if !headers.contains_key(HOST) {
            headers.insert(HOST, host_header(url)?);
        }
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }

        trace!("Sending {} {}", request.method(), url);
        Ok(sender.send_request(request).await?)
    }

    async fn connect(&self, url: &Url) -> TransportResult<Box<dyn Io>> {
        let host = url.host_str().ok_or_else(|| {
            TransportError::ConfigurationError(format!("URL has no host: {}", url))
        })?;
        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::ConfigurationError(format!("URL has no port: {}", url))
        })?;
        let address = format!("{}:{}", host, port);
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let connect = async {
            let tcp_stream = TcpStream::connect(&address).await.map_err(|e| {
                TransportError::ConnectionFailed {
                    address: address.clone(),
                    source: e,
                }
            })?;
            let _ = tcp_stream.set_nodelay(true);

            if !secure {
                return Ok::<_, TransportError>(Box::new(tcp_stream) as Box<dyn Io>);
            }

            let dns_name = server_name(host, self.server_name_override.as_deref())?;
            let tls_stream = self
                .tls_connector
                .connect(dns_name, tcp_stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

            Ok::<_, TransportError>(Box::new(tls_stream) as Box<dyn Io>)
        };

        let io = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(address.clone()))??;

        debug!("Connected to {}", address);
        Ok(io)
    }
}

fn host_header(url: &Url) -> TransportResult<HeaderValue> {
    let host = url.host_str().unwrap_or_default();
    let value = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value)
        .map_err(|_| TransportError::ConfigurationError(format!("invalid host '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let url = Url::parse("https://cluster.example:6443/api").unwrap();
        assert_eq!(host_header(&url).unwrap(), "cluster.example:6443");

        let url = Url::parse("https://cluster.example/api").unwrap();
        assert_eq!(host_header(&url).unwrap(), "cluster.example");
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let descriptor = ConnectionDescriptor::builder()
            .host("https://cluster.example:6443")
            .bearer_token("bad\ntoken")
            .build()
            .unwrap();

        assert!(matches!(
            RoundTripper::new(&descriptor),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let descriptor = ConnectionDescriptor::builder()
            .host("https://cluster.example:6443")
            .bearer_token("hidden")
            .build()
            .unwrap();

        let round_tripper = RoundTripper::new(&descriptor).unwrap();
        let debug = format!("{:?}", round_tripper);
        assert!(!debug.contains("hidden"));
        assert!(debug.contains("authenticated: true"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let round_tripper = RoundTripper::new(&ConnectionDescriptor::new("ftp://x")).unwrap();
        let url = Url::parse("ftp://cluster.example/api").unwrap();
        let request = Request::get("/api").body(Empty::new()).unwrap();

        assert!(matches!(
            round_tripper.round_trip(&url, request).await,
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
