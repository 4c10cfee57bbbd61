//! Dialer for port-forward streams

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::Empty;
use tracing::{debug, instrument};
use url::Url;

use crate::error::TransportResult;
use crate::round_tripper::RoundTripper;
use crate::stream::PortStream;
use crate::upgrader::Upgrader;

/// Opens byte streams to ports inside a pod
#[async_trait]
pub trait Dial: Send + Sync {
    /// Open one stream to `remote_port`
    async fn dial(&self, remote_port: u16) -> TransportResult<PortStream>;
}

/// Dialer bound to one port-forward URL
#[derive(Debug, Clone)]
pub struct Dialer {
    round_tripper: RoundTripper,
    upgrader: Upgrader,
    method: Method,
    url: Url,
}

impl Dialer {
    pub fn new(round_tripper: RoundTripper, upgrader: Upgrader, method: Method, url: Url) -> Self {
        Self {
            round_tripper,
            upgrader,
            method,
            url,
        }
    }

    /// Use a different HTTP method for the upgrade request
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    fn request_url(&self, remote_port: u16) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("ports", &remote_port.to_string());
        url
    }
}

#[async_trait]
impl Dial for Dialer {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn dial(&self, remote_port: u16) -> TransportResult<PortStream> {
        let url = self.request_url(remote_port);

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let (builder, key) = self
            .upgrader
            .prepare(Request::builder().method(self.method.clone()).uri(path));
        let request = builder.body(Empty::<Bytes>::new())?;

        let response = self.round_tripper.round_trip(&url, request).await?;
        let ws = self.upgrader.upgrade(response, &key).await?;

        debug!(remote_port = remote_port, "Port-forward stream established");
        Ok(PortStream::spawn(ws, remote_port))
    }
}

/// Any `Arc`-shared dialer dials the same way
#[async_trait]
impl<D: Dial + ?Sized> Dial for std::sync::Arc<D> {
    async fn dial(&self, remote_port: u16) -> TransportResult<PortStream> {
        (**self).dial(remote_port).await
    }
}
