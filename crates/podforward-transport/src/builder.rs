//! Construction of the upgrade URL, transport and dialer for one tunnel

use http::Method;
use tracing::debug;
use url::Url;

use crate::config::ConnectionDescriptor;
use crate::dialer::Dialer;
use crate::error::TransportResult;
use crate::round_tripper::RoundTripper;
use crate::upgrader::Upgrader;

/// Path suffix of the port-forward subresource
const PORT_FORWARD_SUFFIX: &str = "/portforward";

/// Build `<host><resource_link>/portforward`
pub fn build_upgrade_url(
    connection: &ConnectionDescriptor,
    resource_link: &str,
) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}{}{}",
        connection.host, resource_link, PORT_FORWARD_SUFFIX
    ))
}

/// Build an authenticated round tripper and the upgrader for the port-forward protocol
pub fn build_transport(
    connection: &ConnectionDescriptor,
) -> TransportResult<(RoundTripper, Upgrader)> {
    let round_tripper = RoundTripper::new(connection)?;
    debug!(host = %connection.host, "Transport built");
    Ok((round_tripper, Upgrader::new()))
}

/// Bind a transport to an upgrade URL. The upgrade request is sent as `POST`.
pub fn build_dialer(round_tripper: RoundTripper, upgrader: Upgrader, url: Url) -> Dialer {
    Dialer::new(round_tripper, upgrader, Method::POST, url)
}
