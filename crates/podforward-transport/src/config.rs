//! Connection descriptor for the Kubernetes API server

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TransportError, TransportResult};

/// TLS material used to reach the API server
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsMaterial {
    /// PEM-encoded CA bundle. Falls back to the webpki roots when empty.
    pub ca_data: Option<String>,
    /// PEM-encoded client certificate chain
    pub client_certificate_data: Option<String>,
    /// PEM-encoded client private key
    pub client_key_data: Option<String>,
    /// Override for the name used for SNI and certificate verification
    pub server_name: Option<String>,
    /// Skip server certificate verification (INSECURE)
    pub insecure_skip_tls_verify: bool,
}

impl TlsMaterial {
    pub fn has_client_identity(&self) -> bool {
        self.client_certificate_data.is_some() && self.client_key_data.is_some()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_data", &self.ca_data.as_ref().map(|_| "<pem>"))
            .field(
                "client_certificate_data",
                &self.client_certificate_data.as_ref().map(|_| "<pem>"),
            )
            .field(
                "client_key_data",
                &self.client_key_data.as_ref().map(|_| "<redacted>"),
            )
            .field("server_name", &self.server_name)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

/// Everything needed to authenticate and upgrade a connection to the API server
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    /// Base address of the API server, e.g. `https://cluster.example:6443`
    pub host: String,
    /// Bearer token sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub tls: TlsMaterial,
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "<redacted>"),
            )
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            host: String::new(),
            bearer_token: None,
            tls: TlsMaterial::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> ConnectionDescriptorBuilder {
        ConnectionDescriptorBuilder::default()
    }

    /// Check the descriptor is usable before building a transport from it
    pub fn validate(&self) -> TransportResult<()> {
        if self.host.trim().is_empty() {
            return Err(TransportError::ConfigurationError(
                "host is required".to_string(),
            ));
        }
        if self.tls.client_certificate_data.is_some() != self.tls.client_key_data.is_some() {
            return Err(TransportError::ConfigurationError(
                "client certificate and client key must be supplied together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ConnectionDescriptor
#[derive(Default)]
pub struct ConnectionDescriptorBuilder {
    descriptor: ConnectionDescriptor,
}

impl ConnectionDescriptorBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.descriptor.host = host.into();
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.descriptor.bearer_token = Some(token.into());
        self
    }

    pub fn ca_data(mut self, pem: impl Into<String>) -> Self {
        self.descriptor.tls.ca_data = Some(pem.into());
        self
    }

    pub fn client_identity(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.descriptor.tls.client_certificate_data = Some(cert_pem.into());
        self.descriptor.tls.client_key_data = Some(key_pem.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.tls.server_name = Some(name.into());
        self
    }

    pub fn insecure_skip_tls_verify(mut self, skip: bool) -> Self {
        self.descriptor.tls.insecure_skip_tls_verify = skip;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> TransportResult<ConnectionDescriptor> {
        self.descriptor.validate()?;
        Ok(self.descriptor)
    }
}
