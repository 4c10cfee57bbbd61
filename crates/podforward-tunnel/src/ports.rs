//! Port-pair specifications

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::error::SessionError;

/// A local port forwarded to a remote port.
///
/// A local port of `0` asks the OS for a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl FromStr for PortPair {
    type Err = SessionError;

    /// Accepts `8080`, `9090:8080` and `:8080`
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SessionError::InvalidPort {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let number = |value: &str| {
            value
                .parse::<u16>()
                .map_err(|e| invalid(&format!("'{}' is not a valid port: {}", value, e)))
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let pair = match parts.as_slice() {
            [""] => return Err(invalid("empty port specification")),
            [port] => {
                let port = number(*port)?;
                PortPair::new(port, port)
            }
            ["", remote] => PortPair::new(0, number(*remote)?),
            [local, remote] => PortPair::new(number(*local)?, number(*remote)?),
            _ => return Err(invalid("expected LOCAL:REMOTE")),
        };

        if pair.remote == 0 {
            return Err(invalid("remote port must be > 0"));
        }
        Ok(pair)
    }
}

/// Parse a list of port specifications
pub fn parse_ports<S: AsRef<str>>(specs: &[S]) -> Result<Vec<PortPair>, SessionError> {
    if specs.is_empty() {
        return Err(SessionError::NoPorts);
    }
    specs.iter().map(|spec| spec.as_ref().parse()).collect()
}

/// Local ports a session actually bound, published once before it becomes ready
#[derive(Debug, Clone, Default)]
pub struct ForwardedPorts {
    inner: Arc<OnceLock<Vec<PortPair>>>,
}

impl ForwardedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the bound ports. Only the first call takes effect.
    pub fn publish(&self, ports: Vec<PortPair>) -> bool {
        self.inner.set(ports).is_ok()
    }

    pub fn get(&self) -> Option<&[PortPair]> {
        self.inner.get().map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_forms() {
        assert_eq!("8080".parse::<PortPair>().unwrap(), PortPair::new(8080, 8080));
        assert_eq!(
            "9090:8080".parse::<PortPair>().unwrap(),
            PortPair::new(9090, 8080)
        );
        assert_eq!(":8080".parse::<PortPair>().unwrap(), PortPair::new(0, 8080));
        assert_eq!("0:8080".parse::<PortPair>().unwrap(), PortPair::new(0, 8080));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        for spec in ["", "abc", "80:http", "9090:0", "0", ":", "1:2:3", "70000:80", "-1:80"] {
            assert!(
                matches!(
                    spec.parse::<PortPair>(),
                    Err(SessionError::InvalidPort { .. })
                ),
                "expected {:?} to be rejected",
                spec
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(PortPair::new(9090, 8080).to_string(), "9090:8080");
    }

    #[test]
    fn test_parse_ports() {
        assert!(matches!(
            parse_ports::<&str>(&[]),
            Err(SessionError::NoPorts)
        ));
        assert_eq!(
            parse_ports(&["5432", ":6379"]).unwrap(),
            vec![PortPair::new(5432, 5432), PortPair::new(0, 6379)]
        );
        assert!(parse_ports(&["5432", "bad"]).is_err());
    }

    #[test]
    fn test_forwarded_ports_publish_once() {
        let ports = ForwardedPorts::new();
        assert!(ports.get().is_none());

        let shared = ports.clone();
        assert!(shared.publish(vec![PortPair::new(40000, 8080)]));
        assert!(!shared.publish(vec![]));
        assert_eq!(ports.get(), Some(&[PortPair::new(40000, 8080)][..]));
    }
}
