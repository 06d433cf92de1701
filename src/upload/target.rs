//! `host:port` server descriptor parsing.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::UploadError;

/// Host/port pair a run uploads to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
}

impl ServerTarget {
    /// Parse a `host:port` descriptor. Splits at the last colon so bracketed
    /// IPv6 literals (`[::1]:9000`) are accepted.
    pub fn parse(input: &str) -> Result<Self, UploadError> {
        let invalid = |reason: &str| UploadError::InvalidServer {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let input_trimmed = input.trim();
        let (host, port) = input_trimmed
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing ':' separator"))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if host.contains(':') && !input_trimmed.starts_with('[') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| invalid("port must be a number between 0 and 65535"))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl FromStr for ServerTarget {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let t = ServerTarget::parse("example.test:9000").unwrap();
        assert_eq!(t.host, "example.test");
        assert_eq!(t.port, 9000);
        assert_eq!(t.to_string(), "example.test:9000");
    }

    #[test]
    fn test_parse_ipv6() {
        let t: ServerTarget = "[::1]:8080".parse().unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.port, 8080);
        assert_eq!(t.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_missing_separator() {
        let err = ServerTarget::parse("noport").unwrap_err();
        assert!(matches!(err, UploadError::InvalidServer { .. }));
        assert!(err.to_string().contains("noport"));
    }

    #[test]
    fn test_bad_port_and_host() {
        assert!(ServerTarget::parse("host:").is_err());
        assert!(ServerTarget::parse("host:http").is_err());
        assert!(ServerTarget::parse("host:70000").is_err());
        assert!(ServerTarget::parse(":9000").is_err());
        assert!(ServerTarget::parse("::1:9000").is_err());
    }
}
