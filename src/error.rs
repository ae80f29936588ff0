use std::io;
use thiserror::Error;

/// Unified error type for the intercepting proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Listen address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream server could not be reached
    #[error("Upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the client or the upstream failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Read or write failure while relaying
    #[error("Stream IO error: {0}")]
    StreamIo(io::Error),

    /// Malformed rule pattern
    #[error("Invalid rule pattern '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    /// Malformed `[host:]port` descriptor
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error (certificates, keys, client config)
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error must abort startup rather than a single session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Bind { .. }
                | ProxyError::InvalidRule { .. }
                | ProxyError::InvalidEndpoint(_)
                | ProxyError::Config(_)
                | ProxyError::Tls(_)
        )
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ProxyError::Bind {
            addr: "0.0.0.0:80".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let display = format!("{}", err);
        assert!(display.contains("Failed to bind 0.0.0.0:80"));
        assert!(display.contains("address in use"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_upstream_unreachable_is_per_session() {
        let err = ProxyError::UpstreamUnreachable {
            addr: "example.com:443".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(format!("{}", err).contains("example.com:443"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_handshake_error_display() {
        let err = ProxyError::Handshake("bad record mac".to_string());
        assert_eq!(format!("{}", err), "TLS handshake failed: bad record mac");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_invalid_rule_display() {
        let err = ProxyError::InvalidRule {
            pattern: "/(/".to_string(),
            reason: "unclosed group".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("/(/"));
        assert!(display.contains("unclosed group"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
        assert!(format!("{}", err).contains("file not found"));
    }

    #[test]
    fn test_result_type_alias() {
        fn test_fn() -> Result<u16> {
            Err(ProxyError::InvalidEndpoint("nope".to_string()))
        }
        assert!(test_fn().is_err());
    }
}
