//! Error types for the tunnel client

use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Coarse classification of a [`TunnelError`], carried by error notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The broker could not be reached or refused every forwarding connection
    BrokerUnavailable,
    /// The requested subdomain is held by another client
    SubdomainConflict,
    /// The broker answered with something we do not understand
    ProtocolViolation,
    /// The local target could not be reached
    LocalConnectFailure,
    /// An inbound request header block exceeded the lookahead window
    HeaderTooLarge,
    /// TLS negotiation with the local target failed
    TlsHandshakeFailure,
    /// The supplied configuration is invalid
    InvalidConfig,
    /// Socket level failure while forwarding
    Io,
    /// The tunnel was closed before it finished opening
    Closed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BrokerUnavailable => "broker_unavailable",
            Self::SubdomainConflict => "subdomain_conflict",
            Self::ProtocolViolation => "protocol_violation",
            Self::LocalConnectFailure => "local_connect_failure",
            Self::HeaderTooLarge => "header_too_large",
            Self::TlsHandshakeFailure => "tls_handshake_failure",
            Self::InvalidConfig => "invalid_config",
            Self::Io => "io",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while opening or running a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Broker unreachable (network, DNS, timeout or server-side failure)
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Requested subdomain already taken
    #[error("Subdomain conflict: requested {requested}, broker offered {offered:?}")]
    SubdomainConflict {
        requested: String,
        offered: Option<String>,
    },

    /// Malformed broker response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local target refused or timed out
    #[error("Failed to connect to local target {target}: {reason}")]
    LocalConnect { target: String, reason: String },

    /// Request header block larger than the lookahead window
    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// TLS/SSL error toward the local target
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Opening was cancelled
    #[error("Tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Classify this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            Self::SubdomainConflict { .. } => ErrorKind::SubdomainConflict,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::ProtocolViolation,
            Self::LocalConnect { .. } => ErrorKind::LocalConnectFailure,
            Self::HeaderTooLarge { .. } => ErrorKind::HeaderTooLarge,
            Self::Tls(_) => ErrorKind::TlsHandshakeFailure,
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::Io(_) => ErrorKind::Io,
            Self::Closed => ErrorKind::Closed,
        }
    }
}

impl From<config::ConfigError> for TunnelError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(format!("Failed to parse broker response: {e}"))
        } else {
            Self::BrokerUnavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TunnelError::BrokerUnavailable("dns".into()).kind(),
            ErrorKind::BrokerUnavailable
        );
        assert_eq!(
            TunnelError::HeaderTooLarge { limit: 10 }.kind(),
            ErrorKind::HeaderTooLarge
        );

        let err: TunnelError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        let err: TunnelError = std::io::Error::other("reset").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(
            ErrorKind::SubdomainConflict.to_string(),
            "subdomain_conflict"
        );
        assert_eq!(ErrorKind::Closed.to_string(), "closed");
    }
}
