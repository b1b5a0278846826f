//! Wire types exchanged with the broker and the events surfaced to callers

use crate::common::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Successful response to a tunnel request
///
/// `GET /?new` or `GET /{subdomain}` on the broker returns this body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTunnelResponse {
    /// Assigned subdomain label
    pub id: String,
    /// Port on the broker that accepts forwarding connections
    pub port: u16,
    /// Number of forwarding connections the broker will accept
    #[serde(default)]
    pub max_conn_count: Option<usize>,
    /// Public URL of the tunnel
    pub url: String,
    /// Address to open forwarding connections to, when it differs from the broker host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Alternate URL served from the broker's cache layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_url: Option<String>,
}

/// Error body returned by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerErrorResponse {
    /// Human-readable error message
    pub message: String,
}

/// Notification emitted by a [`crate::Tunnel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// An inbound request was forwarded to the local target
    Request { method: String, path: String },
    /// A non-fatal failure; the tunnel keeps running
    Error { kind: ErrorKind, message: String },
    /// Final teardown, delivered at most once
    Close,
}

impl TunnelEvent {
    pub(crate) fn error(err: &crate::TunnelError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tunnel_response_deserialization() {
        let json = r#"{"id":"quiet-fox","port":40123,"max_conn_count":10,"url":"https://quiet-fox.localtunnel.me"}"#;
        let response: NewTunnelResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.id, "quiet-fox");
        assert_eq!(response.port, 40123);
        assert_eq!(response.max_conn_count, Some(10));
        assert!(response.ip.is_none());
        assert!(response.cached_url.is_none());
    }

    #[test]
    fn test_optional_fields() {
        let json = r#"{"id":"a","port":1,"url":"https://a.example.test","ip":"10.0.0.7","cached_url":"https://a.cache.example.test"}"#;
        let response: NewTunnelResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.max_conn_count, None);
        assert_eq!(response.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(
            response.cached_url.as_deref(),
            Some("https://a.cache.example.test")
        );
    }
}
