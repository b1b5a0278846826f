//! Control exchange with the tunnel broker

use crate::common::{
    error::{Result, TunnelError},
    types::{BrokerErrorResponse, NewTunnelResponse},
};
use crate::config::{TunnelConfig, is_valid_dns_label};
use reqwest::{Client, ClientBuilder, StatusCode};
use tracing::{debug, info};
use url::Url;

/// A negotiated tunnel identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    /// Subdomain label assigned by the broker
    pub assigned_subdomain: String,
    /// Public base URL, e.g. `https://quiet-fox.localtunnel.me`
    pub public_url: String,
    /// Alternate public URL, if the broker offers one
    pub cached_url: Option<String>,
    /// Host accepting forwarding connections
    pub forward_host: String,
    /// Port accepting forwarding connections
    pub forward_port: u16,
    /// Number of forwarding connections to keep open
    pub max_connections: usize,
}

/// Client for the broker's control endpoint
#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: String,
    broker_host: String,
    subdomain: Option<String>,
    max_connections: Option<usize>,
}

impl BrokerClient {
    /// Create a new broker client
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .user_agent(concat!("gate-tunnel/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.timeouts.connect)
            .timeout(config.timeouts.negotiate)
            .build()
            .map_err(|e| TunnelError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.broker_base_url(),
            broker_host: config.broker_host.clone(),
            subdomain: config.subdomain.clone(),
            max_connections: config.max_connections,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL requested for a new tunnel
    fn request_url(&self) -> String {
        match &self.subdomain {
            Some(subdomain) => format!("{}/{}", self.base_url, subdomain.to_ascii_lowercase()),
            None => format!("{}/?new", self.base_url),
        }
    }

    /// Ask the broker for a new tunnel
    pub async fn negotiate(&self) -> Result<RemoteSession> {
        let url = self.request_url();
        info!("Requesting tunnel from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        debug!("Broker responded with status {}", status);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error_from_status(status, &body));
        }

        let body = response.bytes().await?;
        let parsed: NewTunnelResponse = serde_json::from_slice(&body)
            .map_err(|e| TunnelError::Protocol(format!("Failed to parse broker response: {e}")))?;

        self.session_from_response(parsed)
    }

    fn error_from_status(&self, status: StatusCode, body: &str) -> TunnelError {
        let message = serde_json::from_str::<BrokerErrorResponse>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| body.trim().to_string());

        match status.as_u16() {
            409 => TunnelError::SubdomainConflict {
                requested: self.subdomain.clone().unwrap_or_default(),
                offered: None,
            },
            500..=599 => TunnelError::BrokerUnavailable(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                message
            )),
            _ => TunnelError::Protocol(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                message
            )),
        }
    }

    fn session_from_response(&self, response: NewTunnelResponse) -> Result<RemoteSession> {
        if !is_valid_dns_label(&response.id) {
            return Err(TunnelError::Protocol(format!(
                "Broker assigned an invalid subdomain: {:?}",
                response.id
            )));
        }

        if let Some(requested) = &self.subdomain
            && !requested.eq_ignore_ascii_case(&response.id)
        {
            return Err(TunnelError::SubdomainConflict {
                requested: requested.clone(),
                offered: Some(response.id),
            });
        }

        if response.port == 0 {
            return Err(TunnelError::Protocol(
                "Broker returned forwarding port 0".to_string(),
            ));
        }

        let public_url = Url::parse(&response.url)
            .map_err(|e| TunnelError::Protocol(format!("Invalid tunnel url {}: {e}", response.url)))?;
        if public_url.host_str().is_none() {
            return Err(TunnelError::Protocol(format!(
                "Tunnel url has no host: {}",
                response.url
            )));
        }

        let offered = response.max_conn_count.unwrap_or(1).max(1);
        let max_connections = self.max_connections.map_or(offered, |cap| offered.min(cap));

        let session = RemoteSession {
            assigned_subdomain: response.id,
            public_url: response.url.trim_end_matches('/').to_string(),
            cached_url: response.cached_url,
            forward_host: response
                .ip
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| self.broker_host.clone()),
            forward_port: response.port,
            max_connections,
        };

        info!(
            "Tunnel {} assigned, forwarding to {}:{} with {} connections",
            session.public_url, session.forward_host, session.forward_port, session.max_connections
        );

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(subdomain: Option<&str>, cap: Option<usize>) -> BrokerClient {
        let mut config = TunnelConfig::new(3000).with_broker("broker.test", 443, true);
        config.subdomain = subdomain.map(str::to_string);
        config.max_connections = cap;
        BrokerClient::new(&config).unwrap()
    }

    fn response(id: &str) -> NewTunnelResponse {
        NewTunnelResponse {
            id: id.to_string(),
            port: 41000,
            max_conn_count: Some(10),
            url: format!("https://{id}.broker.test"),
            ip: None,
            cached_url: None,
        }
    }

    #[test]
    fn test_request_url() {
        assert_eq!(client(None, None).request_url(), "https://broker.test/?new");
        assert_eq!(
            client(Some("MyApp"), None).request_url(),
            "https://broker.test/myapp"
        );
    }

    #[test]
    fn test_session_from_response() {
        let session = client(None, None)
            .session_from_response(response("quiet-fox"))
            .unwrap();
        assert_eq!(session.assigned_subdomain, "quiet-fox");
        assert_eq!(session.public_url, "https://quiet-fox.broker.test");
        assert_eq!(session.forward_host, "broker.test");
        assert_eq!(session.forward_port, 41000);
        assert_eq!(session.max_connections, 10);
    }

    #[test]
    fn test_connection_cap_and_ip() {
        let mut resp = response("abc");
        resp.ip = Some("10.1.2.3".to_string());
        let session = client(None, Some(2)).session_from_response(resp).unwrap();
        assert_eq!(session.max_connections, 2);
        assert_eq!(session.forward_host, "10.1.2.3");

        let mut resp = response("abc");
        resp.max_conn_count = None;
        let session = client(None, None).session_from_response(resp).unwrap();
        assert_eq!(session.max_connections, 1);
    }

    #[test]
    fn test_reassigned_subdomain_is_conflict() {
        let err = client(Some("wanted"), None)
            .session_from_response(response("other"))
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::SubdomainConflict { ref requested, offered: Some(ref offered) }
                if requested == "wanted" && offered == "other"
        ));
    }

    #[test]
    fn test_malformed_responses() {
        let broker = client(None, None);

        let mut resp = response("abc");
        resp.port = 0;
        assert!(matches!(
            broker.session_from_response(resp),
            Err(TunnelError::Protocol(_))
        ));

        let mut resp = response("abc");
        resp.url = "not a url".to_string();
        assert!(matches!(
            broker.session_from_response(resp),
            Err(TunnelError::Protocol(_))
        ));

        assert!(matches!(
            broker.session_from_response(response("bad_label")),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[test]
    fn test_error_from_status() {
        let broker = client(Some("taken"), None);
        assert!(matches!(
            broker.error_from_status(StatusCode::CONFLICT, ""),
            TunnelError::SubdomainConflict { .. }
        ));
        assert!(matches!(
            broker.error_from_status(StatusCode::BAD_GATEWAY, "down"),
            TunnelError::BrokerUnavailable(_)
        ));
        let err = broker.error_from_status(StatusCode::FORBIDDEN, r#"{"message":"nope"}"#);
        assert!(matches!(err, TunnelError::Protocol(ref m) if m.contains("nope")));
    }
}
