//! Tunnel configuration

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker used when none is configured
pub const DEFAULT_BROKER_HOST: &str = "localtunnel.me";

/// Host used for the local target when no override is configured
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// Configuration for a single tunnel
///
/// Immutable once handed to [`crate::open_tunnel`]. PEM material is never
/// read from config files; callers load it and attach it with the `with_*`
/// setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Port of the local service
    pub local_port: u16,
    /// Host override for both the local connection and the forwarded `Host` header
    #[serde(default)]
    pub local_host: Option<String>,
    /// Requested public subdomain
    #[serde(default)]
    pub subdomain: Option<String>,
    /// Connect to the local service over TLS
    #[serde(default)]
    pub local_https: bool,
    /// PEM client certificate presented to the local service
    #[serde(skip)]
    pub local_cert: Option<Vec<u8>>,
    /// PEM private key matching `local_cert`
    #[serde(skip)]
    pub local_key: Option<Vec<u8>>,
    /// PEM CA bundle used instead of the webpki roots
    #[serde(skip)]
    pub local_ca: Option<Vec<u8>>,
    /// Skip certificate validation toward the local service
    #[serde(default)]
    pub allow_invalid_cert: bool,
    /// Broker hostname
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    /// Broker control port
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Use https for the control exchange
    #[serde(default = "default_true")]
    pub broker_tls: bool,
    /// Upper bound on forwarding connections, applied to the broker's offer
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Lookahead window for the request header block
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Timeouts for network operations
    #[serde(default)]
    pub timeouts: TunnelTimeouts,
    /// Reconnect backoff for forwarding connections
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Timeout configuration for tunnel operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelTimeouts {
    /// Control exchange with the broker
    #[serde(default = "default_negotiate_timeout")]
    pub negotiate: Duration,

    /// TCP connect and TLS handshake, broker and local side
    #[serde(default = "default_connect_timeout")]
    pub connect: Duration,

    /// Time allowed for the first forwarding connection to come up
    #[serde(default = "default_establish_timeout")]
    pub establish: Duration,
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self {
            negotiate: default_negotiate_timeout(),
            connect: default_connect_timeout(),
            establish: default_establish_timeout(),
        }
    }
}

impl TunnelTimeouts {
    /// Create timeout configuration suitable for testing
    pub fn for_testing() -> Self {
        Self {
            negotiate: Duration::from_secs(5),
            connect: Duration::from_secs(2),
            establish: Duration::from_secs(5),
        }
    }
}

/// Reconnect policy for a forwarding slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(default = "default_backoff_initial")]
    pub initial: Duration,
    /// Ceiling for the delay
    #[serde(default = "default_backoff_max")]
    pub max: Duration,
    /// Consecutive broker-side failures after which a slot gives up
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_backoff_initial(),
            max: default_backoff_max(),
            max_failures: default_max_failures(),
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            max_failures: 5,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

fn default_broker_host() -> String {
    DEFAULT_BROKER_HOST.to_string()
}

const fn default_broker_port() -> u16 {
    443
}

const fn default_true() -> bool {
    true
}

const fn default_max_header_bytes() -> usize {
    16 * 1024
}

const fn default_negotiate_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_establish_timeout() -> Duration {
    Duration::from_secs(15)
}

const fn default_backoff_initial() -> Duration {
    Duration::from_millis(250)
}

const fn default_backoff_max() -> Duration {
    Duration::from_secs(8)
}

const fn default_max_failures() -> u32 {
    20
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            local_host: None,
            subdomain: None,
            local_https: false,
            local_cert: None,
            local_key: None,
            local_ca: None,
            allow_invalid_cert: false,
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            broker_tls: true,
            max_connections: None,
            max_header_bytes: default_max_header_bytes(),
            timeouts: TunnelTimeouts::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Configuration for a local service on `local_port` using the default broker
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            ..Self::default()
        }
    }

    /// Override the local host and the forwarded `Host` header
    #[must_use]
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    /// Request a specific subdomain
    #[must_use]
    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    /// Point at a different broker
    #[must_use]
    pub fn with_broker(mut self, host: impl Into<String>, port: u16, tls: bool) -> Self {
        self.broker_host = host.into();
        self.broker_port = port;
        self.broker_tls = tls;
        self
    }

    /// Connect to the local service over TLS
    #[must_use]
    pub const fn with_local_https(mut self, enabled: bool) -> Self {
        self.local_https = enabled;
        self
    }

    /// Client certificate and key presented to the local service
    #[must_use]
    pub fn with_local_identity(mut self, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        self.local_cert = Some(cert_pem);
        self.local_key = Some(key_pem);
        self
    }

    /// Trust this CA bundle for the local service
    #[must_use]
    pub fn with_local_ca(mut self, ca_pem: Vec<u8>) -> Self {
        self.local_ca = Some(ca_pem);
        self
    }

    /// Skip certificate validation toward the local service
    #[must_use]
    pub const fn with_allow_invalid_cert(mut self, allow: bool) -> Self {
        self.allow_invalid_cert = allow;
        self
    }

    /// Cap the number of forwarding connections
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Replace all timeouts
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: TunnelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the reconnect policy
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Base URL of the broker's control endpoint
    pub fn broker_base_url(&self) -> String {
        let (scheme, default_port) = if self.broker_tls {
            ("https", 443)
        } else {
            ("http", 80)
        };
        if self.broker_port == default_port {
            format!("{scheme}://{}", self.broker_host)
        } else {
            format!("{scheme}://{}:{}", self.broker_host, self.broker_port)
        }
    }

    /// Host and port the local connector dials
    pub fn local_target(&self) -> (&str, u16) {
        (
            self.local_host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST),
            self.local_port,
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validators::validate_port(self.local_port, "local_port")?;
        validators::validate_port(self.broker_port, "broker_port")?;
        validators::validate_not_empty(&self.broker_host, "broker_host")?;

        if let Some(host) = &self.local_host {
            validators::validate_not_empty(host, "local_host")?;
        }

        if let Some(subdomain) = &self.subdomain
            && !is_valid_dns_label(subdomain)
        {
            return Err(ConfigError::Message(format!(
                "subdomain: '{subdomain}' is not a valid DNS label"
            )));
        }

        if self.local_key.is_some() != self.local_cert.is_some() {
            return Err(ConfigError::Message(
                "local_cert and local_key must be supplied together".to_string(),
            ));
        }

        if let Some(max) = self.max_connections {
            validators::validate_range(max, 1, 1024, "max_connections")?;
        }

        validators::validate_range(
            self.max_header_bytes,
            1024,
            1024 * 1024,
            "max_header_bytes",
        )?;

        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::Message(
                "backoff.initial must not exceed backoff.max".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Start with defaults
        builder = builder.add_source(Config::try_from(&Self::default())?);

        // Add the specific config file
        builder = builder.add_source(File::with_name(path));

        // Add environment variables with TUNNEL_ prefix (can override file settings)
        builder = builder.add_source(
            Environment::with_prefix("TUNNEL")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// Check whether `label` is usable as a single DNS label
pub fn is_valid_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Common validation helpers
mod validators {
    use config::ConfigError;

    /// Validate that a port number is valid (1-65535)
    pub fn validate_port(port: u16, field: &str) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::Message(format!(
                "{field}: port must be between 1 and 65535"
            )));
        }
        Ok(())
    }

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate that a value is within range
    pub fn validate_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::Message(format!(
                "{field}: must be between {min} and {max}"
            )));
        }
        Ok(())
    }
}
