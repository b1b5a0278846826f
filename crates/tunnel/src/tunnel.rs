//! Tunnel handle and lifecycle

use crate::broker::{BrokerClient, RemoteSession};
use crate::common::{
    error::{Result, TunnelError},
    types::{TunnelEvent, TunnelState},
};
use crate::config::TunnelConfig;
use crate::pool::{ConnectionPool, PoolExit, PoolMonitor, PoolSettings, PoolStats};
use crate::proxy::{HostRewriter, LocalConnector};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the notification channel; slow subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Open a tunnel for `config`
///
/// Returns once the broker assigned a public URL and at least one
/// forwarding connection is established.
pub async fn open_tunnel(config: TunnelConfig) -> Result<Tunnel> {
    Tunnel::open(config).await
}

/// Handle to an open tunnel
///
/// Clones share the same tunnel. The tunnel closes when [`Tunnel::close`] is
/// called, when every forwarding connection gives up, or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    session: RemoteSession,
    events: broadcast::Sender<TunnelEvent>,
    state: Arc<watch::Sender<TunnelState>>,
    pool: PoolMonitor,
    cancel: CancellationToken,
}

impl Drop for TunnelInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("url", &self.inner.session.public_url)
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    /// Open a tunnel for `config`
    pub async fn open(config: TunnelConfig) -> Result<Self> {
        Self::open_with_shutdown(config, CancellationToken::new()).await
    }

    /// Open a tunnel that also closes when `shutdown` is cancelled
    ///
    /// Cancelling `shutdown` while the tunnel is still opening aborts the
    /// attempt with [`TunnelError::Closed`].
    pub async fn open_with_shutdown(
        config: TunnelConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        // Build TLS material before talking to the broker so bad PEM input fails fast
        let connector = LocalConnector::new(&config)?;
        let broker = BrokerClient::new(&config)?;
        let cancel = shutdown.child_token();

        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TunnelError::Closed),
            session = broker.negotiate() => session?,
        };

        let rewriter = config
            .local_host
            .as_ref()
            .map(|host| HostRewriter::new(host.clone(), config.local_port));
        let settings = PoolSettings {
            backoff: config.backoff.clone(),
            connect_timeout: config.timeouts.connect,
            max_header_bytes: config.max_header_bytes,
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(TunnelState::Opening);
        let state = Arc::new(state);

        let pool = ConnectionPool::spawn(
            session.clone(),
            connector,
            rewriter,
            settings,
            events.clone(),
            cancel.clone(),
        );

        let establish = config.timeouts.establish;
        let ready = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TunnelError::Closed),
            ready = timeout(establish, pool.first_ready()) => ready.unwrap_or_else(|_| {
                Err(TunnelError::BrokerUnavailable(format!(
                    "no forwarding connection established within {establish:?}"
                )))
            }),
        };

        if let Err(e) = ready {
            warn!("Failed to open tunnel {}: {}", session.public_url, e);
            cancel.cancel();
            pool.join().await;
            return Err(e);
        }

        state.send_replace(TunnelState::Open);
        info!("Tunnel open at {}", session.public_url);

        let inner = Arc::new(TunnelInner {
            session,
            events: events.clone(),
            state: state.clone(),
            pool: pool.monitor(),
            cancel,
        });

        tokio::spawn(run_lifecycle(
            pool,
            state,
            events,
            inner.session.public_url.clone(),
        ));

        Ok(Self { inner })
    }

    /// Public URL of the tunnel
    pub fn url(&self) -> &str {
        &self.inner.session.public_url
    }

    /// Alternate public URL, if the broker offered one
    pub fn cached_url(&self) -> Option<&str> {
        self.inner.session.cached_url.as_deref()
    }

    /// The negotiated session
    pub fn session(&self) -> &RemoteSession {
        &self.inner.session
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    /// Forwarding connection statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Receive notifications emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Start closing the tunnel
    ///
    /// Idempotent; returns immediately. Use [`Tunnel::closed`] to wait for
    /// the teardown to finish.
    pub fn close(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == TunnelState::Open {
                *state = TunnelState::Closing;
                true
            } else {
                false
            }
        });
        if started {
            info!("Closing tunnel {}", self.url());
        }
        self.inner.cancel.cancel();
    }

    /// Wait until the tunnel is closed and every connection is released
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns once closed
        let _ = state.wait_for(|state| *state == TunnelState::Closed).await;
    }

    /// Close the tunnel and wait for the teardown to finish
    pub async fn shutdown(&self) {
        self.close();
        self.closed().await;
    }
}

/// Waits for the pool to stop, then reports the close exactly once
async fn run_lifecycle(
    pool: ConnectionPool,
    state: Arc<watch::Sender<TunnelState>>,
    events: broadcast::Sender<TunnelEvent>,
    url: String,
) {
    let exit = pool.join().await;

    if exit == PoolExit::Exhausted {
        let err = TunnelError::BrokerUnavailable(
            "the broker rejected every forwarding connection".to_string(),
        );
        error!("Tunnel {} failed: {}", url, err);
        let _ = events.send(TunnelEvent::error(&err));
    }

    let _ = events.send(TunnelEvent::Close);
    state.send_replace(TunnelState::Closed);
    info!("Tunnel {} closed", url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = open_tunnel(TunnelConfig::new(0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_cancelled_before_open() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // Unroutable broker; cancellation wins before any network timeout
        let config = TunnelConfig::new(3000).with_broker("10.255.255.1", 81, false);
        let err = Tunnel::open_with_shutdown(config, shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
