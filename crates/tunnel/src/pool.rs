//! Forwarding connection pool
//!
//! Each slot owns at most one broker connection at a time and walks it
//! through `Connecting → Idle → Paired → Splicing → Closed`. A closed
//! connection is dropped and the slot dials a fresh one, after a backoff
//! when the previous attempt failed. Reaching `Idle` proves the broker is
//! healthy and clears the slot's failure count; an idle connection the
//! broker later hangs up is simply replaced.

use crate::broker::RemoteSession;
use crate::common::{
    error::{Result, TunnelError},
    types::TunnelEvent,
};
use crate::config::BackoffConfig;
use crate::proxy::framing::RequestFramer;
use crate::proxy::header::{
    HostRewriter, RequestHead, RequestLine, peek_request_line, read_request_head,
};
use crate::proxy::local::LocalConnector;
use crate::proxy::splice::{SpliceStats, splice_framed};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Initial read buffer for a forwarding connection
const INITIAL_BUFFER: usize = 8 * 1024;

/// Lifecycle of one forwarding connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Connecting,
    Idle,
    Paired,
    Splicing,
    Closed,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of slots
    pub slots: usize,
    /// Slots dialing the broker
    pub connecting: usize,
    /// Connections waiting for an inbound request
    pub idle: usize,
    /// Connections paired with a local stream
    pub active: usize,
    /// Requests forwarded to completion
    pub completed: u64,
    /// Failed broker dials and failed requests
    pub failed: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    slots: AtomicUsize,
    connecting: AtomicUsize,
    idle: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    next_id: AtomicU64,
}

impl PoolCounters {
    fn gauge(&self, state: SlotState) -> Option<&AtomicUsize> {
        match state {
            SlotState::Connecting => Some(&self.connecting),
            SlotState::Idle => Some(&self.idle),
            SlotState::Paired | SlotState::Splicing => Some(&self.active),
            SlotState::Closed => None,
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            slots: self.slots.load(Ordering::Relaxed),
            connecting: self.connecting.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// One broker connection's bookkeeping; never reused once closed
#[derive(Debug)]
struct ForwardingConnection {
    id: u64,
    state: SlotState,
    counters: Arc<PoolCounters>,
}

impl ForwardingConnection {
    fn new(counters: Arc<PoolCounters>) -> Self {
        let id = counters.next_id.fetch_add(1, Ordering::Relaxed);
        counters.connecting.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            state: SlotState::Connecting,
            counters,
        }
    }

    fn transition(&mut self, next: SlotState) {
        if self.state == next || self.state == SlotState::Closed {
            return;
        }
        debug!(conn_id = self.id, from = ?self.state, to = ?next, "slot transition");
        if let Some(gauge) = self.counters.gauge(self.state) {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(gauge) = self.counters.gauge(next) {
            gauge.fetch_add(1, Ordering::Relaxed);
        }
        self.state = next;
    }
}

impl Drop for ForwardingConnection {
    fn drop(&mut self) {
        self.transition(SlotState::Closed);
    }
}

/// Settings shared by every slot
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub max_header_bytes: usize,
}

/// Why the pool stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolExit {
    /// Shutdown was requested
    Shutdown,
    /// Every slot exhausted its reconnect attempts
    Exhausted,
}

/// Why a slot stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotExit {
    Cancelled,
    GaveUp,
}

struct PoolShared {
    session: RemoteSession,
    connector: LocalConnector,
    rewriter: Option<HostRewriter>,
    settings: PoolSettings,
    events: broadcast::Sender<TunnelEvent>,
    counters: Arc<PoolCounters>,
    ready: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl PoolShared {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Read-only access to pool statistics that outlives the pool handle
#[derive(Debug, Clone)]
pub struct PoolMonitor(Arc<PoolCounters>);

impl PoolMonitor {
    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        self.0.snapshot()
    }
}

/// Handle to a running pool
pub struct ConnectionPool {
    counters: Arc<PoolCounters>,
    ready: watch::Receiver<bool>,
    task: tokio::task::JoinHandle<PoolExit>,
}

impl ConnectionPool {
    /// Start `session.max_connections` slots
    pub fn spawn(
        session: RemoteSession,
        connector: LocalConnector,
        rewriter: Option<HostRewriter>,
        settings: PoolSettings,
        events: broadcast::Sender<TunnelEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let counters = Arc::new(PoolCounters::default());
        counters
            .slots
            .store(session.max_connections, Ordering::Relaxed);
        let (ready_tx, ready_rx) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            session,
            connector,
            rewriter,
            settings,
            events,
            counters: counters.clone(),
            ready: ready_tx,
            cancel,
        });

        let task = tokio::spawn(supervise(shared));

        Self {
            counters,
            ready: ready_rx,
            task,
        }
    }

    /// Cloneable view of the pool's statistics
    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor(self.counters.clone())
    }

    /// Resolves once any slot holds an idle broker connection
    ///
    /// Fails if the pool stops before that happens.
    pub async fn first_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| {
            TunnelError::BrokerUnavailable("no forwarding connection could be established".into())
        })
    }

    /// Wait for the pool to stop
    pub async fn join(self) -> PoolExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Pool supervisor failed: {}", e);
                PoolExit::Shutdown
            }
        }
    }
}

async fn supervise(shared: Arc<PoolShared>) -> PoolExit {
    let mut slots = JoinSet::new();
    let mut next_slot = shared.session.max_connections;

    for slot in 0..shared.session.max_connections {
        slots.spawn(run_slot(shared.clone(), slot));
    }
    info!(
        "Started {} forwarding connections to {}:{}",
        shared.session.max_connections, shared.session.forward_host, shared.session.forward_port
    );

    let exit = loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break PoolExit::Shutdown,
            joined = slots.join_next() => match joined {
                None => {
                    error!("All forwarding connections gave up");
                    break PoolExit::Exhausted;
                }
                Some(Ok(exit)) => debug!(?exit, "slot finished"),
                Some(Err(e)) => {
                    // Keep the slot count stable after a panic
                    error!("Slot task failed: {}", e);
                    if !shared.cancel.is_cancelled() {
                        slots.spawn(run_slot(shared.clone(), next_slot));
                        next_slot += 1;
                    }
                }
            }
        }
    };

    // Aborting drops both ends of every in-flight splice
    slots.shutdown().await;
    debug!("Pool stopped: {:?}", exit);
    exit
}

#[instrument(name = "tunnel.slot", skip(shared))]
async fn run_slot(shared: Arc<PoolShared>, slot: usize) -> SlotExit {
    let backoff = &shared.settings.backoff;
    // Consecutive failures of any kind, drives the delay
    let mut attempt: u32 = 0;
    // Consecutive broker-side failures, drives giving up
    let mut broker_failures: u32 = 0;
    // Pause before replacing a connection that closed while idle
    let mut recycle_pause = Duration::ZERO;

    loop {
        let delay = if attempt > 0 {
            jittered(backoff.delay_for(attempt))
        } else {
            std::mem::take(&mut recycle_pause)
        };
        if !delay.is_zero() {
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                () = shared.cancel.cancelled() => return SlotExit::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
        if shared.cancel.is_cancelled() {
            return SlotExit::Cancelled;
        }

        let mut conn = ForwardingConnection::new(shared.counters.clone());
        let span = info_span!("forwarding_connection", conn_id = conn.id);

        let outcome = async {
            let mut stream = match connect_broker(&shared).await {
                Ok(stream) => stream,
                Err(e) => return Episode::BrokerFailed(e),
            };

            conn.transition(SlotState::Idle);
            attempt = 0;
            broker_failures = 0;
            shared.ready.send_replace(true);
            let idle_since = Instant::now();

            let mut buf = BytesMut::with_capacity(INITIAL_BUFFER);
            let read = tokio::select! {
                () = shared.cancel.cancelled() => return Episode::Cancelled,
                read = stream.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => return Episode::Recycled(idle_since.elapsed()),
                Err(e) => {
                    return Episode::BrokerFailed(TunnelError::BrokerUnavailable(format!(
                        "idle forwarding connection lost: {e}"
                    )));
                }
                Ok(_) => {}
            }

            conn.transition(SlotState::Paired);
            match forward_request(&shared, &mut conn, stream, buf).await {
                Ok(stats) => Episode::Completed(stats),
                Err(e) => Episode::RequestFailed(e),
            }
        }
        .instrument(span)
        .await;
        drop(conn);

        match outcome {
            Episode::Cancelled => return SlotExit::Cancelled,
            Episode::Recycled(idle) => {
                debug!("Broker closed an idle forwarding connection after {:?}", idle);
                // Don't spin against a broker that hangs up right away
                if idle < backoff.initial {
                    recycle_pause = jittered(backoff.initial);
                }
            }
            Episode::Completed(stats) => {
                debug!(
                    "Request finished: {} bytes to local, {} bytes to broker",
                    stats.to_local, stats.to_broker
                );
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                attempt = 0;
            }
            Episode::RequestFailed(e) => {
                warn!("Forwarded request failed: {}", e);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                shared.emit(TunnelEvent::error(&e));
                attempt = attempt.saturating_add(1);
            }
            Episode::BrokerFailed(e) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                attempt = attempt.saturating_add(1);
                broker_failures = broker_failures.saturating_add(1);
                if shared.cancel.is_cancelled() {
                    return SlotExit::Cancelled;
                }
                warn!(
                    "Forwarding connection failed ({}/{}): {}",
                    broker_failures, backoff.max_failures, e
                );
                shared.emit(TunnelEvent::error(&e));
                if broker_failures >= backoff.max_failures {
                    error!("Giving up on slot after {} failures", broker_failures);
                    return SlotExit::GaveUp;
                }
            }
        }
    }
}

/// Outcome of one forwarding connection
enum Episode {
    Cancelled,
    /// The broker closed the connection before sending anything
    Recycled(Duration),
    Completed(SpliceStats),
    RequestFailed(TunnelError),
    BrokerFailed(TunnelError),
}

async fn connect_broker(shared: &PoolShared) -> Result<TcpStream> {
    let host = shared.session.forward_host.as_str();
    let port = shared.session.forward_port;

    let stream = timeout(
        shared.settings.connect_timeout,
        TcpStream::connect((host, port)),
    )
    .await
    .map_err(|_| TunnelError::BrokerUnavailable(format!("connect to {host}:{port} timed out")))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::ConnectionRefused {
            TunnelError::BrokerUnavailable(format!(
                "connection refused: {host}:{port} (check your firewall settings)"
            ))
        } else {
            TunnelError::BrokerUnavailable(format!("connect to {host}:{port}: {e}"))
        }
    })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Pair an inbound request with a fresh local connection and splice them
///
/// Later requests on the same broker connection reuse the local
/// connection and are framed, rewritten and announced as they arrive.
async fn forward_request(
    shared: &PoolShared,
    conn: &mut ForwardingConnection,
    mut stream: TcpStream,
    mut buf: BytesMut,
) -> Result<SpliceStats> {
    let max_header_bytes = shared.settings.max_header_bytes;
    let head = match read_request_head(
        shared.rewriter.as_ref(),
        &mut stream,
        &mut buf,
        max_header_bytes,
    )
    .await
    {
        Ok(head) => head,
        Err(e @ TunnelError::HeaderTooLarge { .. }) => {
            write_error_response(&mut stream, "431 Request Header Fields Too Large", &e).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let (prefix, request, framer) = match head {
        Some(RequestHead {
            head,
            request,
            body,
        }) => {
            let framer = RequestFramer::new(shared.rewriter.clone(), max_header_bytes, body, buf);
            (head, Some(request), framer)
        }
        None => {
            let request = peek_request_line(&buf);
            (Bytes::new(), request, RequestFramer::opaque(buf))
        }
    };

    if let Some(request) = &request {
        announce(shared, request);
    }

    let local = match shared.connector.connect().await {
        Ok(local) => local,
        Err(e) => {
            if request.is_some() {
                write_error_response(&mut stream, "502 Bad Gateway", &e).await;
            }
            return Err(e);
        }
    };

    conn.transition(SlotState::Splicing);
    splice_framed(stream, local, &prefix, framer, |request| {
        announce(shared, &request);
    })
    .await
    .map_err(splice_error)
}

fn announce(shared: &PoolShared, RequestLine { method, path }: &RequestLine) {
    info!("{} {}", method, path);
    shared.emit(TunnelEvent::Request {
        method: method.clone(),
        path: path.clone(),
    });
}

/// Recover a framing error carried out of the splice
fn splice_error(e: std::io::Error) -> TunnelError {
    match e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<TunnelError>())
    {
        Some(TunnelError::HeaderTooLarge { limit }) => {
            TunnelError::HeaderTooLarge { limit: *limit }
        }
        _ => e.into(),
    }
}

/// Answer the public client directly when the request cannot be forwarded
async fn write_error_response<W>(writer: &mut W, status: &str, error: &TunnelError)
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{error}\n");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        debug!("Failed to write error response: {}", e);
    }
    writer.shutdown().await.ok();
}

/// Add up to 25% random jitter to a delay
fn jittered(delay: Duration) -> Duration {
    let max_jitter = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_gauges() {
        let counters = Arc::new(PoolCounters::default());

        let mut conn = ForwardingConnection::new(counters.clone());
        assert_eq!(counters.snapshot().connecting, 1);

        conn.transition(SlotState::Idle);
        let stats = counters.snapshot();
        assert_eq!((stats.connecting, stats.idle), (0, 1));

        conn.transition(SlotState::Paired);
        conn.transition(SlotState::Splicing);
        let stats = counters.snapshot();
        assert_eq!((stats.idle, stats.active), (0, 1));

        drop(conn);
        assert_eq!(counters.snapshot(), PoolStats::default());
    }

    #[test]
    fn test_connection_ids_are_not_reused() {
        let counters = Arc::new(PoolCounters::default());
        let first = ForwardingConnection::new(counters.clone());
        let first_id = first.id;
        drop(first);
        let second = ForwardingConnection::new(counters);
        assert_ne!(first_id, second.id);
    }

    #[test]
    fn test_closed_is_terminal() {
        let counters = Arc::new(PoolCounters::default());
        let mut conn = ForwardingConnection::new(counters.clone());
        conn.transition(SlotState::Closed);
        conn.transition(SlotState::Idle);
        assert_eq!(conn.state, SlotState::Closed);
        assert_eq!(counters.snapshot().idle, 0);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_framing_error_survives_splice() {
        let framing = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            TunnelError::HeaderTooLarge { limit: 64 },
        );
        assert!(matches!(
            splice_error(framing),
            TunnelError::HeaderTooLarge { limit: 64 }
        ));
        assert!(matches!(
            splice_error(std::io::Error::other("reset")),
            TunnelError::Io(_)
        ));
    }

    #[tokio::test]
    async fn test_error_response_format() {
        let mut out = Vec::new();
        let err = TunnelError::LocalConnect {
            target: "localhost:1".into(),
            reason: "refused".into(),
        };
        write_error_response(&mut out, "502 Bad Gateway", &err).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("refused\n"));
    }
}
