//! Run a tunnel until Ctrl-C or until it closes on its own

use anyhow::{Context, Result, bail};
use gate_tunnel::{CancellationToken, ErrorKind, Tunnel, TunnelConfig, TunnelEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub async fn run(config: TunnelConfig, print_requests: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                shutdown.cancel();
            }
        }
    });

    let tunnel = match Tunnel::open_with_shutdown(config, shutdown.clone()).await {
        Ok(tunnel) => tunnel,
        Err(e) if e.kind() == ErrorKind::Closed => return Ok(()),
        Err(e) => return Err(e).context("failed to open tunnel"),
    };
    let mut events = tunnel.subscribe();

    println!("your url is: {}", tunnel.url());
    if let Some(cached_url) = tunnel.cached_url() {
        println!("your cached url is: {cached_url}");
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            // Covers a close that happened before we subscribed
            () = tunnel.closed() => break,
        };
        match event {
            Ok(TunnelEvent::Request { method, path }) => {
                if print_requests {
                    println!(
                        "{} {method} {path}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(TunnelEvent::Error { kind, message }) => {
                debug!(%kind, "Tunnel reported: {}", message);
            }
            Ok(TunnelEvent::Close) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(missed)) => warn!("Missed {} tunnel events", missed),
        }
    }

    tunnel.shutdown().await;
    let stats = tunnel.stats();
    info!(
        "Forwarded {} requests ({} failures)",
        stats.completed, stats.failed
    );

    if !shutdown.is_cancelled() {
        bail!("tunnel {} closed unexpectedly", tunnel.url());
    }
    Ok(())
}
