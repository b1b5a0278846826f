//! Gate tunnel client
//!
//! Exposes a service on a private network at a public URL by keeping a pool
//! of outbound TCP connections to a localtunnel-compatible broker. Each
//! inbound request arrives on one of those connections and is spliced onto a
//! fresh connection to the local service:
//! - `broker`: requests a public URL and learns where to open forwarding connections
//! - `pool`: keeps the forwarding connections open and recycles them per request
//! - `proxy`: rewrites the `Host` header, dials the local service and copies bytes
//! - `tunnel`: the handle callers hold, with notifications and shutdown
//!
//! ```no_run
//! # async fn run() -> gate_tunnel::Result<()> {
//! let tunnel = gate_tunnel::open_tunnel(gate_tunnel::TunnelConfig::new(3000)).await?;
//! println!("your url is: {}", tunnel.url());
//! tunnel.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod common;
pub mod config;
pub mod pool;
pub mod proxy;
pub mod tunnel;

// Re-export common types at crate root
pub use broker::RemoteSession;
pub use common::error;
pub use common::types::{TunnelEvent, TunnelState};
pub use config::{BackoffConfig, TunnelConfig, TunnelTimeouts};
pub use error::{ErrorKind, Result, TunnelError};
pub use pool::PoolStats;
pub use tunnel::{Tunnel, open_tunnel};

// Callers of `Tunnel::open_with_shutdown` need the same token type
pub use tokio_util::sync::CancellationToken;
