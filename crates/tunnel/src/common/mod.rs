//! Common types shared by the broker client, the pool and the tunnel handle
pub mod error;
pub mod types;

pub use error::{ErrorKind, Result, TunnelError};
pub use types::*;
