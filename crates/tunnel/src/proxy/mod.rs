//! Per-request forwarding: header rewriting, request framing, local connections and the byte splice

pub mod framing;
pub mod header;
pub mod local;
pub mod splice;

pub use framing::RequestFramer;
pub use header::{
    BodyFraming, HeadOutcome, HostRewriter, RequestHead, RequestLine, inspect_head,
    peek_request_line, read_request_head,
};
pub use local::{LocalConnector, LocalStream};
pub use splice::{SpliceStats, is_connection_closed_error, splice, splice_framed};
