//! `Host` header rewriting for the broker → local direction
//!
//! A header block is parsed with httparse and only the `Host` value is
//! replaced. The block also tells how the request body is framed, which is
//! what lets [`RequestFramer`](super::framing::RequestFramer) find the next
//! header block on a keep-alive connection.

use crate::common::error::{Result, TunnelError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Headers indexed on the first parse attempt
///
/// Blocks with more headers are parsed again with room for as many as
/// `max_header_bytes` can hold.
const MAX_HEADERS: usize = 128;

/// Method and target of a forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
}

/// How the body following a header block is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body; the next header block follows immediately
    Empty,
    /// `Content-Length` bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Upgrades, `CONNECT` and unknown framings: the rest of the stream is opaque
    Opaque,
}

/// A parsed and possibly rewritten header block
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Bytes to send in place of the original header block
    pub head: Bytes,
    pub request: RequestLine,
    pub body: BodyFraming,
}

/// Replaces the `Host` header value with a configured override
#[derive(Debug, Clone)]
pub struct HostRewriter {
    host: String,
    local_port: u16,
}

/// Result of inspecting the buffered start of a request
#[derive(Debug)]
pub enum HeadOutcome {
    /// The header block is not complete yet
    Incomplete,
    /// Header block found and possibly rewritten
    Complete {
        head: RequestHead,
        /// Length of the original header block in the buffer
        consumed: usize,
    },
    /// Not an HTTP/1 request; forward as-is
    Passthrough,
}

impl HostRewriter {
    /// Create a rewriter substituting `host` for the local service on `local_port`
    pub fn new(host: impl Into<String>, local_port: u16) -> Self {
        Self {
            host: host.into(),
            local_port,
        }
    }

    /// The configured override
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Value that replaces `original` in the forwarded request
    ///
    /// The override is used verbatim unless the original value carried an
    /// explicit port that differs from the local one, in which case the
    /// local port is appended (when the override has none of its own).
    pub fn replacement_for(&self, original: &[u8]) -> String {
        let original_port = std::str::from_utf8(original).ok().and_then(split_port);
        match original_port {
            Some(port) if port != self.local_port && split_port(&self.host).is_none() => {
                format!("{}:{}", self.host, self.local_port)
            }
            _ => self.host.clone(),
        }
    }

    /// Inspect `buf` and rewrite the `Host` header once the block is complete
    pub fn rewrite_head(&self, buf: &[u8], max_header_bytes: usize) -> Result<HeadOutcome> {
        inspect_head(Some(self), buf, max_header_bytes)
    }

    /// Read from `reader` into `buf` until the header block can be rewritten
    ///
    /// See [`read_request_head`].
    pub async fn read_head<R>(
        &self,
        reader: &mut R,
        buf: &mut BytesMut,
        max_header_bytes: usize,
    ) -> Result<Option<RequestHead>>
    where
        R: AsyncRead + Unpin,
    {
        read_request_head(Some(self), reader, buf, max_header_bytes).await
    }
}

/// Parse the header block at the start of `buf`, rewriting `Host` when a
/// rewriter is given
pub fn inspect_head(
    rewriter: Option<&HostRewriter>,
    buf: &[u8],
    max_header_bytes: usize,
) -> Result<HeadOutcome> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    if let Some(outcome) = parse_head(rewriter, buf, max_header_bytes, &mut headers)? {
        return Ok(outcome);
    }

    // Every header line takes at least three bytes ("a:\n")
    let mut headers = vec![httparse::EMPTY_HEADER; max_header_bytes / 3 + 1];
    parse_head(rewriter, buf, max_header_bytes, &mut headers)?.ok_or(
        TunnelError::HeaderTooLarge {
            limit: max_header_bytes,
        },
    )
}

/// `Ok(None)` when `headers` has too few slots for the block
fn parse_head<'b>(
    rewriter: Option<&HostRewriter>,
    buf: &'b [u8],
    max_header_bytes: usize,
    headers: &mut [httparse::Header<'b>],
) -> Result<Option<HeadOutcome>> {
    let mut req = httparse::Request::new(headers);

    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= max_header_bytes {
                return Err(TunnelError::HeaderTooLarge {
                    limit: max_header_bytes,
                });
            }
            return Ok(Some(HeadOutcome::Incomplete));
        }
        Err(httparse::Error::TooManyHeaders) => return Ok(None),
        Err(e) => {
            debug!("Not rewriting non-HTTP stream: {}", e);
            return Ok(Some(HeadOutcome::Passthrough));
        }
    };

    if header_len > max_header_bytes {
        return Err(TunnelError::HeaderTooLarge {
            limit: max_header_bytes,
        });
    }

    let request = RequestLine {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or_default().to_string(),
    };
    let body = body_framing(&request.method, &*req.headers);

    let host_value = rewriter.and_then(|rewriter| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| (rewriter, h.value))
    });

    let head = match host_value {
        Some((rewriter, value)) => {
            // httparse hands out sub-slices of `buf`, so the offset locates the value in place
            let start = value.as_ptr() as usize - buf.as_ptr() as usize;
            let end = start + value.len();
            let replacement = rewriter.replacement_for(value);
            trace!(
                "Rewriting Host {:?} -> {:?}",
                String::from_utf8_lossy(value),
                replacement
            );

            let mut out = BytesMut::with_capacity(header_len + replacement.len());
            out.extend_from_slice(&buf[..start]);
            out.extend_from_slice(replacement.as_bytes());
            out.extend_from_slice(&buf[end..header_len]);
            out.freeze()
        }
        None => Bytes::copy_from_slice(&buf[..header_len]),
    };

    Ok(Some(HeadOutcome::Complete {
        head: RequestHead {
            head,
            request,
            body,
        },
        consumed: header_len,
    }))
}

/// Read from `reader` into `buf` until a whole header block is buffered
///
/// On return `buf` holds the bytes that follow the original header block.
/// `None` means the stream is not HTTP (or ended early) and `buf` must be
/// forwarded as-is.
pub async fn read_request_head<R>(
    rewriter: Option<&HostRewriter>,
    reader: &mut R,
    buf: &mut BytesMut,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    loop {
        match inspect_head(rewriter, buf, max_header_bytes)? {
            HeadOutcome::Complete { head, consumed } => {
                let _ = buf.split_to(consumed);
                return Ok(Some(head));
            }
            HeadOutcome::Passthrough => return Ok(None),
            HeadOutcome::Incomplete => {
                let limit = max_header_bytes.saturating_sub(buf.len()).max(1);
                let n = (&mut *reader).take(limit as u64).read_buf(buf).await?;
                if n == 0 {
                    debug!("Stream ended inside the header block");
                    return Ok(None);
                }
            }
        }
    }
}

fn body_framing(method: &str, headers: &[httparse::Header<'_>]) -> BodyFraming {
    if method.eq_ignore_ascii_case("CONNECT") {
        return BodyFraming::Opaque;
    }

    let upgrade = header_tokens(headers, "connection").any(|token| token == "upgrade");
    if upgrade && headers.iter().any(|h| h.name.eq_ignore_ascii_case("upgrade")) {
        return BodyFraming::Opaque;
    }

    // The final transfer coding decides the framing
    if let Some(coding) = header_tokens(headers, "transfer-encoding").last() {
        return if coding == "chunked" {
            BodyFraming::Chunked
        } else {
            BodyFraming::Opaque
        };
    }

    match header_tokens(headers, "content-length").next() {
        Some(value) => match value.parse::<u64>() {
            Ok(0) => BodyFraming::Empty,
            Ok(len) => BodyFraming::Length(len),
            Err(_) => BodyFraming::Opaque,
        },
        None => BodyFraming::Empty,
    }
}

/// Lowercased comma-separated tokens of every `name` header
fn header_tokens<'h>(
    headers: &'h [httparse::Header<'h>],
    name: &'h str,
) -> impl Iterator<Item = String> + 'h {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| {
            String::from_utf8_lossy(h.value)
                .split(',')
                .map(|token| token.trim().to_ascii_lowercase())
                .collect::<Vec<_>>()
        })
}

/// Best-effort request line from the first bytes of a connection
///
/// Never waits for more data; used for request notifications when no
/// rewriting is configured.
pub fn peek_request_line(buf: &[u8]) -> Option<RequestLine> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    // A partial parse still fills in the request line once it is complete
    let _ = req.parse(buf);
    match (req.method, req.path) {
        (Some(method), Some(path)) => Some(RequestLine {
            method: method.to_string(),
            path: path.to_string(),
        }),
        _ => None,
    }
}

/// Explicit port of a `host[:port]` authority
fn split_port(authority: &str) -> Option<u16> {
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        // Bare IPv6 address without a port
        return None;
    }
    port.parse().ok()
}
