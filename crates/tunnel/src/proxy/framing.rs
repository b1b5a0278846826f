//! HTTP/1 request framing for the broker → local direction
//!
//! A forwarding connection may carry several requests back to back. The
//! framer follows `Content-Length` and chunked bodies so that every header
//! block, not just the first, passes through the `Host` rewrite. Anything
//! it cannot frame (upgrades, `CONNECT`, unknown codings, garbage) switches
//! the rest of the stream to opaque pass-through.

use super::header::{BodyFraming, HeadOutcome, HostRewriter, RequestLine, inspect_head};
use crate::common::error::Result;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

/// Longest chunk-size line accepted before giving up on framing
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a header block
    Head,
    /// Remaining bytes of a `Content-Length` body
    Body(u64),
    /// Waiting for a chunk-size line
    ChunkSize,
    /// Remaining bytes of chunk data plus its trailing CRLF
    ChunkData(u64),
    /// Trailer lines after the last chunk
    Trailers,
    Opaque,
}

impl From<BodyFraming> for Phase {
    fn from(body: BodyFraming) -> Self {
        match body {
            BodyFraming::Empty => Self::Head,
            BodyFraming::Length(len) => Self::Body(len),
            BodyFraming::Chunked => Self::ChunkSize,
            BodyFraming::Opaque => Self::Opaque,
        }
    }
}

/// Incremental request framer
///
/// Bytes read from the broker go into [`input_mut`](Self::input_mut);
/// [`drain`](Self::drain) moves whatever can be forwarded into an output
/// buffer, rewriting header blocks on the way.
#[derive(Debug)]
pub struct RequestFramer {
    rewriter: Option<HostRewriter>,
    max_header_bytes: usize,
    phase: Phase,
    input: BytesMut,
}

impl RequestFramer {
    /// Framer positioned right after a header block announcing `body`
    ///
    /// `pending` holds bytes already read past that header block.
    pub fn new(
        rewriter: Option<HostRewriter>,
        max_header_bytes: usize,
        body: BodyFraming,
        pending: BytesMut,
    ) -> Self {
        Self {
            rewriter,
            max_header_bytes,
            phase: body.into(),
            input: pending,
        }
    }

    /// Framer that forwards everything untouched
    pub fn opaque(pending: BytesMut) -> Self {
        Self {
            rewriter: None,
            max_header_bytes: 0,
            phase: Phase::Opaque,
            input: pending,
        }
    }

    /// Buffer to read broker bytes into
    pub fn input_mut(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    /// Whether every byte from now on is forwarded untouched
    pub fn is_opaque(&self) -> bool {
        self.phase == Phase::Opaque
    }

    /// Move forwardable bytes from the input to `out`
    ///
    /// Request lines of header blocks found on the way are appended to
    /// `requests`. Bytes of an unfinished header block, chunk-size line or
    /// trailer stay buffered until more input arrives.
    pub fn drain(&mut self, out: &mut BytesMut, requests: &mut Vec<RequestLine>) -> Result<()> {
        while !self.input.is_empty() {
            match self.phase {
                Phase::Opaque => {
                    out.unsplit(self.input.split());
                }
                Phase::Body(remaining) => {
                    self.phase = match self.forward(remaining, out) {
                        0 => Phase::Head,
                        left => Phase::Body(left),
                    };
                }
                Phase::ChunkData(remaining) => {
                    self.phase = match self.forward(remaining, out) {
                        0 => Phase::ChunkSize,
                        left => Phase::ChunkData(left),
                    };
                }
                Phase::Head => {
                    match inspect_head(self.rewriter.as_ref(), &self.input, self.max_header_bytes)? {
                        HeadOutcome::Incomplete => return Ok(()),
                        HeadOutcome::Passthrough => {
                            debug!("Unframeable data after a request, forwarding as-is");
                            self.phase = Phase::Opaque;
                        }
                        HeadOutcome::Complete { head, consumed } => {
                            trace!(?head.body, "next request on the connection");
                            self.input.advance(consumed);
                            out.extend_from_slice(&head.head);
                            requests.push(head.request);
                            self.phase = head.body.into();
                        }
                    }
                }
                Phase::ChunkSize => match httparse::parse_chunk_size(&self.input) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        out.extend_from_slice(&self.input.split_to(consumed));
                        self.phase = if size == 0 {
                            Phase::Trailers
                        } else {
                            Phase::ChunkData(size.saturating_add(2))
                        };
                    }
                    Ok(httparse::Status::Partial) if self.input.len() < MAX_CHUNK_LINE => {
                        return Ok(());
                    }
                    _ => {
                        debug!("Invalid chunk size line, forwarding the rest as-is");
                        self.phase = Phase::Opaque;
                    }
                },
                Phase::Trailers => match self.input.windows(2).position(|w| w == b"\r\n") {
                    Some(end) => {
                        out.extend_from_slice(&self.input.split_to(end + 2));
                        if end == 0 {
                            self.phase = Phase::Head;
                        }
                    }
                    None if self.input.len() < self.max_header_bytes => return Ok(()),
                    None => {
                        debug!("Oversized trailer, forwarding the rest as-is");
                        self.phase = Phase::Opaque;
                    }
                },
            }
        }
        Ok(())
    }

    /// Forward up to `remaining` bytes of the input, returning what is left
    fn forward(&mut self, remaining: u64, out: &mut BytesMut) -> u64 {
        let available = self.input.len();
        // Bounded by the input length
        let take = usize::try_from(remaining).map_or(available, |r| r.min(available));
        out.extend_from_slice(&self.input.split_to(take));
        remaining - take as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriting(body: BodyFraming, pending: &[u8]) -> RequestFramer {
        RequestFramer::new(
            Some(HostRewriter::new("localhost", 3000)),
            1024,
            body,
            BytesMut::from(pending),
        )
    }

    /// Feed `input` in pieces of `step` bytes and collect the output
    fn feed(framer: &mut RequestFramer, input: &[u8], step: usize) -> (Vec<u8>, Vec<String>) {
        let mut out = BytesMut::new();
        let mut requests = Vec::new();
        framer.drain(&mut out, &mut requests).unwrap();
        for piece in input.chunks(step) {
            framer.input_mut().extend_from_slice(piece);
            framer.drain(&mut out, &mut requests).unwrap();
        }
        let paths = requests.into_iter().map(|r| r.path).collect();
        (out.to_vec(), paths)
    }

    #[test]
    fn test_every_keep_alive_request_rewritten() {
        let stream = b"GET /a HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n\
POST /b HTTP/1.1\r\nHost: quiet-fox.broker.test\r\nContent-Length: 22\r\n\r\nHost: not-a-header.ok\n\
GET /c HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n";
        let expected = b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n\
POST /b HTTP/1.1\r\nHost: localhost\r\nContent-Length: 22\r\n\r\nHost: not-a-header.ok\n\
GET /c HTTP/1.1\r\nHost: localhost\r\n\r\n";

        for step in [1, 7, stream.len()] {
            let mut framer = rewriting(BodyFraming::Empty, b"");
            let (out, paths) = feed(&mut framer, stream, step);
            assert_eq!(out, expected, "step {step}");
            assert_eq!(paths, ["/a", "/b", "/c"]);
        }
    }

    #[test]
    fn test_chunked_body_then_next_request() {
        // Chunk data that looks like a header block must not be touched
        let stream = b"5\r\nHost:\r\n10;ext=1\r\nHost: x.test\r\n\r\n\r\n0\r\nX-Trailer: 1\r\n\r\n\
GET /next HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n";
        let mut framer = rewriting(BodyFraming::Chunked, b"");
        let (out, paths) = feed(&mut framer, stream, 3);

        let body_len = stream.len() - b"GET /next HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n".len();
        assert_eq!(&out[..body_len], &stream[..body_len]);
        assert_eq!(&out[body_len..], b"GET /next HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(paths, ["/next"]);
    }

    #[test]
    fn test_pending_bytes_are_framed() {
        let mut framer = rewriting(
            BodyFraming::Length(4),
            b"abcdGET /two HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n",
        );
        let (out, paths) = feed(&mut framer, b"", 1);
        assert_eq!(out, b"abcdGET /two HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(paths, ["/two"]);
    }

    #[test]
    fn test_upgrade_goes_opaque() {
        let mut framer = rewriting(BodyFraming::Opaque, b"");
        assert!(framer.is_opaque());
        let stream = b"\x81\x05hello GET / HTTP/1.1\r\nHost: quiet-fox.broker.test\r\n\r\n";
        let (out, paths) = feed(&mut framer, stream, 4);
        assert_eq!(out, stream);
        assert!(paths.is_empty());
    }

    #[test]
    fn test_garbage_after_request_goes_opaque() {
        let mut framer = rewriting(BodyFraming::Empty, b"");
        let (out, _) = feed(&mut framer, b"\x16\x03\x01 not http", 64);
        assert_eq!(out, b"\x16\x03\x01 not http");
        assert!(framer.is_opaque());

        let mut framer = rewriting(BodyFraming::Chunked, b"");
        let (out, _) = feed(&mut framer, b"zz\r\nrest", 64);
        assert_eq!(out, b"zz\r\nrest");
        assert!(framer.is_opaque());
    }

    #[test]
    fn test_partial_head_is_held_back() {
        let mut framer = rewriting(BodyFraming::Empty, b"");
        let (out, paths) = feed(&mut framer, b"GET / HTTP/1.1\r\nHost: quiet", 64);
        assert!(out.is_empty());
        assert!(paths.is_empty());
    }

    #[test]
    fn test_oversized_later_head_is_an_error() {
        let mut framer = rewriting(BodyFraming::Empty, b"");
        let mut head = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        head.extend(std::iter::repeat_n(b'a', 2048));
        framer.input_mut().extend_from_slice(&head);

        let mut out = BytesMut::new();
        let err = framer.drain(&mut out, &mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::HeaderTooLarge);
    }
}
