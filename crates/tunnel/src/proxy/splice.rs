//! Bidirectional byte forwarding between a broker connection and a local stream

use super::framing::RequestFramer;
use super::header::RequestLine;
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Buffer size for copying data
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished splice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Broker → local
    pub to_local: u64,
    /// Local → broker
    pub to_broker: u64,
}

/// Copy both directions concurrently
///
/// `prefix` is written to the local side before anything read from the
/// broker. When the broker side reaches EOF the local write half is shut
/// down and the response is still relayed; when the local side finishes the
/// broker → local direction is dropped and the pair is done. Resets and
/// broken pipes count as a normal end of stream.
pub async fn splice<B, L>(broker: B, local: L, prefix: &[u8]) -> io::Result<SpliceStats>
where
    B: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    splice_framed(
        broker,
        local,
        prefix,
        RequestFramer::opaque(BytesMut::new()),
        |_| {},
    )
    .await
}

/// [`splice`] with the broker → local direction passed through `framer`
///
/// `on_request` sees every request the framer finds after the prefix. A
/// framing error ends the splice with an `InvalidData` error wrapping the
/// [`TunnelError`](crate::TunnelError).
pub async fn splice_framed<B, L, F>(
    broker: B,
    local: L,
    prefix: &[u8],
    mut framer: RequestFramer,
    mut on_request: F,
) -> io::Result<SpliceStats>
where
    B: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(RequestLine),
{
    let (mut broker_recv, mut broker_send) = tokio::io::split(broker);
    let (mut local_recv, mut local_send) = tokio::io::split(local);
    let to_local = AtomicU64::new(0);
    let to_broker = AtomicU64::new(0);

    let start = tokio::time::Instant::now();
    let inbound = async {
        if !prefix.is_empty() {
            local_send.write_all(prefix).await?;
            local_send.flush().await?;
            to_local.fetch_add(prefix.len() as u64, Ordering::Relaxed);
        }
        let res = if framer.is_opaque() && framer.input_mut().is_empty() {
            copy_counted(&mut broker_recv, &mut local_send, &to_local).await
        } else {
            copy_framed(
                &mut broker_recv,
                &mut local_send,
                &mut framer,
                &mut on_request,
                &to_local,
            )
            .await
        };
        local_send.shutdown().await.ok();
        trace!(?res, elapsed = ?start.elapsed(), "forward broker-to-local finished");
        res
    };
    let outbound = async {
        let res = copy_counted(&mut local_recv, &mut broker_send, &to_broker).await;
        broker_send.shutdown().await.ok();
        trace!(?res, elapsed = ?start.elapsed(), "forward local-to-broker finished");
        res
    };
    tokio::pin!(inbound, outbound);

    tokio::select! {
        res = &mut outbound => {
            tolerate_closed(res)?;
        }
        res = &mut inbound => {
            tolerate_closed(res)?;
            tolerate_closed(outbound.await)?;
        }
    }

    Ok(SpliceStats {
        to_local: to_local.load(Ordering::Relaxed),
        to_broker: to_broker.load(Ordering::Relaxed),
    })
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn copy_framed<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    framer: &mut RequestFramer,
    on_request: &mut F,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(RequestLine),
{
    let mut out = BytesMut::with_capacity(COPY_BUFFER_SIZE);
    let mut requests = Vec::new();
    loop {
        framer
            .drain(&mut out, &mut requests)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for request in requests.drain(..) {
            on_request(request);
        }
        if !out.is_empty() {
            writer.write_all(&out).await?;
            writer.flush().await?;
            counter.fetch_add(out.len() as u64, Ordering::Relaxed);
            out.clear();
        }

        let input = framer.input_mut();
        input.reserve(COPY_BUFFER_SIZE);
        if reader.read_buf(input).await? == 0 {
            return Ok(());
        }
    }
}

fn tolerate_closed(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if is_connection_closed_error(&e) => Ok(()),
        other => other,
    }
}

/// Check if an error is just a connection closed error
pub fn is_connection_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}
