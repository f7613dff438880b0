//! Per-connection entry point for the accept loop.
//!
//! The request head is read by the gateway itself: WebSocket upgrades must
//! keep ownership of the raw `TcpStream` (the extension-host hand-off ships
//! the fd to a child process), which no off-the-shelf server exposes. Plain
//! HTTP requests are replayed into hyper + the axum router via a rewind
//! stream.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use bytes::BytesMut;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tower::Service;

use crate::broker;
use crate::http::head::{HeadError, RequestHead, MAX_HEAD_BYTES};
use crate::AppState;

/// How long a client may take to deliver its request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one accepted TCP connection.
pub async fn handle_connection(stream: TcpStream, router: Router, state: AppState) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let read = tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(stream)).await;
    let (head, head_len, buf, stream) = match read {
        Ok(Ok(parts)) => parts,
        Ok(Err(err)) => {
            tracing::debug!(%peer, %err, "dropping connection with unreadable head");
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "timed out reading request head");
            return;
        }
    };

    if head.is_websocket_upgrade() {
        let mut leftover = buf;
        let leftover = leftover.split_off(head_len);
        broker::handle_upgrade(stream, head, leftover, state).await;
    } else {
        serve_http(stream, buf, router, &peer).await;
    }
}

/// Read until the blank line ending the head; returns the parsed head, its
/// length in bytes, everything read so far, and the stream.
async fn read_head(
    mut stream: TcpStream,
) -> Result<(RequestHead, usize, BytesMut, TcpStream), HeadError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = RequestHead::parse(&buf[..end])?;
            return Ok((head, end, buf, stream));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HeadError::TooLarge);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.map_err(|_| HeadError::Malformed)?;
        if n == 0 {
            return Err(HeadError::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Serve plain HTTP over the connection, replaying the already-read bytes.
async fn serve_http(stream: TcpStream, consumed: BytesMut, router: Router, peer: &str) {
    let rewound = Rewind {
        prefix: consumed,
        inner: stream,
    };
    let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        router.clone().call(request)
    });
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(rewound), service)
        .await
    {
        tracing::debug!(%peer, %err, "http connection ended with error");
    }
}

/// An IO wrapper that serves buffered bytes before reading from the inner
/// stream. Writes pass straight through.
struct Rewind<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let bytes = self.prefix.split_to(n);
            buf.put_slice(&bytes);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
