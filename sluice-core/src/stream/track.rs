//! Progress-tracked byte sources
//!
//! Every in-flight HTTP body is wrapped so the controller can observe
//! its progress and terminate it mid-read during cancellation.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, ReadBuf};

/// Upper bound on a single body-stream slice
const BODY_SLICE: usize = 64 * 1024;

/// Shared view of a tracked source's progress and liveness.
///
/// Cloneable; all clones observe the same counters.
#[derive(Clone, Default)]
pub struct TrackHandle {
    inner: Arc<TrackState>,
}

#[derive(Default)]
struct TrackState {
    bytes_done: AtomicU64,
    closed: AtomicBool,
}

impl TrackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative bytes consumed through the tracked source
    pub fn bytes_done(&self) -> u64 {
        self.inner.bytes_done.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Make the next read through this handle fail like an unexpected EOF
    pub fn force_close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    /// Rewind the progress counter before a retry attempt
    pub fn reset(&self) {
        self.inner.bytes_done.store(0, Ordering::Relaxed);
    }

    fn add(&self, n: u64) {
        self.inner.bytes_done.fetch_add(n, Ordering::Relaxed);
    }
}

pub(crate) fn interrupted() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "read terminated by force_close",
    )
}

/// `AsyncRead` wrapper that counts consumed bytes and honors `force_close`
pub struct TrackedReader<R> {
    inner: R,
    handle: TrackHandle,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            handle: TrackHandle::new(),
        }
    }

    pub fn with_handle(inner: R, handle: TrackHandle) -> Self {
        Self { inner, handle }
    }

    pub fn handle(&self) -> TrackHandle {
        self.handle.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TrackedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.handle.is_closed() {
            return Poll::Ready(Err(interrupted()));
        }
        let before = buf.filled().len();
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                me.handle.add(n as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Upload body over a sealed part buffer.
///
/// Yields bounded slices of the part while counting them, so cancellation
/// can cut an in-progress PUT and the controller can watch it advance.
/// A fresh body is built (and the handle reset) for every retry attempt.
pub struct TrackedBody {
    data: Bytes,
    pos: usize,
    handle: TrackHandle,
}

impl TrackedBody {
    pub fn new(data: Bytes, handle: TrackHandle) -> Self {
        Self {
            data,
            pos: 0,
            handle,
        }
    }
}

impl Stream for TrackedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_closed() {
            return Poll::Ready(Some(Err(interrupted())));
        }
        if self.pos >= self.data.len() {
            return Poll::Ready(None);
        }
        let end = (self.pos + BODY_SLICE).min(self.data.len());
        let slice = self.data.slice(self.pos..end);
        self.pos = end;
        self.handle.add(slice.len() as u64);
        Poll::Ready(Some(Ok(slice)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reader_counts_bytes() {
        let data: &[u8] = b"0123456789";
        let mut reader = TrackedReader::new(data);
        let handle = reader.handle();

        let mut out = [0u8; 4];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(handle.bytes_done(), 4);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(handle.bytes_done(), 10);
        assert_eq!(rest, b"456789");
    }

    #[tokio::test]
    async fn reader_force_close_fails_next_read() {
        let data: &[u8] = b"abcdef";
        let mut reader = TrackedReader::new(data);
        let handle = reader.handle();

        let mut out = [0u8; 2];
        reader.read_exact(&mut out).await.unwrap();
        handle.force_close();

        let err = reader.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn body_slices_and_counts() {
        let payload = Bytes::from(vec![7u8; 200_000]);
        let handle = TrackHandle::new();
        let mut body = TrackedBody::new(payload.clone(), handle.clone());

        let mut collected = Vec::new();
        while let Some(item) = body.next().await {
            collected.extend_from_slice(&item.unwrap());
        }
        assert_eq!(collected, payload);
        assert_eq!(handle.bytes_done(), 200_000);
    }

    #[tokio::test]
    async fn body_reset_rewinds_counter() {
        let handle = TrackHandle::new();
        let mut body = TrackedBody::new(Bytes::from_static(b"xyz"), handle.clone());
        let _ = body.next().await;
        assert_eq!(handle.bytes_done(), 3);

        handle.reset();
        assert_eq!(handle.bytes_done(), 0);
    }

    #[tokio::test]
    async fn body_force_close_errors() {
        let handle = TrackHandle::new();
        let mut body = TrackedBody::new(Bytes::from(vec![0u8; 1024]), handle.clone());
        handle.force_close();
        let item = body.next().await.unwrap();
        assert!(item.is_err());
    }
}
