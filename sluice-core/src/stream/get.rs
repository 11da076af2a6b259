//! Ordered ranged-GET pipeline
//!
//! Presents a sequential byte stream while fetching fixed-size ranges
//! concurrently. Workers publish completed chunks to the reader, which
//! reassembles them in id order; a small bounded backlog (`Q_WAIT_MAX`)
//! keeps fast workers from racing ahead of a slow consumer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::TryStreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Method, Url};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::bucket::{md5_sidecar_path, service_error, Bucket};
use crate::error::{Result, SluiceError};
use crate::stream::pool::BufferPool;
use crate::stream::track::{TrackHandle, TrackedReader};

/// Maximum completed-but-unread chunks parked ahead of the reader
pub const Q_WAIT_MAX: usize = 2;

/// A chunk descriptor handed to a worker
struct ChunkSpec {
    id: u64,
    start: u64,
    size: u64,
}

/// A fetched chunk awaiting in-order delivery
struct Chunk {
    id: u64,
    size: u64,
    buf: BytesMut,
}

/// State shared between the reader, its workers, and the controller
pub(crate) struct GetShared {
    url: Url,
    err: Mutex<Option<SluiceError>>,
    bytes_read: AtomicU64,
    active: Mutex<HashMap<u64, TrackHandle>>,
    pool: Arc<BufferPool>,
    quit_tx: broadcast::Sender<()>,
}

impl GetShared {
    fn sticky(&self) -> Option<SluiceError> {
        self.err.lock().clone()
    }

    /// Record the first fatal error; later errors are dropped
    pub(crate) fn set_sticky(&self, err: SluiceError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Wake every worker parked on dispatch or backpressure
    pub(crate) fn quit(&self) {
        let _ = self.quit_tx.send(());
    }

    pub(crate) fn close_pool(&self) {
        self.pool.close();
    }

    /// Delivered bytes plus in-flight progress of active chunks.
    ///
    /// A chunk may complete between the two reads, briefly counting
    /// twice; the controller latches the result so it never regresses.
    pub(crate) fn bytes_done(&self) -> u64 {
        let in_flight: u64 = self.active.lock().values().map(|h| h.bytes_done()).sum();
        self.bytes_read.load(Ordering::Relaxed) + in_flight
    }

    /// Terminate every in-flight response body read
    pub(crate) fn force_close_active(&self) {
        for handle in self.active.lock().values() {
            handle.force_close();
        }
    }
}

/// Sequential reader over an object fetched with parallel ranged GETs
pub struct ObjectReader {
    bucket: Bucket,
    path: String,
    shared: Arc<GetShared>,
    ready_rx: mpsc::Receiver<Chunk>,
    q_wait: BTreeMap<u64, Chunk>,
    q_len_tx: watch::Sender<usize>,
    current: Option<Chunk>,
    cursor: usize,
    next_id: u64,
    bytes_read: u64,
    content_length: u64,
    chunk_total: u64,
    md5: Option<md5::Context>,
    headers: HeaderMap,
    closed: bool,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("path", &self.path)
            .field("bytes_read", &self.bytes_read)
            .field("content_length", &self.content_length)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Bucket {
    /// Open a parallel download of the object at `path`.
    ///
    /// Issues an unranged GET to learn the content length and surface
    /// response headers, then starts the worker pool. A version may be
    /// selected with a `?versionId=<v>` suffix on the path.
    pub async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        if path.is_empty() {
            return Err(SluiceError::EmptyPath);
        }
        let url = self.object_url(path)?;
        ObjectReader::open(self.clone(), path.to_string(), url).await
    }
}

impl ObjectReader {
    pub(crate) async fn open(bucket: Bucket, path: String, url: Url) -> Result<Self> {
        let config = bucket.config().clone();
        let part_size = config.part_size.max(1);
        let concurrency = config.concurrency.max(1);
        let n_try = config.n_try.max(1);

        // GET instead of HEAD so failures carry a parseable error body
        let resp = bucket
            .retry_request(Method::GET, url.clone(), None, None)
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(service_error(resp).await);
        }
        let content_length = resp
            .content_length()
            .ok_or(SluiceError::UnknownContentLength)?;
        let headers = resp.headers().clone();
        drop(resp);

        let chunk_total = content_length.div_ceil(part_size);
        debug!(
            size_mb = content_length as f64 / (1024.0 * 1024.0),
            chunks = chunk_total,
            "object download starting"
        );

        let pool = BufferPool::new(part_size as usize, concurrency + Q_WAIT_MAX + 1);
        let (quit_tx, _) = broadcast::channel(1);
        let shared = Arc::new(GetShared {
            url,
            err: Mutex::new(None),
            bytes_read: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            pool,
            quit_tx,
        });

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<ChunkSpec>(1);
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        let (ready_tx, ready_rx) = mpsc::channel::<Chunk>(1);
        let (q_len_tx, q_len_rx) = watch::channel(0usize);

        for _ in 0..concurrency {
            tokio::spawn(worker(
                bucket.clone(),
                Arc::clone(&shared),
                Arc::clone(&dispatch_rx),
                ready_tx.clone(),
                q_len_rx.clone(),
                n_try,
            ));
        }
        drop(ready_tx);

        // dispatcher enumerates chunk descriptors in id order
        tokio::spawn(async move {
            let mut start = 0u64;
            for id in 0..chunk_total {
                let size = part_size.min(content_length - start);
                let spec = ChunkSpec { id, start, size };
                start += size;
                if dispatch_tx.send(spec).await.is_err() {
                    return;
                }
            }
        });

        Ok(Self {
            bucket,
            path,
            shared,
            ready_rx,
            q_wait: BTreeMap::new(),
            q_len_tx,
            current: None,
            cursor: 0,
            next_id: 0,
            bytes_read: 0,
            content_length,
            chunk_total,
            md5: config.md5_check.then(md5::Context::new),
            headers,
            closed: false,
        })
    }

    /// Headers from the initial object response
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Total object size in bytes
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub(crate) fn shared(&self) -> Arc<GetShared> {
        Arc::clone(&self.shared)
    }

    /// Copy the next run of in-order bytes into `dst`.
    ///
    /// Returns `Ok(0)` exactly once the full content length has been
    /// delivered. Blocks while the next-needed chunk is still in flight.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(SluiceError::AlreadyClosed);
        }
        if let Some(e) = self.shared.sticky() {
            return Err(e);
        }

        let mut filled = 0usize;
        while filled < dst.len() {
            if self.bytes_read == self.content_length {
                break;
            }
            if self.bytes_read > self.content_length {
                return Err(SluiceError::TooManyBytes {
                    expected: self.content_length,
                    received: self.bytes_read,
                });
            }
            if self.current.is_none() {
                if self.next_id >= self.chunk_total {
                    return Err(SluiceError::OutOfChunks {
                        expected: self.content_length,
                        received: self.bytes_read,
                        next: self.next_id,
                        total: self.chunk_total,
                    });
                }
                self.current = Some(self.next_chunk().await?);
                self.cursor = 0;
            }

            let mut finished = false;
            if let Some(chunk) = self.current.as_ref() {
                let remaining = chunk.size as usize - self.cursor;
                let n = remaining.min(dst.len() - filled);
                dst[filled..filled + n]
                    .copy_from_slice(&chunk.buf[self.cursor..self.cursor + n]);
                self.cursor += n;
                filled += n;
                self.bytes_read += n as u64;
                self.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                finished = self.cursor >= chunk.size as usize;
            }
            if finished {
                if let Some(done) = self.current.take() {
                    self.shared.active.lock().remove(&done.id);
                    self.shared.pool.release(done.buf);
                    self.next_id += 1;
                }
            }
        }
        Ok(filled)
    }

    /// Pull chunks off the ready channel until the next-needed id appears
    async fn next_chunk(&mut self) -> Result<Chunk> {
        let mut quit = self.shared.quit_tx.subscribe();
        loop {
            if let Some(chunk) = self.q_wait.remove(&self.next_id) {
                // room opened up: wake a parked worker
                self.q_len_tx.send_modify(|len| *len = len.saturating_sub(1));
                if let Some(md5) = self.md5.as_mut() {
                    md5.consume(&chunk.buf[..chunk.size as usize]);
                }
                return Ok(chunk);
            }
            tokio::select! {
                received = self.ready_rx.recv() => match received {
                    Some(chunk) => {
                        self.q_wait.insert(chunk.id, chunk);
                        self.q_len_tx.send_modify(|len| *len += 1);
                    }
                    None => {
                        return Err(self.shared.sticky().unwrap_or(SluiceError::Internal {
                            message: "chunk pipeline terminated early".to_string(),
                        }))
                    }
                },
                _ = quit.recv() => {
                    return Err(self.shared.sticky().unwrap_or(SluiceError::Stopped))
                }
            }
        }
    }

    /// Tear down the pipeline and settle the final result.
    ///
    /// A second close is an error. With `md5_check` enabled, a clean
    /// full-length read is verified against the `.md5` sidecar object.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(SluiceError::AlreadyClosed);
        }
        self.closed = true;
        self.shared.close_pool();
        self.shared.quit();

        if let Some(e) = self.shared.sticky() {
            return Err(e);
        }
        if self.bytes_read != self.content_length {
            return Err(SluiceError::ShortRead {
                expected: self.content_length,
                received: self.bytes_read,
            });
        }
        if let Some(ctx) = self.md5.take() {
            self.verify_md5(ctx).await?;
        }
        Ok(())
    }

    async fn verify_md5(&self, ctx: md5::Context) -> Result<()> {
        let calculated = format!("{:x}", ctx.compute());
        let sidecar = md5_sidecar_path(&self.path);
        let url = self.bucket.object_url(&sidecar)?;
        debug!(%calculated, sidecar, "verifying md5");

        let resp = self
            .bucket
            .retry_request(Method::GET, url.clone(), None, None)
            .await?;
        if resp.status().as_u16() != 200 {
            let cause = service_error(resp).await;
            return Err(SluiceError::Md5SidecarMissing {
                url: url.to_string(),
                message: cause.to_string(),
            });
        }
        let body = resp.bytes().await.map_err(SluiceError::from)?;
        let given = String::from_utf8_lossy(&body).to_string();
        if given != calculated {
            return Err(SluiceError::Md5Mismatch { given, calculated });
        }
        Ok(())
    }
}

impl Drop for ObjectReader {
    fn drop(&mut self) {
        self.shared.close_pool();
        self.shared.quit();
    }
}

/// Worker: fetch dispatched chunks until the dispatcher runs dry
async fn worker(
    bucket: Bucket,
    shared: Arc<GetShared>,
    dispatch: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkSpec>>>,
    ready: mpsc::Sender<Chunk>,
    mut q_len: watch::Receiver<usize>,
    n_try: u32,
) {
    let mut quit = shared.quit_tx.subscribe();
    loop {
        let spec = {
            let mut rx = dispatch.lock().await;
            tokio::select! {
                next = rx.recv() => match next {
                    Some(spec) => spec,
                    None => return,
                },
                _ = quit.recv() => return,
            }
        };

        // visible to the controller before the first body byte arrives
        let handle = TrackHandle::new();
        shared.active.lock().insert(spec.id, handle.clone());

        let buf = match shared.pool.acquire().await {
            Ok(buf) => buf,
            Err(_) => return, // pool closed: pipeline is tearing down
        };

        match fetch_chunk(&bucket, &shared, &spec, buf, &handle, n_try).await {
            Ok(chunk) => {
                tokio::select! {
                    sent = ready.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = quit.recv() => return,
                }
                // hold off the next fetch until the reassembly backlog drains
                tokio::select! {
                    waited = q_len.wait_for(|len| *len < Q_WAIT_MAX) => {
                        if waited.is_err() {
                            return;
                        }
                    }
                    _ = quit.recv() => return,
                }
            }
            Err(e) => {
                shared.set_sticky(e);
                shared.quit();
                return;
            }
        }
    }
}

/// Fetch one chunk with retry and exponential backoff
async fn fetch_chunk(
    bucket: &Bucket,
    shared: &GetShared,
    spec: &ChunkSpec,
    mut buf: BytesMut,
    handle: &TrackHandle,
    n_try: u32,
) -> Result<Chunk> {
    let mut last: Option<SluiceError> = None;
    for attempt in 0..n_try {
        if handle.is_closed() {
            return Err(shared.sticky().unwrap_or(SluiceError::Stopped));
        }
        handle.reset();
        buf.clear();
        match get_range(bucket, shared, spec, &mut buf, handle).await {
            Ok(()) => return Ok(Chunk {
                id: spec.id,
                size: spec.size,
                buf,
            }),
            Err(e) => {
                warn!(chunk = spec.id, attempt, error = %e, "chunk fetch failed");
                let retryable = e.is_retryable();
                last = Some(e);
                if !retryable {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100u64 << attempt)).await;
            }
        }
    }
    Err(last.unwrap_or(SluiceError::Internal {
        message: format!("chunk {} fetch failed", spec.id),
    }))
}

/// One signed ranged GET, read exactly to the chunk size
async fn get_range(
    bucket: &Bucket,
    shared: &GetShared,
    spec: &ChunkSpec,
    buf: &mut BytesMut,
    handle: &TrackHandle,
) -> Result<()> {
    let mut request = reqwest::Request::new(Method::GET, shared.url.clone());
    let range = format!("bytes={}-{}", spec.start, spec.start + spec.size - 1);
    request.headers_mut().insert(
        RANGE,
        HeaderValue::from_str(&range).map_err(|e| SluiceError::Internal {
            message: format!("range header: {e}"),
        })?,
    );

    let resp = bucket.send(request).await?;
    let status = resp.status().as_u16();
    if status != 206 && status != 200 {
        return Err(service_error(resp).await);
    }

    let body = Box::pin(
        resp.bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    let mut reader = TrackedReader::with_handle(StreamReader::new(body), handle.clone());

    buf.resize(spec.size as usize, 0);
    reader
        .read_exact(&mut buf[..])
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => SluiceError::SizeMismatch {
                id: spec.id,
                expected: spec.size,
                received: handle.bytes_done().min(spec.size),
            },
            _ => SluiceError::Transport {
                message: format!("chunk {} body read: {e}", spec.id),
            },
        })?;
    Ok(())
}
