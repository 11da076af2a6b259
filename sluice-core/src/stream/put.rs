//! Multipart PUT pipeline
//!
//! Accepts a sequential byte stream, seals it into fixed-size parts, and
//! uploads the parts concurrently. Short streams never leave the
//! single-PUT fast path; long streams grow their part size so the
//! part-count ceiling stays out of reach.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, ETAG};
use reqwest::{Method, Url};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::bucket::{md5_sidecar_path, service_error, Bucket};
use crate::error::{Result, SluiceError};
use crate::stream::pool::BufferPool;
use crate::stream::track::{TrackHandle, TrackedBody};

/// Server-side minimum part size for multipart uploads (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 limit on parts per multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// S3 limit on a single part's size (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Sealed parts between part-size doublings
const GROWTH_INTERVAL: u32 = 1000;

/// Buffers a pipeline may hold beyond its worker count
const POOL_HEADROOM: usize = 3;

/// A sealed part travelling to a worker
struct Part {
    number: u32,
    data: Bytes,
    handle: TrackHandle,
}

/// A worker's completion record
struct PartDone {
    number: u32,
    etag: String,
}

/// State shared between the writer, its workers, and the controller
pub(crate) struct PutShared {
    err: Mutex<Option<SluiceError>>,
    completed: AtomicU64,
    active: Mutex<HashMap<u32, TrackHandle>>,
    pool: Arc<BufferPool>,
    quit_tx: broadcast::Sender<()>,
}

impl PutShared {
    fn sticky(&self) -> Option<SluiceError> {
        self.err.lock().clone()
    }

    pub(crate) fn set_sticky(&self, err: SluiceError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn quit(&self) {
        let _ = self.quit_tx.send(());
    }

    pub(crate) fn close_pool(&self) {
        self.pool.close();
    }

    /// Bytes of completed parts plus in-flight request-body progress
    pub(crate) fn bytes_done(&self) -> u64 {
        let in_flight: u64 = self.active.lock().values().map(|h| h.bytes_done()).sum();
        self.completed.load(Ordering::Relaxed) + in_flight
    }

    /// Terminate every in-flight part upload body
    pub(crate) fn force_close_active(&self) {
        for handle in self.active.lock().values() {
            handle.force_close();
        }
    }
}

/// Sequential writer uploading an object as concurrent parts
pub struct ObjectWriter {
    bucket: Bucket,
    path: String,
    url: Url,
    headers: HeaderMap,
    upload_id: String,
    shared: Arc<PutShared>,
    dispatch_tx: Option<mpsc::Sender<Part>>,
    done_rx: mpsc::UnboundedReceiver<PartDone>,
    current: Option<BytesMut>,
    part_size: u64,
    parts_sealed: u32,
    bytes_written: u64,
    md5: Option<md5::Context>,
    closed: bool,
}

impl std::fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.path)
            .field("upload_id", &self.upload_id)
            .field("bytes_written", &self.bytes_written)
            .field("parts_sealed", &self.parts_sealed)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Bucket {
    /// Open a streaming upload to the object at `path`.
    ///
    /// `headers` are forwarded on the initiate request and on single-PUT
    /// fast paths, for options like server-side encryption or custom
    /// metadata. A multipart upload is initiated immediately; streams
    /// that fit one part are uploaded with a plain PUT on close and the
    /// multipart upload is released.
    pub async fn put_writer(&self, path: &str, headers: HeaderMap) -> Result<ObjectWriter> {
        ObjectWriter::open(self.clone(), path.to_string(), headers).await
    }
}

impl ObjectWriter {
    pub(crate) async fn open(bucket: Bucket, path: String, headers: HeaderMap) -> Result<Self> {
        let config = bucket.config().clone();
        let part_size = config.part_size.max(1);
        let concurrency = config.concurrency.max(1);
        let n_try = config.n_try.max(1);

        let url = bucket.object_url(&path)?;
        let mut init_url = url.clone();
        init_url.set_query(Some("uploads"));
        let resp = bucket
            .retry_request(Method::POST, init_url, Some(&headers), None)
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(service_error(resp).await);
        }
        let body = resp.bytes().await.map_err(SluiceError::from)?;
        let upload_id = parse_upload_id(&body)?;
        debug!(%upload_id, path, "multipart upload initiated");

        let pool = BufferPool::new(part_size as usize, concurrency + POOL_HEADROOM);
        let (quit_tx, _) = broadcast::channel(1);
        let shared = Arc::new(PutShared {
            err: Mutex::new(None),
            completed: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            pool,
            quit_tx,
        });

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Part>(1);
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        let (done_tx, done_rx) = mpsc::unbounded_channel::<PartDone>();

        for _ in 0..concurrency {
            tokio::spawn(worker(
                bucket.clone(),
                Arc::clone(&shared),
                url.clone(),
                upload_id.clone(),
                Arc::clone(&dispatch_rx),
                done_tx.clone(),
                n_try,
            ));
        }

        Ok(Self {
            bucket,
            path,
            url,
            headers,
            upload_id,
            shared,
            dispatch_tx: Some(dispatch_tx),
            done_rx,
            current: None,
            part_size,
            parts_sealed: 0,
            bytes_written: 0,
            md5: config.md5_check.then(md5::Context::new),
            closed: false,
        })
    }

    pub(crate) fn shared(&self) -> Arc<PutShared> {
        Arc::clone(&self.shared)
    }

    /// Total bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append `src` to the stream.
    ///
    /// Seals and dispatches a part whenever the current buffer fills;
    /// blocks on the buffer pool when too many parts are outstanding.
    pub async fn write(&mut self, src: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(SluiceError::AlreadyClosed);
        }
        if let Some(e) = self.shared.sticky() {
            return Err(e);
        }

        let mut rest = src;
        while !rest.is_empty() {
            if self.current.is_none() {
                if let Some(grown) = grown_part_size(self.parts_sealed, self.part_size) {
                    debug!(
                        parts = self.parts_sealed,
                        part_size = grown,
                        "growing part size"
                    );
                    self.part_size = grown;
                    self.shared.pool.retarget(grown as usize);
                }
                let buf = self.shared.pool.acquire().await.map_err(|_| {
                    self.shared.sticky().unwrap_or(SluiceError::PoolClosed)
                })?;
                self.current = Some(buf);
            }

            let cap = self.part_size as usize;
            let (take, remainder) = {
                let room = match self.current.as_ref() {
                    Some(buf) => cap.saturating_sub(buf.len()),
                    None => 0,
                };
                rest.split_at(room.min(rest.len()))
            };
            if let Some(buf) = self.current.as_mut() {
                buf.extend_from_slice(take);
            }
            if let Some(md5) = self.md5.as_mut() {
                md5.consume(take);
            }
            self.bytes_written += take.len() as u64;
            rest = remainder;

            let full = self
                .current
                .as_ref()
                .map(|buf| buf.len() >= cap)
                .unwrap_or(false);
            if full {
                self.seal_part().await?;
            }
        }
        Ok(src.len())
    }

    /// Seal the buffered part and hand it to a worker
    async fn seal_part(&mut self) -> Result<()> {
        let Some(buf) = self.current.take() else {
            return Ok(());
        };
        if buf.is_empty() {
            self.shared.pool.release(buf);
            return Ok(());
        }
        let number = self.parts_sealed + 1;
        if number > MAX_PARTS {
            return Err(SluiceError::PartLimitExceeded {
                number,
                limit: MAX_PARTS,
            });
        }

        let handle = TrackHandle::new();
        self.shared.active.lock().insert(number, handle.clone());
        let part = Part {
            number,
            data: buf.freeze(),
            handle,
        };
        self.parts_sealed = number;

        let Some(tx) = self.dispatch_tx.as_ref() else {
            return Err(SluiceError::AlreadyClosed);
        };
        if tx.send(part).await.is_err() {
            return Err(self.shared.sticky().unwrap_or(SluiceError::Internal {
                message: "part workers exited early".to_string(),
            }));
        }
        Ok(())
    }

    /// Finish the upload and tear the pipeline down.
    ///
    /// A second close is an error. Whenever the multipart upload did not
    /// complete, its abort request is issued before returning.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(SluiceError::AlreadyClosed);
        }
        self.closed = true;
        let result = self.finish().await;
        self.shared.close_pool();
        self.shared.quit();
        result
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(e) = self.shared.sticky() {
            self.abort().await;
            return Err(e);
        }

        if self.parts_sealed == 0 {
            // the whole stream fit in one buffer: plain PUT, then release
            // the multipart upload we never used
            let data = self
                .current
                .take()
                .map(BytesMut::freeze)
                .unwrap_or_else(Bytes::new);
            let single = self.put_single(data).await;
            self.abort().await;
            single?;
        } else if let Err(e) = self.complete_multipart().await {
            self.abort().await;
            return Err(e);
        }

        if self.md5.is_some() {
            self.write_md5_sidecar().await?;
        }
        Ok(())
    }

    async fn complete_multipart(&mut self) -> Result<()> {
        self.seal_part().await?;
        // closing the dispatch side lets idle workers drain and exit
        self.dispatch_tx = None;

        let total = self.parts_sealed as usize;
        let mut parts: Vec<PartDone> = Vec::with_capacity(total);
        while parts.len() < total {
            match self.done_rx.recv().await {
                Some(done) => parts.push(done),
                None => {
                    return Err(self.shared.sticky().unwrap_or(SluiceError::Internal {
                        message: "part workers exited before completion".to_string(),
                    }))
                }
            }
        }
        parts.sort_by_key(|p| p.number);

        let xml = complete_xml(&parts);
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("uploadId", &self.upload_id);
        debug!(parts = total, "completing multipart upload");

        let resp = self
            .bucket
            .retry_request(Method::POST, url, None, Some(Bytes::from(xml)))
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(service_error(resp).await);
        }
        Ok(())
    }

    async fn put_single(&self, data: Bytes) -> Result<()> {
        debug!(bytes = data.len(), path = %self.path, "single-part upload");
        let resp = self
            .bucket
            .retry_request(
                Method::PUT,
                self.url.clone(),
                Some(&self.headers),
                Some(data),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(service_error(resp).await);
        }
        Ok(())
    }

    /// Release the multipart upload; failure is logged, never surfaced
    async fn abort(&self) {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("uploadId", &self.upload_id);
        match self.bucket.retry_request(Method::DELETE, url, None, None).await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                status = resp.status().as_u16(),
                upload_id = %self.upload_id,
                "failed to abort multipart upload"
            ),
            Err(e) => warn!(
                error = %e,
                upload_id = %self.upload_id,
                "failed to abort multipart upload"
            ),
        }
    }

    async fn write_md5_sidecar(&mut self) -> Result<()> {
        let Some(ctx) = self.md5.take() else {
            return Ok(());
        };
        let digest = format!("{:x}", ctx.compute());
        let url = self.bucket.object_url(&md5_sidecar_path(&self.path))?;
        debug!(%digest, path = %self.path, "writing md5 sidecar");
        let resp = self
            .bucket
            .retry_request(Method::PUT, url, None, Some(Bytes::from(digest)))
            .await?;
        if !resp.status().is_success() {
            return Err(service_error(resp).await);
        }
        Ok(())
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        self.shared.close_pool();
        self.shared.quit();
    }
}

/// Part size after sealing `parts_sealed` parts, when a growth point
/// was just crossed. Doubles every `GROWTH_INTERVAL` parts up to the
/// per-part ceiling, which keeps the part-count limit unreachable for
/// any practical stream length.
fn grown_part_size(parts_sealed: u32, current: u64) -> Option<u64> {
    if parts_sealed == 0 || parts_sealed % GROWTH_INTERVAL != 0 {
        return None;
    }
    if current >= MAX_PART_SIZE {
        return None;
    }
    Some((current * 2).min(MAX_PART_SIZE))
}

/// Worker: upload dispatched parts until the writer stops sealing
async fn worker(
    bucket: Bucket,
    shared: Arc<PutShared>,
    url: Url,
    upload_id: String,
    dispatch: Arc<tokio::sync::Mutex<mpsc::Receiver<Part>>>,
    done: mpsc::UnboundedSender<PartDone>,
    n_try: u32,
) {
    let mut quit = shared.quit_tx.subscribe();
    loop {
        let part = {
            let mut rx = dispatch.lock().await;
            tokio::select! {
                next = rx.recv() => match next {
                    Some(part) => part,
                    None => return,
                },
                _ = quit.recv() => return,
            }
        };

        match upload_part(&bucket, &shared, &url, &upload_id, &part, n_try).await {
            Ok(etag) => {
                shared
                    .completed
                    .fetch_add(part.data.len() as u64, Ordering::Relaxed);
                shared.active.lock().remove(&part.number);
                let number = part.number;
                // recycle the buffer when the body stream released its refs
                match part.data.try_into_mut() {
                    Ok(buf) => shared.pool.release(buf),
                    Err(_) => shared.pool.forfeit(),
                }
                if done.send(PartDone { number, etag }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(part = part.number, error = %e, "part permanently failed");
                shared.active.lock().remove(&part.number);
                shared.pool.forfeit();
                shared.set_sticky(e);
                shared.quit();
                return;
            }
        }
    }
}

/// One part PUT with retry; the tracked body is rebuilt per attempt
async fn upload_part(
    bucket: &Bucket,
    shared: &PutShared,
    url: &Url,
    upload_id: &str,
    part: &Part,
    n_try: u32,
) -> Result<String> {
    let mut last: Option<SluiceError> = None;
    for attempt in 0..n_try {
        if part.handle.is_closed() {
            return Err(shared.sticky().unwrap_or(SluiceError::Stopped));
        }
        part.handle.reset();

        let mut part_url = url.clone();
        part_url
            .query_pairs_mut()
            .clear()
            .append_pair("partNumber", &part.number.to_string())
            .append_pair("uploadId", upload_id);

        let mut request = reqwest::Request::new(Method::PUT, part_url);
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(part.data.len() as u64));
        *request.body_mut() = Some(reqwest::Body::wrap_stream(TrackedBody::new(
            part.data.clone(),
            part.handle.clone(),
        )));

        match bucket.send(request).await {
            Ok(resp) if resp.status().is_success() => {
                match resp.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
                    Some(etag) if !etag.is_empty() => return Ok(etag.to_string()),
                    _ => {
                        last = Some(SluiceError::Internal {
                            message: format!("part {} response missing etag", part.number),
                        });
                    }
                }
            }
            Ok(resp) => {
                let e = service_error(resp).await;
                warn!(part = part.number, attempt, error = %e, "part upload failed");
                let retryable = e.is_retryable();
                last = Some(e);
                if !retryable {
                    break;
                }
            }
            Err(e) => {
                warn!(part = part.number, attempt, error = %e, "part upload failed");
                last = Some(e);
            }
        }
        tokio::time::sleep(Duration::from_millis(100u64 << attempt)).await;
    }
    Err(last.unwrap_or(SluiceError::Internal {
        message: format!("part {} upload failed", part.number),
    }))
}

fn parse_upload_id(body: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(body).map_err(|e| SluiceError::Internal {
        message: format!("non-utf8 initiate response: {e}"),
    })?;
    let mut reader = quick_xml::Reader::from_str(text);
    let mut in_upload_id = false;
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(start)) => {
                in_upload_id = start.name().as_ref() == b"UploadId";
            }
            Ok(quick_xml::events::Event::End(_)) => in_upload_id = false,
            Ok(quick_xml::events::Event::Text(t)) if in_upload_id => {
                let value = t
                    .unescape()
                    .map_err(|e| SluiceError::Internal {
                        message: format!("malformed initiate response: {e}"),
                    })?
                    .trim()
                    .to_string();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(SluiceError::Internal {
                    message: format!("malformed initiate response: {e}"),
                })
            }
            _ => {}
        }
    }
    Err(SluiceError::Internal {
        message: "initiate response missing UploadId".to_string(),
    })
}

fn complete_xml(parts: &[PartDone]) -> String {
    let mut xml = String::with_capacity(48 + parts.len() * 96);
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        let _ = write!(
            xml,
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.number,
            quick_xml::escape::escape(part.etag.as_str())
        );
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}
