//! Async transfer controllers
//!
//! Wraps a pipeline with lifecycle state, smoothed speed estimation,
//! and cooperative cancellation. A supervisor task samples progress at
//! a human-sensible rate while a companion task drives the byte copy
//! between the pipeline and the caller's stream.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};

use crate::bucket::Bucket;
use crate::error::{Result, SluiceError};
use crate::stream::get::{GetShared, ObjectReader};
use crate::stream::put::{ObjectWriter, PutShared};
use crate::stream::speed::SpeedTracker;

/// Supervisor sampling period, roughly 24 updates per second
pub const LOOP_PERIOD: Duration = Duration::from_millis(40);

/// Copy-loop scratch buffer size
const COPY_BUF: usize = 64 * 1024;

/// Lifecycle state of a controlled transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Ready,
    Downloading,
    Uploading,
    Completed,
    Stopped,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Ready => "Ready",
            TransferState::Downloading => "Downloading",
            TransferState::Uploading => "Uploading",
            TransferState::Completed => "Completed",
            TransferState::Stopped => "Stopped",
            TransferState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Pipeline-side hooks the controller drives
pub(crate) trait PipelineShared: Send + Sync + 'static {
    fn bytes_done(&self) -> u64;
    /// Plant a sticky error and unwind every worker and in-flight body
    fn cancel(&self, err: SluiceError);
}

impl PipelineShared for GetShared {
    fn bytes_done(&self) -> u64 {
        GetShared::bytes_done(self)
    }

    fn cancel(&self, err: SluiceError) {
        self.set_sticky(err);
        self.force_close_active();
        self.close_pool();
        self.quit();
    }
}

impl PipelineShared for PutShared {
    fn bytes_done(&self) -> u64 {
        PutShared::bytes_done(self)
    }

    fn cancel(&self, err: SluiceError) {
        self.set_sticky(err);
        self.force_close_active();
        self.close_pool();
        self.quit();
    }
}

struct ControlInner {
    state: Mutex<TransferState>,
    reason: Mutex<Option<String>>,
    speed: Mutex<SpeedTracker>,
    latched: AtomicU64,
    done_tx: watch::Sender<bool>,
    cancel_tx: broadcast::Sender<()>,
}

impl ControlInner {
    fn new() -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        let (cancel_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            state: Mutex::new(TransferState::Ready),
            reason: Mutex::new(None),
            speed: Mutex::new(SpeedTracker::new()),
            latched: AtomicU64::new(0),
            done_tx,
            cancel_tx,
        })
    }

    fn is_terminal(&self) -> bool {
        matches!(
            *self.state.lock(),
            TransferState::Completed | TransferState::Stopped | TransferState::Failed
        )
    }

    /// Byte count that never regresses across calls while live
    fn bytes_done(&self, pipeline: &dyn PipelineShared) -> u64 {
        let raw = pipeline.bytes_done();
        let prev = self.latched.fetch_max(raw, Ordering::Relaxed);
        prev.max(raw)
    }

    /// Record the terminal state; first caller wins
    fn complete(&self, result: &Result<()>) {
        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                TransferState::Completed | TransferState::Stopped | TransferState::Failed
            ) {
                return;
            }
            *state = match result {
                Ok(()) => TransferState::Completed,
                Err(SluiceError::Stopped) => TransferState::Stopped,
                Err(_) => TransferState::Failed,
            };
        }
        if let Err(e) = result {
            *self.reason.lock() = Some(e.to_string());
        }
        self.speed.lock().reset();
        let _ = self.cancel_tx.send(());
        let _ = self.done_tx.send(true);
    }

    async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Supervisor loop: sample progress into the speed tracker each tick
async fn supervise(
    inner: Arc<ControlInner>,
    pipeline: Arc<dyn PipelineShared>,
    active_state: TransferState,
) {
    {
        let mut state = inner.state.lock();
        if *state == TransferState::Ready {
            *state = active_state;
        }
    }
    let mut cancel = inner.cancel_tx.subscribe();
    let mut ticker = tokio::time::interval(LOOP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.recv() => return,
            _ = ticker.tick() => {
                if inner.is_terminal() {
                    return;
                }
                let bytes = inner.bytes_done(pipeline.as_ref());
                inner.speed.lock().update(bytes);
            }
        }
    }
}

macro_rules! controller_common {
    () => {
        /// Resolves once the transfer has reached a terminal state
        pub async fn done(&self) {
            self.inner.wait_done().await
        }

        /// Bytes moved so far, including in-flight part progress
        pub fn bytes_done(&self) -> u64 {
            self.inner.bytes_done(self.pipeline.as_ref())
        }

        /// Smoothed transfer rate in bytes per second; 0 once terminal
        pub fn speed(&self) -> u64 {
            if self.inner.is_terminal() {
                return 0;
            }
            self.inner.speed.lock().speed()
        }

        /// Current lifecycle state
        pub fn state(&self) -> TransferState {
            *self.inner.state.lock()
        }

        /// Cause of the terminal state, when it was not a clean completion
        pub fn reason(&self) -> Option<String> {
            self.inner.reason.lock().clone()
        }

        /// Cooperatively cancel the transfer and wait for workers to unwind.
        ///
        /// Safe to call at any point, including after completion.
        pub async fn stop(&self) {
            self.pipeline.cancel(SluiceError::Stopped);
            self.done().await;
        }
    };
}

/// Controller over a parallel download feeding an `AsyncWrite` sink
pub struct DownloadController {
    inner: Arc<ControlInner>,
    pipeline: Arc<dyn PipelineShared>,
    size: u64,
    headers: HeaderMap,
}

impl DownloadController {
    pub(crate) fn launch<W>(mut reader: ObjectReader, mut sink: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inner = ControlInner::new();
        let shared = reader.shared();
        let size = reader.content_length();
        let headers = reader.headers().clone();
        let pipeline: Arc<dyn PipelineShared> = shared;

        tokio::spawn(supervise(
            Arc::clone(&inner),
            Arc::clone(&pipeline),
            TransferState::Downloading,
        ));

        let control = Arc::clone(&inner);
        tokio::spawn(async move {
            let copied = copy_down(&mut reader, &mut sink).await;
            let closed = reader.close().await;
            control.complete(&copied.and(closed));
        });

        Self {
            inner,
            pipeline,
            size,
            headers,
        }
    }

    controller_common!();

    /// Object size from the initial response's content length
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Headers from the initial object response
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Controller over a parallel upload fed from an `AsyncRead` source
pub struct UploadController {
    inner: Arc<ControlInner>,
    pipeline: Arc<dyn PipelineShared>,
}

impl UploadController {
    pub(crate) fn launch<R>(mut writer: ObjectWriter, mut source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = ControlInner::new();
        let pipeline: Arc<dyn PipelineShared> = writer.shared();

        tokio::spawn(supervise(
            Arc::clone(&inner),
            Arc::clone(&pipeline),
            TransferState::Uploading,
        ));

        let control = Arc::clone(&inner);
        tokio::spawn(async move {
            let copied = copy_up(&mut writer, &mut source).await;
            let closed = writer.close().await;
            control.complete(&copied.and(closed));
        });

        Self { inner, pipeline }
    }

    controller_common!();
}

impl Bucket {
    /// Download `path` into `sink` under a controller
    pub async fn get_to_writer<W>(&self, path: &str, sink: W) -> Result<DownloadController>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader = self.get_reader(path).await?;
        Ok(DownloadController::launch(reader, sink))
    }

    /// Upload `source` to `path` under a controller
    pub async fn put_from_reader<R>(
        &self,
        path: &str,
        headers: HeaderMap,
        source: R,
    ) -> Result<UploadController>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let writer = self.put_writer(path, headers).await?;
        Ok(UploadController::launch(writer, source))
    }
}

async fn copy_down<W>(reader: &mut ObjectReader, sink: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])
            .await
            .map_err(|e| SluiceError::Transport {
                message: format!("sink write failed: {e}"),
            })?;
    }
    sink.flush().await.map_err(|e| SluiceError::Transport {
        message: format!("sink flush failed: {e}"),
    })?;
    Ok(())
}

async fn copy_up<R>(writer: &mut ObjectWriter, source: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = source.read(&mut buf).await.map_err(|e| SluiceError::Transport {
            message: format!("source read failed: {e}"),
        })?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
    }
    Ok(())
}
