//! Error types for Sluice
//!
//! Covers transport failures, structured S3 error responses, pipeline
//! protocol violations, integrity failures, and lifecycle misuse.

use std::fmt;

use thiserror::Error;

/// Primary error type for all Sluice operations
#[derive(Debug, Error, Clone)]
pub enum SluiceError {
    // ========== Transport / service ==========
    /// Network-level failure: connect, timeout, reset, body stream error
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Non-2xx response with the parsed S3 error document
    #[error("{0}")]
    Service(ServiceError),

    /// HEAD on a key that is not present
    #[error("Object does not exist")]
    ObjectNotExist,

    // ========== Protocol ==========
    /// GET response carried no usable Content-Length (chunked transfer)
    #[error("retrieving objects with undefined content-length responses (chunked transfer encoding) is not supported")]
    UnknownContentLength,

    /// A ranged GET delivered the wrong number of bytes for its chunk
    #[error("chunk {id}: expected {expected} bytes, received {received}")]
    SizeMismatch { id: u64, expected: u64, received: u64 },

    /// The stream ended before the full object was delivered
    #[error("read error: {received} bytes read. expected: {expected}")]
    ShortRead { expected: u64, received: u64 },

    /// More bytes surfaced than the object's content length
    #[error("expected {expected} bytes, received {received} (too many bytes)")]
    TooManyBytes { expected: u64, received: u64 },

    /// Reader ran out of chunks with bytes still owed
    #[error("expected {expected} bytes, received {received} and chunk {next} >= chunk total {total} (no more chunks remaining)")]
    OutOfChunks {
        expected: u64,
        received: u64,
        next: u64,
        total: u64,
    },

    /// Upload would exceed the multipart part-count ceiling
    #[error("part {number} exceeds the {limit}-part upload limit")]
    PartLimitExceeded { number: u32, limit: u32 },

    // ========== Integrity ==========
    /// Streamed bytes do not hash to the md5 sidecar contents
    #[error("MD5 mismatch. given:{given} calculated:{calculated}")]
    Md5Mismatch { given: String, calculated: String },

    /// The md5 sidecar object could not be fetched
    #[error("MD5 check failed: {url}: {message}")]
    Md5SidecarMissing { url: String, message: String },

    // ========== Lifecycle ==========
    /// Read, write, or a second close on an already-closed handle
    #[error("handle already closed")]
    AlreadyClosed,

    /// Cooperative cancellation sentinel
    #[error("Stopped")]
    Stopped,

    /// Buffer pool torn down while an acquire was pending
    #[error("buffer pool closed")]
    PoolClosed,

    /// Empty object path supplied to a bucket operation
    #[error("empty path requested")]
    EmptyPath,

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SluiceError {
    /// Returns true if a retry may succeed.
    ///
    /// Short chunk bodies count: a truncated read usually means the
    /// connection died mid-transfer, not that the range is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            SluiceError::Transport { .. } => true,
            SluiceError::SizeMismatch { .. } => true,
            SluiceError::Service(e) => e.status >= 500 || e.status == 408 || e.status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SluiceError {
    fn from(err: reqwest::Error) -> Self {
        SluiceError::Transport {
            message: err.to_string(),
        }
    }
}

/// Parsed S3 error response
///
/// See <http://docs.aws.amazon.com/AmazonS3/latest/API/ErrorResponses.html>
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub resource: String,
    pub request_id: String,
}

impl ServiceError {
    /// Parse an `<Error>` document from a response body.
    ///
    /// Malformed or empty bodies produce an error carrying only the status.
    pub fn from_xml(status: u16, body: &[u8]) -> Self {
        let mut e = ServiceError {
            status,
            ..Default::default()
        };
        let Ok(text) = std::str::from_utf8(body) else {
            return e;
        };
        let mut reader = quick_xml::Reader::from_str(text);
        let mut field = String::new();
        loop {
            match reader.read_event() {
                Ok(quick_xml::events::Event::Start(start)) => {
                    field = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                }
                Ok(quick_xml::events::Event::End(_)) => field.clear(),
                Ok(quick_xml::events::Event::Text(t)) => {
                    let value = match t.unescape() {
                        Ok(v) => v.trim().to_string(),
                        Err(_) => continue,
                    };
                    if value.is_empty() {
                        continue;
                    }
                    match field.as_str() {
                        "Code" => e.code = value,
                        "Message" => e.message = value,
                        "Resource" => e.resource = value,
                        "RequestId" => e.request_id = value,
                        _ => {}
                    }
                }
                Ok(quick_xml::events::Event::Eof) | Err(_) => break,
                _ => {}
            }
        }
        e
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.status, self.message)
    }
}

/// Result type alias for Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;
