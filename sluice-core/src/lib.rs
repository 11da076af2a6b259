//! Sluice Core - streaming parallel transfer engine for S3-compatible stores
//!
//! This crate provides high-throughput object transfer built from:
//! - Parallel ranged GETs reassembled into an ordered byte stream
//! - Multipart PUTs fed from a sequential writer
//! - Buffer pooling with bounded memory and backpressure
//! - Async controllers with lifecycle state, speed, and cancellation

pub mod bucket;
pub mod control;
pub mod error;
pub mod sign;
pub mod stream;

pub use bucket::{Bucket, Config, Endpoint, KeyContent, Listing};
pub use control::{DownloadController, TransferState, UploadController};
pub use error::{Result, ServiceError, SluiceError};
pub use sign::{AnonymousSigner, RequestSigner};
pub use stream::{ObjectReader, ObjectWriter};
