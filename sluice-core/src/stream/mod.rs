//! Streaming transfer pipelines
//!
//! The concurrency engine: parallel ranged GETs behind an ordered
//! reader, parallel part PUTs in front of a sequential writer, and the
//! buffer, tracking, and rate primitives they share.

pub mod get;
pub mod pool;
pub mod put;
pub mod speed;
pub mod track;

pub use get::ObjectReader;
pub use pool::BufferPool;
pub use put::ObjectWriter;
pub use speed::SpeedTracker;
pub use track::{TrackHandle, TrackedBody, TrackedReader};
