use std::io;

use thiserror::Error;

use crate::filter::Region;

/// Failures at the boundary with the filter service.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter service not found at {path}")]
    ServiceNotFound {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("filter service is busy, another controller is attached")]
    Busy,
    #[error("failed to open filter service: {0}")]
    Open(#[source] io::Error),
    #[error("failed to map {region}: {source}")]
    MapFailed {
        region: Region,
        #[source]
        source: io::Error,
    },
    #[error("failed to unmap {region}: {source}")]
    UnmapFailed {
        region: Region,
        #[source]
        source: io::Error,
    },
    #[error("failed to register notification waiter: {0}")]
    RegisterFailed(#[source] io::Error),
    #[error("filter call failed: {0}")]
    CallFailed(#[source] io::Error),
}

/// Failures of the notification queue and its wait primitive.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("notification queue closed")]
    Closed,
    #[error("waiting for queue data failed: {0}")]
    WaitFailed(#[source] io::Error),
    #[error("notification queue region of {len} bytes cannot hold a {capacity} byte ring")]
    RegionTooSmall { len: usize, capacity: u32 },
    #[error("corrupted queue entry at offset {offset}: size {size}")]
    Corrupted { offset: u32, size: u32 },
}

/// A single malformed record. The record is skipped and draining goes on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("record size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("buffer slot index {index} out of range, pool has {count} slots")]
    BufferIndexOutOfRange { index: u32, count: usize },
}

/// Errors that end a controller session.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}
