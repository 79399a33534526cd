use failure::Fail;
use std::io;

use crate::record::Offset;

/// Errors surfaced by a single cleaning run.
#[derive(Fail, Debug)]
pub enum CleanerError {
    /// The log was truncated while we held a stale `numberOfTruncates`.
    #[fail(
        display = "optimistic lock failure: log truncated during clean (expected truncate count {})",
        expected_truncate_count
    )]
    OptimisticLockFailure { expected_truncate_count: u32 },

    /// Shutdown was signaled while a worker was mid-run.
    #[fail(display = "cleaning cancelled")]
    Cancelled,

    /// A null key in a compacted log, or an impossible offset ordering.
    #[fail(display = "corrupt log: {}", _0)]
    CorruptLog(String),

    /// A single record exceeded `maxMessageSize` even after doubling the
    /// read buffer up to `maxIoBufferSize`.
    #[fail(display = "message at offset {} exceeds max message size", offset)]
    MessageTooLarge { offset: Offset },

    /// Disk read/write fault.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),

    /// `OffsetMap::put` was asked to insert a *new* key into a full map.
    /// Indicates the map-build early-stop logic did not honor the load
    /// factor; always a bug, never a recoverable condition.
    #[fail(display = "offset map is full")]
    MapFull,
}

impl From<io::Error> for CleanerError {
    fn from(err: io::Error) -> Self {
        CleanerError::Io(err)
    }
}

impl From<bincode::Error> for CleanerError {
    fn from(err: bincode::Error) -> Self {
        CleanerError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

pub type Result<T> = std::result::Result<T, CleanerError>;
