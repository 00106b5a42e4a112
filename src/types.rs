use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Suffix carried by segment files that have been rewritten through the
/// Snappy framed compressor.
pub const COMPRESSED_SUFFIX: &str = ".snappy";

pub(crate) const FILE_BUFFER_SIZE: usize = 65536;
pub(crate) const DEFAULT_MAX_SEGMENT_SIZE: i64 = 104_857_600;
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A zero-length frame. Marks the logical end of a segment; anything after
/// it in the file is ignored.
pub(crate) const SENTINEL: [u8; 4] = [0u8; 4];

#[derive(Error, Debug)]
pub enum WalError {
    #[error("General WAL error: {0}")]
    General(String),
    #[error("WAL offset out of range: {0}")]
    OffsetOutOfRange(String),
}

/// A point in the logical record stream: the segment a reader last read
/// from, and the byte position inside that segment's decoded frame stream.
///
/// Offsets are produced by [`crate::Reader::offset`] and consumed by
/// [`crate::wal::Wal::truncate_before`], [`crate::wal::Wal::compress_before`]
/// and [`crate::wal::Wal::new_reader`]. They are only meaningful for the log
/// directory that produced them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize,
    Deserialize,
)]
pub struct Offset {
    file_sequence: i64,
    position: i64,
}

impl Offset {
    pub fn new(file_sequence: i64, position: i64) -> Self {
        Self {
            file_sequence,
            position,
        }
    }

    /// The sequence number naming the segment file.
    pub fn file_sequence(&self) -> i64 {
        self.file_sequence
    }

    /// Byte position within the segment's decoded frame stream.
    pub fn position(&self) -> i64 {
        self.position
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.file_sequence, self.position)
    }
}
