//! A file-backed, segmented write-ahead log for opaque byte records.
//!
//! A single [`wal::Wal`] appends length-prefixed records to numbered
//! segment files in one directory, rolling to a fresh segment once the
//! active one reaches its size limit. Any number of independent
//! [`Reader`]s tail the log concurrently, each observing every record
//! once, in write order, blocking while they are caught up.
//!
//! # Features
//!
//! - **Segmented** – segments are named by their creation time in
//!   microseconds; a zero-length sentinel frame marks each segment's
//!   logical end and rollover happens automatically at the size limit.
//! - **Tailing readers** – [`Reader::read`] blocks on the live segment
//!   and transparently crosses into newer segments as the writer rolls
//!   over.
//! - **Retention** – [`wal::Wal::truncate_before`] drops old segments
//!   wholesale; [`wal::Wal::compress_before`] rewrites them through the
//!   streaming Snappy compressor while readers keep their positions.
//! - **Recoverable** – reopening a directory seals whatever a crashed
//!   writer left behind, so readers resume cleanly from any previously
//!   recorded [`Offset`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//! use tailwal::wal::Wal;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Sync to disk once a second; a zero interval syncs every write.
//!     let wal = Wal::open(PathBuf::from("./wal_data"), Duration::from_secs(1)).await?;
//!
//!     wal.write(&[b"hello world"]).await?;
//!
//!     // Tail the log from the start; `read` blocks for the next record.
//!     let mut reader = wal.new_reader(None).await?;
//!     let record = reader.read().await?;
//!     assert_eq!(record, b"hello world");
//!
//!     // Shrink or reclaim everything this reader is done with.
//!     let offset = reader.offset();
//!     wal.compress_before(offset).await?;
//!     wal.truncate_before(offset).await?;
//!
//!     wal.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Resuming
//!
//! [`Reader::offset`] returns an opaque [`Offset`] after each read.
//! Persist it anywhere; a reader constructed later with that offset
//! continues with the record that follows, across restarts, rollovers,
//! compression and truncation of older segments.

#[cfg(test)]
mod tests;

mod reader;
mod segment;
mod types;
pub mod wal;
mod writer;

pub use reader::Reader;
pub use types::*;
