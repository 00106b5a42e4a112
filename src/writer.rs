use crate::{
    segment::{new_file_sequence, sequence_to_filename},
    types::{FILE_BUFFER_SIZE, SENTINEL, WalError},
    wal::Wal,
};
use log::{debug, error};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// The writer's half of the log: the open segment file, its sequence, and
/// the byte position inside the segment's frame stream.
pub(crate) struct WalFile {
    dir: PathBuf,
    pub(crate) buffer: BufWriter<File>,
    pub(crate) file_sequence: i64,
    pub(crate) position: i64,
    pub(crate) poisoned: bool,
}

impl WalFile {
    pub(crate) async fn create(dir: PathBuf) -> Result<Self, WalError> {
        let file_sequence = new_file_sequence();
        let buffer = Self::open_write(&dir, file_sequence).await?;
        Ok(Self {
            dir,
            buffer,
            file_sequence,
            position: 0,
            poisoned: false,
        })
    }

    async fn open_write(dir: &Path, file_sequence: i64) -> Result<BufWriter<File>, WalError> {
        let path = dir.join(sequence_to_filename(file_sequence));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                WalError::General(format!("Failed to open segment '{}': {e}", path.display()))
            })?;
        Ok(BufWriter::with_capacity(FILE_BUFFER_SIZE, file))
    }

    /// Moves the writer onto a fresh segment: next sequence, position zero,
    /// new buffered file. The `+ 1` floor keeps sequences strictly
    /// increasing when two rollovers land in the same microsecond.
    pub(crate) async fn advance(&mut self) -> Result<(), WalError> {
        let next = new_file_sequence().max(self.file_sequence + 1);
        self.buffer = Self::open_write(&self.dir, next).await?;
        self.file_sequence = next;
        self.position = 0;
        Ok(())
    }

    /// Flush buffered frames and fsync the segment. Errors are logged and
    /// swallowed; there is nowhere to surface them from the sync task.
    pub(crate) async fn do_sync(&mut self) {
        if let Err(e) = self.buffer.flush().await {
            error!("Unable to flush wal: {e}");
            return;
        }
        if let Err(e) = self.buffer.get_ref().sync_data().await {
            error!("Unable to sync wal: {e}");
        }
    }
}

impl Wal {
    /// Atomically appends the concatenation of `bufs` as a single record.
    ///
    /// Returns the total number of bytes appended, including the 4-byte
    /// length prefix. Appending zero total bytes is a no-op returning 0.
    /// Appends are serialized; when the segment reaches its size limit the
    /// record is sealed with a sentinel and the writer rolls over.
    pub async fn write<B: AsRef<[u8]>>(&self, bufs: &[B]) -> Result<usize, WalError> {
        let mut wal_file = self.file.lock().await;

        if wal_file.poisoned {
            return Err(WalError::General(
                "wal writer is closed or disabled by an earlier write failure".to_string(),
            ));
        }

        let length: usize = bufs.iter().map(|b| b.as_ref().len()).sum();
        if length == 0 {
            return Ok(0);
        }
        let length = u32::try_from(length).map_err(|_| {
            WalError::General(format!("record of {length} bytes exceeds the frame size limit"))
        })?;

        let mut frame = Vec::with_capacity(4 + length as usize);
        frame.extend_from_slice(&length.to_be_bytes());
        for b in bufs {
            frame.extend_from_slice(b.as_ref());
        }

        if let Err(e) = wal_file.buffer.write_all(&frame).await {
            // The buffered stream is in an unknown state now; refuse
            // further appends.
            wal_file.poisoned = true;
            return Err(WalError::General(format!("Failed to append record: {e}")));
        }
        wal_file.position += frame.len() as i64;

        if self.sync_immediate {
            wal_file.do_sync().await;
        }

        if wal_file.position >= self.max_segment_size {
            // Sentinel marks logical end of segment before rolling over.
            if let Err(e) = wal_file.buffer.write_all(&SENTINEL).await {
                wal_file.poisoned = true;
                return Err(WalError::General(format!(
                    "Failed to write end-of-segment marker: {e}"
                )));
            }
            if let Err(e) = wal_file.buffer.flush().await {
                wal_file.poisoned = true;
                return Err(WalError::General(format!(
                    "Failed to flush segment before rollover: {e}"
                )));
            }
            let sealed = wal_file.file_sequence;
            wal_file.advance().await?;
            debug!("wal rollover: segment {} -> {}", sealed, wal_file.file_sequence);
            self.publish_sequence(wal_file.file_sequence);
        }

        Ok(frame.len())
    }

    /// Flushes and fsyncs outstanding writes, then stops the background
    /// sync task. The first failure in flush, sync order is returned; the
    /// file handle itself is released when the `Wal` is dropped. The
    /// writer refuses further appends after `close`.
    pub async fn close(&self) -> Result<(), WalError> {
        let _ = self.shutdown_tx.send(true);

        let mut wal_file = self.file.lock().await;
        let flush_res = wal_file.buffer.flush().await;
        let sync_res = wal_file.buffer.get_ref().sync_data().await;
        wal_file.poisoned = true;

        flush_res
            .map_err(|e| WalError::General(format!("Failed to flush wal on close: {e}")))?;
        sync_res.map_err(|e| WalError::General(format!("Failed to sync wal on close: {e}")))?;
        Ok(())
    }
}
