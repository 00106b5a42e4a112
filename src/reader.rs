use crate::{
    segment::{filename_to_sequence, list_sorted_filenames, sequence_to_filename},
    types::{COMPRESSED_SUFFIX, FILE_BUFFER_SIZE, Offset, POLL_INTERVAL, WalError},
};
use log::{debug, error};
use snap::read::FrameDecoder;
use std::io::Read;
use std::path::PathBuf;
use tokio::sync::watch;

/// A tailing reader over the log directory.
///
/// Each reader owns its own file handle and buffering and is NOT safe for
/// use from multiple tasks; open one reader per consumer instead. Readers
/// follow the writer across segment rollovers and keep working while
/// older segments are compressed or truncated underneath them.
pub struct Reader {
    dir: PathBuf,
    file_sequence: i64,
    position: i64,
    segment: Option<Box<dyn Read + Send>>,
    writer_sequence: watch::Receiver<i64>,
}

impl Reader {
    pub(crate) async fn new(
        dir: PathBuf,
        writer_sequence: watch::Receiver<i64>,
        offset: Option<Offset>,
    ) -> Result<Self, WalError> {
        let mut r = Reader {
            dir,
            file_sequence: 0,
            position: 0,
            segment: None,
            writer_sequence,
        };

        if let Some(given) = offset {
            let mut offset = given;
            if !sequence_to_filename(offset.file_sequence()).starts_with('0') {
                // Offsets from older producers carry nanosecond sequences.
                debug!("Converting legacy offset {offset}");
                offset = Offset::new(offset.file_sequence() / 1000, offset.position());
            }

            let files = list_sorted_filenames(&r.dir)?;
            let cutoff = sequence_to_filename(offset.file_sequence());
            for name in &files {
                if name.as_str() >= cutoff.as_str() {
                    // The exact segment, or the first one after it.
                    r.file_sequence = filename_to_sequence(name);
                    r.position = if r.file_sequence == offset.file_sequence() {
                        offset.position()
                    } else {
                        0
                    };
                    r.open()?;
                    break;
                }
            }
        }

        if r.segment.is_none() {
            r.advance().await?;
            debug!(
                "Replaying log starting at {}",
                sequence_to_filename(r.file_sequence)
            );
        }
        Ok(r)
    }

    /// Returns the next record's payload, blocking until one is available.
    ///
    /// There is no end-of-log signal: a fully caught-up reader is
    /// indistinguishable from one waiting on an idle writer, and polls
    /// every 50 ms. Callers wanting bounded reads should impose their own
    /// timeout.
    pub async fn read(&mut self) -> Result<Vec<u8>, WalError> {
        'record: loop {
            // Length prefix. A zero length is the end-of-segment sentinel.
            let mut len_buf = [0u8; 4];
            let length = loop {
                let mut filled = 0usize;
                let mut failed = false;
                while filled < 4 {
                    match self.read_chunk(&mut len_buf[filled..]) {
                        Ok(0) => {
                            // Nothing beyond the last full frame yet; the
                            // writer may still be appending here.
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                        Ok(n) => {
                            filled += n;
                            self.position += n as i64;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!(
                                "Unexpected error reading length from segment {}: {e}",
                                sequence_to_filename(self.file_sequence)
                            );
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    let length = u32::from_be_bytes(len_buf) as usize;
                    if length > 0 {
                        break length;
                    }
                }
                self.advance().await?;
            };

            // Payload.
            let mut payload = vec![0u8; length];
            let mut filled = 0usize;
            while filled < length {
                match self.read_chunk(&mut payload[filled..]) {
                    Ok(0) => {
                        if self.writer_moved_beyond(self.file_sequence) {
                            error!(
                                "Out of data at position {} of segment {} and the writer has moved on; assuming the segment is corrupted, advancing",
                                self.position,
                                sequence_to_filename(self.file_sequence)
                            );
                            self.advance().await?;
                            continue 'record;
                        }
                        // Still the active segment; the record is being
                        // assembled.
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Ok(n) => {
                        filled += n;
                        self.position += n as i64;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(
                            "Unexpected error reading record from segment {}: {e}",
                            sequence_to_filename(self.file_sequence)
                        );
                        continue 'record;
                    }
                }
            }

            return Ok(payload);
        }
    }

    /// The furthest point this reader has consumed. Feed it back into
    /// [`crate::wal::Wal::new_reader`] to resume, or into the retention
    /// sweeps to reclaim everything before it. Do not call while a
    /// [`Reader::read`] is in flight.
    pub fn offset(&self) -> Offset {
        Offset::new(self.file_sequence, self.position)
    }

    /// Releases the underlying segment file. Dropping the reader has the
    /// same effect.
    pub fn close(self) {}

    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.segment.as_mut() {
            Some(segment) => segment.read(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no open segment",
            )),
        }
    }

    fn writer_moved_beyond(&self, file_sequence: i64) -> bool {
        *self.writer_sequence.borrow() > file_sequence
    }

    /// Polls the directory until a segment with a strictly greater
    /// sequence exists, then opens it at position zero.
    async fn advance(&mut self) -> Result<(), WalError> {
        loop {
            let files = list_sorted_filenames(&self.dir)?;
            let cutoff = sequence_to_filename(self.file_sequence);
            for name in &files {
                let seq = filename_to_sequence(name);
                if seq == self.file_sequence {
                    // Raw/compressed twin of the segment we are leaving,
                    // ignore.
                    continue;
                }
                if name.as_str() > cutoff.as_str() {
                    // Sorted by name; the first match is the next segment.
                    self.position = 0;
                    self.file_sequence = seq;
                    return self.open();
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn open(&mut self) -> Result<(), WalError> {
        let raw_path = self.dir.join(sequence_to_filename(self.file_sequence));
        let (file, compressed) = match std::fs::File::open(&raw_path) {
            Ok(file) => (file, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let twin_path = self.dir.join(format!(
                    "{}{COMPRESSED_SUFFIX}",
                    sequence_to_filename(self.file_sequence)
                ));
                let file = std::fs::File::open(&twin_path).map_err(|e| {
                    WalError::General(format!(
                        "Unable to open segment '{}': {e}",
                        twin_path.display()
                    ))
                })?;
                (file, true)
            }
            Err(e) => {
                return Err(WalError::General(format!(
                    "Unable to open segment '{}': {e}",
                    raw_path.display()
                )));
            }
        };

        let buffered = std::io::BufReader::with_capacity(FILE_BUFFER_SIZE, file);
        let mut segment: Box<dyn Read + Send> = if compressed {
            Box::new(FrameDecoder::new(buffered))
        } else {
            Box::new(buffered)
        };

        if self.position > 0 {
            // Discard up to the requested position. Seeking the file would
            // be wrong for compressed segments, where the recorded
            // position does not correspond to a file offset.
            let want = self.position as u64;
            let skipped = std::io::copy(&mut segment.by_ref().take(want), &mut std::io::sink())
                .map_err(|e| {
                    WalError::General(format!(
                        "Unable to skip to position {} in segment {}: {e}",
                        self.position,
                        sequence_to_filename(self.file_sequence)
                    ))
                })?;
            if skipped < want {
                return Err(WalError::OffsetOutOfRange(format!(
                    "segment {} holds {skipped} readable bytes, position {} requested",
                    sequence_to_filename(self.file_sequence),
                    self.position
                )));
            }
        }

        self.segment = Some(segment);
        Ok(())
    }
}
