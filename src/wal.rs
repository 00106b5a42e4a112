use crate::{
    reader::Reader,
    segment::{list_sorted_filenames, sequence_to_filename, ts_to_file_sequence},
    types::{COMPRESSED_SUFFIX, DEFAULT_MAX_SEGMENT_SIZE, FILE_BUFFER_SIZE, Offset, SENTINEL, WalError},
    writer::WalFile,
};
use log::debug;
use snap::write::FrameEncoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};

/// A segmented write-ahead log over a single directory.
///
/// One `Wal` owns the active segment. [`Wal::write`] may be called from
/// multiple tasks (appends are serialized internally), but a directory
/// must only ever have one live writer. Any number of independent
/// [`Reader`]s may tail the log concurrently; see [`Wal::new_reader`].
pub struct Wal {
    pub(crate) dir: PathBuf,
    pub(crate) max_segment_size: i64,
    pub(crate) sync_immediate: bool,
    pub(crate) file: Arc<Mutex<WalFile>>,
    pub(crate) seq_tx: watch::Sender<i64>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl Wal {
    /// Opens (or creates) a log in `dir`, force-syncing the active segment
    /// to disk every `sync_interval`. A zero `sync_interval` syncs on
    /// every write instead.
    ///
    /// Opening first seals every uncompressed segment already in the
    /// directory with a sentinel, so readers treat whatever a crashed
    /// writer left behind as a clean end of segment.
    pub async fn open(dir: PathBuf, sync_interval: Duration) -> Result<Self, WalError> {
        Self::open_with_segment_size(dir, sync_interval, DEFAULT_MAX_SEGMENT_SIZE).await
    }

    /// Like [`Wal::open`] with an explicit rollover threshold in bytes in
    /// place of the 100 MiB default.
    pub async fn open_with_segment_size(
        dir: PathBuf,
        sync_interval: Duration,
        max_segment_size: i64,
    ) -> Result<Self, WalError> {
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            WalError::General(format!("Failed to create WAL dir '{}': {e}", dir.display()))
        })?;
        append_sentinels(&dir).await?;

        let wal_file = WalFile::create(dir.clone()).await?;
        let (seq_tx, _) = watch::channel(wal_file.file_sequence);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let file = Arc::new(Mutex::new(wal_file));

        let sync_immediate = sync_interval.is_zero();
        if !sync_immediate {
            spawn_sync_task(Arc::clone(&file), sync_interval, shutdown_rx);
        }

        Ok(Self {
            dir,
            max_segment_size,
            sync_immediate,
            file,
            seq_tx,
            shutdown_tx,
        })
    }

    /// Creates an independent tailing reader.
    ///
    /// With `None` the reader starts at the oldest live segment. With an
    /// offset it resumes at that exact point, or at the beginning of the
    /// first newer segment when the named one is gone (truncated) or the
    /// offset predates retention.
    pub async fn new_reader(&self, offset: Option<Offset>) -> Result<Reader, WalError> {
        Reader::new(self.dir.clone(), self.seq_tx.subscribe(), offset).await
    }

    /// Removes every segment older than `offset`. The segment named by the
    /// offset survives, and the last (active) segment always survives even
    /// when the cutoff lies beyond it.
    pub async fn truncate_before(&self, offset: Offset) -> Result<(), WalError> {
        let files = list_sorted_filenames(&self.dir)?;
        let cutoff = sequence_to_filename(offset.file_sequence());
        for (i, name) in files.iter().enumerate() {
            if i == files.len() - 1 || name.as_str() >= cutoff.as_str() {
                // Sorted by name: past the cutoff, or at the last
                // (active) file.
                break;
            }
            let path = self.dir.join(name);
            tokio::fs::remove_file(&path).await.map_err(|e| {
                WalError::General(format!("Unable to remove segment '{}': {e}", path.display()))
            })?;
            debug!("Removed wal segment {}", path.display());
        }
        Ok(())
    }

    /// Removes every segment created before `ts`.
    pub async fn truncate_before_time(&self, ts: SystemTime) -> Result<(), WalError> {
        self.truncate_before(Offset::new(ts_to_file_sequence(ts), 0)).await
    }

    /// Rewrites every segment older than `offset` through the streaming
    /// Snappy compressor. The compressed twin decodes to the exact byte
    /// stream of its source, so reader positions keep their meaning; the
    /// raw file is removed only once the twin is complete. The active
    /// segment is never compressed.
    pub async fn compress_before(&self, offset: Offset) -> Result<(), WalError> {
        let files = list_sorted_filenames(&self.dir)?;
        let cutoff = sequence_to_filename(offset.file_sequence());
        for (i, name) in files.iter().enumerate() {
            if i == files.len() - 1 || name.as_str() >= cutoff.as_str() {
                break;
            }
            if name.ends_with(COMPRESSED_SUFFIX) {
                // Already compressed
                continue;
            }
            let in_path = self.dir.join(name);
            let out_path = self.dir.join(format!("{name}{COMPRESSED_SUFFIX}"));
            compress_segment(&in_path, &out_path)?;
            tokio::fs::remove_file(&in_path).await.map_err(|e| {
                WalError::General(format!(
                    "Unable to remove uncompressed segment '{}': {e}",
                    in_path.display()
                ))
            })?;
            debug!("Compressed wal segment {}", in_path.display());
        }
        Ok(())
    }

    /// Compresses every segment created before `ts`.
    pub async fn compress_before_time(&self, ts: SystemTime) -> Result<(), WalError> {
        self.compress_before(Offset::new(ts_to_file_sequence(ts), 0)).await
    }

    pub(crate) fn publish_sequence(&self, file_sequence: i64) {
        self.seq_tx.send_replace(file_sequence);
    }
}

/// Appends a sentinel to every uncompressed file in `dir`, bounding
/// whatever a previous writer left mid-frame. Readers sweeping an old
/// segment then hit a clean end-of-segment instead of trailing garbage.
/// Appending to an already-sealed segment is harmless: bytes after the
/// first sentinel are never read.
async fn append_sentinels(dir: &Path) -> Result<(), WalError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| WalError::General(format!("Unable to list existing log files: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WalError::General(format!("Unable to list existing log files: {e}")))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(COMPRESSED_SUFFIX) {
            // Compressed segments are sealed already.
            continue;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(entry.path())
            .await
            .map_err(|e| {
                WalError::General(format!("Unable to append sentinel to existing file {name}: {e}"))
            })?;
        file.write_all(&SENTINEL).await.map_err(|e| {
            WalError::General(format!("Unable to append sentinel to existing file {name}: {e}"))
        })?;
    }
    Ok(())
}

fn compress_segment(in_path: &Path, out_path: &Path) -> Result<(), WalError> {
    let in_file = std::fs::File::open(in_path).map_err(|e| {
        WalError::General(format!(
            "Unable to open '{}' for compression: {e}",
            in_path.display()
        ))
    })?;
    let out_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(out_path)
        .map_err(|e| {
            WalError::General(format!(
                "Unable to open compressed output '{}': {e}",
                out_path.display()
            ))
        })?;

    let mut reader = std::io::BufReader::with_capacity(FILE_BUFFER_SIZE, in_file);
    let mut encoder = FrameEncoder::new(out_file);
    std::io::copy(&mut reader, &mut encoder).map_err(|e| {
        WalError::General(format!("Unable to compress '{}': {e}", in_path.display()))
    })?;
    encoder.into_inner().map_err(|e| {
        WalError::General(format!(
            "Unable to finalize compression of '{}': {}",
            in_path.display(),
            e.error()
        ))
    })?;
    Ok(())
}

fn spawn_sync_task(
    file: Arc<Mutex<WalFile>>,
    sync_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sync_interval) => {
                    file.lock().await.do_sync().await;
                }
                changed = shutdown_rx.changed() => {
                    // Close was called or the Wal was dropped.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
