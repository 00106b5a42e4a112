use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::timeout;

use crate::segment::{list_sorted_filenames, new_file_sequence, sequence_to_filename};
use crate::types::{COMPRESSED_SUFFIX, Offset};
use crate::wal::Wal;

const WAIT: Duration = Duration::from_secs(5);

async fn open_immediate(dir: &Path) -> Wal {
    Wal::open(dir.to_path_buf(), Duration::ZERO).await.unwrap()
}

async fn open_small(dir: &Path, max_segment_size: i64) -> Wal {
    Wal::open_with_segment_size(dir.to_path_buf(), Duration::ZERO, max_segment_size)
        .await
        .unwrap()
}

#[tokio::test]
async fn write_then_read_single_record() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;

    let written = wal.write(&[b"hel".as_slice(), b"lo"]).await.unwrap();
    assert_eq!(written, 9, "4-byte length prefix plus 5 payload bytes");

    let mut reader = wal.new_reader(None).await.unwrap();
    let record = timeout(WAIT, reader.read()).await.unwrap().unwrap();
    assert_eq!(record, b"hello");

    let offset = reader.offset();
    assert!(offset.file_sequence() > 0);
    assert_eq!(offset.position(), 9);
    wal.close().await.unwrap();
}

#[tokio::test]
async fn empty_write_is_a_noop() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;

    assert_eq!(wal.write::<&[u8]>(&[]).await.unwrap(), 0);
    assert_eq!(wal.write(&[b"".as_slice(), b""]).await.unwrap(), 0);

    // A reader only ever sees real records.
    wal.write(&[b"first"]).await.unwrap();
    let mut reader = wal.new_reader(None).await.unwrap();
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"first");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn rollover_preserves_record_boundaries() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 16).await;

    wal.write(&[b"0123456789abcdef"]).await.unwrap();
    wal.write(&[b"second-record!!!"]).await.unwrap();

    // Each record sealed its segment: one whole frame plus the sentinel,
    // never a frame split across files.
    let names = list_sorted_filenames(tmp.path()).unwrap();
    assert_eq!(names.len(), 3, "two sealed segments and a fresh active one");
    let first = std::fs::read(tmp.path().join(&names[0])).unwrap();
    assert_eq!(first.len(), 24);
    assert_eq!(&first[..4], &[0, 0, 0, 16]);
    assert_eq!(&first[4..20], b"0123456789abcdef");
    assert_eq!(&first[20..], &[0, 0, 0, 0]);

    let mut reader = wal.new_reader(None).await.unwrap();
    assert_eq!(
        timeout(WAIT, reader.read()).await.unwrap().unwrap(),
        b"0123456789abcdef"
    );
    assert_eq!(
        timeout(WAIT, reader.read()).await.unwrap().unwrap(),
        b"second-record!!!"
    );
    wal.close().await.unwrap();
}

#[tokio::test]
async fn rollover_sequences_strictly_increase() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 1).await;

    for i in 0..20u8 {
        wal.write(&[&[i]]).await.unwrap();
    }

    let names = list_sorted_filenames(tmp.path()).unwrap();
    assert_eq!(names.len(), 21, "rollovers in the same microsecond must not collide");
    let sequences: Vec<i64> = names
        .iter()
        .map(|n| crate::segment::filename_to_sequence(n))
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    wal.close().await.unwrap();
}

#[tokio::test]
async fn offsets_are_monotonic_across_rollovers() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 8).await;

    for i in 0..5 {
        wal.write(&[format!("rec-{i}").as_bytes()]).await.unwrap();
    }

    let mut reader = wal.new_reader(None).await.unwrap();
    let mut last = reader.offset();
    for i in 0..5 {
        let record = timeout(WAIT, reader.read()).await.unwrap().unwrap();
        assert_eq!(record, format!("rec-{i}").as_bytes());
        let offset = reader.offset();
        assert!(offset > last, "offset {offset} must follow {last}");
        last = offset;
    }
    wal.close().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_from_recorded_offset() {
    let tmp = tempdir().unwrap();

    let offset = {
        let wal = open_immediate(tmp.path()).await;
        for i in 0..3 {
            wal.write(&[format!("record-{i}").as_bytes()]).await.unwrap();
        }
        let mut reader = wal.new_reader(None).await.unwrap();
        assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"record-0");
        assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"record-1");
        wal.close().await.unwrap();
        reader.offset()
    };

    // A new writer seals the old segment and appends in a fresh one.
    let wal = open_immediate(tmp.path()).await;
    wal.write(&[b"record-3"]).await.unwrap();

    let mut reader = wal.new_reader(Some(offset)).await.unwrap();
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"record-2");
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"record-3");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn compression_is_transparent_to_readers() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 8).await;

    let payloads: Vec<String> = (0..10).map(|i| format!("payload-{i}")).collect();
    for p in &payloads {
        wal.write(&[p.as_bytes()]).await.unwrap();
    }

    wal.compress_before(Offset::new(i64::MAX, 0)).await.unwrap();
    let names = list_sorted_filenames(tmp.path()).unwrap();
    let twins = names.iter().filter(|n| n.ends_with(COMPRESSED_SUFFIX)).count();
    assert_eq!(twins, 10, "every sealed segment gets a compressed twin");

    let mut reader = wal.new_reader(None).await.unwrap();
    for p in &payloads {
        let record = timeout(WAIT, reader.read()).await.unwrap().unwrap();
        assert_eq!(record, p.as_bytes());
    }
    wal.close().await.unwrap();
}

#[tokio::test]
async fn resume_inside_compressed_segment() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 8).await;

    let payloads: Vec<String> = (0..6).map(|i| format!("payload-{i}")).collect();
    for p in &payloads {
        wal.write(&[p.as_bytes()]).await.unwrap();
    }

    let mut reader = wal.new_reader(None).await.unwrap();
    for p in payloads.iter().take(3) {
        assert_eq!(
            timeout(WAIT, reader.read()).await.unwrap().unwrap(),
            p.as_bytes()
        );
    }
    let offset = reader.offset();

    wal.compress_before(Offset::new(i64::MAX, 0)).await.unwrap();

    // The recorded position counts decoded bytes, so it still lands on
    // the same record boundary inside the compressed twin.
    let mut resumed = wal.new_reader(Some(offset)).await.unwrap();
    for p in payloads.iter().skip(3) {
        assert_eq!(
            timeout(WAIT, resumed.read()).await.unwrap().unwrap(),
            p.as_bytes()
        );
    }
    wal.close().await.unwrap();
}

#[tokio::test]
async fn truncation_keeps_the_tail_readable() {
    let tmp = tempdir().unwrap();
    let wal = open_small(tmp.path(), 8).await;

    for i in 0..5 {
        wal.write(&[format!("record-{i}").as_bytes()]).await.unwrap();
    }

    let mut reader = wal.new_reader(None).await.unwrap();
    for i in 0..3 {
        assert_eq!(
            timeout(WAIT, reader.read()).await.unwrap().unwrap(),
            format!("record-{i}").as_bytes()
        );
    }
    let offset = reader.offset();

    wal.truncate_before(offset).await.unwrap();
    let names = list_sorted_filenames(tmp.path()).unwrap();
    assert_eq!(names.len(), 4, "two segments before the cutoff are gone");

    let mut resumed = wal.new_reader(Some(offset)).await.unwrap();
    assert_eq!(timeout(WAIT, resumed.read()).await.unwrap().unwrap(), b"record-3");
    assert_eq!(timeout(WAIT, resumed.read()).await.unwrap().unwrap(), b"record-4");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn read_blocks_until_the_next_record() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;
    let mut reader = wal.new_reader(None).await.unwrap();

    let pending = tokio::spawn(async move { reader.read().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished(), "reader must wait for the writer");

    wal.write(&[b"wake up"]).await.unwrap();
    let record = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(record, b"wake up");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn reader_at_future_offset_waits_for_new_records() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;

    let future = Offset::new(new_file_sequence() + 60_000_000, 0);
    let mut reader = wal.new_reader(Some(future)).await.unwrap();

    let pending = tokio::spawn(async move { reader.read().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    wal.write(&[b"eventually"]).await.unwrap();
    let record = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(record, b"eventually");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn legacy_nanosecond_offsets_are_rescaled() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;
    wal.write(&[b"record-0"]).await.unwrap();
    wal.write(&[b"record-1"]).await.unwrap();

    let mut reader = wal.new_reader(None).await.unwrap();
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"record-0");
    let offset = reader.offset();

    // The same point written as an old nanosecond-scaled offset.
    let legacy = Offset::new(offset.file_sequence() * 1000, offset.position());
    assert!(!sequence_to_filename(legacy.file_sequence()).starts_with('0'));

    let mut resumed = wal.new_reader(Some(legacy)).await.unwrap();
    assert_eq!(timeout(WAIT, resumed.read()).await.unwrap().unwrap(), b"record-1");
    assert_eq!(resumed.offset().file_sequence(), offset.file_sequence());
    wal.close().await.unwrap();
}

#[tokio::test]
async fn partial_record_in_abandoned_segment_is_skipped() {
    let tmp = tempdir().unwrap();

    // A crashed writer left one whole frame and a frame announcing 64
    // bytes it never wrote.
    let stale_seq = 1_600_000_000_000_000i64;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&3u32.to_be_bytes());
    bytes.extend_from_slice(b"old");
    bytes.extend_from_slice(&64u32.to_be_bytes());
    bytes.extend_from_slice(b"partial");
    std::fs::write(tmp.path().join(sequence_to_filename(stale_seq)), &bytes).unwrap();

    let wal = open_immediate(tmp.path()).await;
    wal.write(&[b"fresh"]).await.unwrap();

    let mut reader = wal.new_reader(None).await.unwrap();
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"old");
    // The 64-byte frame can never complete; the reader must notice the
    // writer has moved past this segment and continue in the live one.
    assert_eq!(timeout(WAIT, reader.read()).await.unwrap().unwrap(), b"fresh");
    wal.close().await.unwrap();
}

#[tokio::test]
async fn write_after_close_fails() {
    let tmp = tempdir().unwrap();
    let wal = open_immediate(tmp.path()).await;
    wal.write(&[b"before"]).await.unwrap();
    wal.close().await.unwrap();
    assert!(wal.write(&[b"after"]).await.is_err());
}
