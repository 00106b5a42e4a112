use crate::types::{COMPRESSED_SUFFIX, WalError};
use log::error;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sequence number for a segment created right now: microseconds since the
/// Unix epoch.
pub(crate) fn new_file_sequence() -> i64 {
    ts_to_file_sequence(SystemTime::now())
}

pub(crate) fn ts_to_file_sequence(ts: SystemTime) -> i64 {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Canonical segment filename: the decimal sequence zero-padded to 19
/// digits, so lexicographic and numeric order agree.
pub(crate) fn sequence_to_filename(seq: i64) -> String {
    format!("{seq:019}")
}

/// Parse a segment filename back into its sequence, ignoring any
/// `.snappy` suffix. Unparseable names sort to the front as sequence 0.
pub(crate) fn filename_to_sequence(filename: &str) -> i64 {
    let name = filename.strip_suffix(COMPRESSED_SUFFIX).unwrap_or(filename);
    match name.parse::<i64>() {
        Ok(seq) => seq,
        Err(e) => {
            error!("Unparseable segment filename '{filename}': {e}");
            0
        }
    }
}

/// Every file name in `dir`, sorted lexicographically. All segment sweeps
/// (truncation, compression, reader advance) walk this listing in order.
pub(crate) fn list_sorted_filenames(dir: &Path) -> Result<Vec<String>, WalError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        WalError::General(format!(
            "Unable to list log files in '{}': {e}",
            dir.display()
        ))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            WalError::General(format!(
                "Unable to list log files in '{}': {e}",
                dir.display()
            ))
        })?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_round_trip() {
        let seq = 1_722_500_000_123_456i64;
        let name = sequence_to_filename(seq);
        assert_eq!(name.len(), 19);
        assert_eq!(filename_to_sequence(&name), seq);
        assert_eq!(filename_to_sequence(&format!("{name}.snappy")), seq);
    }

    #[test]
    fn filenames_sort_numerically() {
        let a = sequence_to_filename(999);
        let b = sequence_to_filename(1_000);
        assert!(a < b);
    }

    #[test]
    fn unparseable_filename_yields_zero() {
        assert_eq!(filename_to_sequence("not-a-segment"), 0);
    }
}
