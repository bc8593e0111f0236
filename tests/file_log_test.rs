//! Durable log scenarios: fresh boot, reopen, rotation, truncation and
//! recovery from damaged files.

use std::os::unix::fs::FileExt;

use tempfile::TempDir;

use quorlog::{Entry, FileLog};

fn entry(term: u64, key: &str, value: &str) -> Entry {
    Entry::data(term, key.as_bytes().to_vec(), value.as_bytes().to_vec())
}

fn bulk_entry(term: u64, index: u64, value_len: usize) -> Entry {
    Entry::data(
        term,
        format!("key_{}", index).into_bytes(),
        vec![b'x'; value_len],
    )
}

/// Read a segment header straight off the disk format: three little-endian
/// u64s, entry_start / entry_end / filesize.
fn read_segment_header(path: &std::path::Path) -> (u64, u64, u64) {
    let file = std::fs::File::open(path).unwrap();
    let mut buf = [0u8; 24];
    file.read_exact_at(&mut buf, 0).unwrap();
    (
        u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        u64::from_le_bytes(buf[16..24].try_into().unwrap()),
    )
}

#[test]
fn test_fresh_boot() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();

    assert_eq!(log.last_log_index(), 0);
    assert_eq!(log.start_log_index(), 0);
    assert_eq!(log.persisted_range(), (0, 0));
    assert_eq!(log.raft_meta().current_term, 1);
    assert_eq!(log.raft_meta().voted_for(), None);
    assert_eq!(log.log_number(), 1);

    assert!(dir.path().join("manifest").exists());
    assert!(dir.path().join("0000000001.floyd.log").exists());
}

#[test]
fn test_append_reports_dense_range() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();

    let batch = vec![entry(1, "a", "1"), entry(1, "b", "2"), entry(1, "c", "3")];
    let n = batch.len() as u64;
    let before = log.last_log_index();
    let (a, b) = log.append(batch).unwrap();

    assert_eq!(b - a + 1, n);
    assert_eq!(a, before + 1);
    assert_eq!(log.last_log_index(), b);
}

#[test]
fn test_append_and_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        let (a, b) = log
            .append(vec![entry(1, "a", "1"), entry(1, "b", "2")])
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.persisted_range(), (1, 2));
    }

    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), 2);
    assert_eq!(log.get_entry(1).key, b"a");
    assert_eq!(log.get_entry(1).value, b"1");
    assert_eq!(log.get_entry(2).value, b"2");
    assert_eq!(log.persisted_range(), (1, 2));
    assert_eq!(log.active_segment_header().entry_end, 2);
}

#[test]
fn test_rotation_splits_segments() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();

    // 4 KiB values; a bit over 1 MiB of appends forces one rotation.
    let total = 300u64;
    for index in 1..=total {
        log.append(vec![bulk_entry(1, index, 4096)]).unwrap();
    }

    assert_eq!(log.log_number(), 2);
    let seg1 = dir.path().join("0000000001.floyd.log");
    let seg2 = dir.path().join("0000000002.floyd.log");
    assert!(seg1.exists());
    assert!(seg2.exists());

    // The two segments partition the index range with no gap or overlap.
    let (seg1_start, seg1_end, _) = read_segment_header(&seg1);
    let active = log.active_segment_header();
    assert_eq!(seg1_start, 1);
    assert_eq!(active.entry_start, seg1_end + 1);
    assert_eq!(active.entry_end, total);

    // Reopening replays both segments in order.
    drop(log);
    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), total);
    for index in [1, seg1_end, seg1_end + 1, total] {
        assert_eq!(log.get_entry(index).key, format!("key_{}", index).as_bytes());
    }
}

#[test]
fn test_truncate_suffix_across_segments() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();

    // ~11 KiB values rotate once near index 100.
    let total = 150u64;
    for index in 1..=total {
        log.append(vec![bulk_entry(1, index, 11_000)]).unwrap();
    }
    assert_eq!(log.log_number(), 2);
    let rotation_index = log.active_segment_header().entry_start;
    assert!(rotation_index > 1 && rotation_index < total);

    // Cut back to well inside segment #1: the whole of segment #2 goes away
    // and the boundary segment is trimmed frame by frame.
    let last_kept = rotation_index - 10;
    log.truncate_suffix(last_kept).unwrap();

    assert_eq!(log.last_log_index(), last_kept);
    assert_eq!(log.log_number(), 1);
    assert!(!dir.path().join("0000000002.floyd.log").exists());
    let active = log.active_segment_header();
    assert_eq!(active.entry_start, 1);
    assert_eq!(active.entry_end, last_kept);
    assert_eq!(log.persisted_range(), (1, last_kept));

    drop(log);
    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), last_kept);
    assert_eq!(log.get_entry(last_kept).key, format!("key_{}", last_kept).as_bytes());
}

#[test]
fn test_truncate_suffix_to_empty_keeps_one_segment() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();
    log.append(vec![entry(1, "a", "1"), entry(1, "b", "2")]).unwrap();

    log.truncate_suffix(0).unwrap();
    assert_eq!(log.last_log_index(), 0);
    assert_eq!(log.log_number(), 1);
    assert!(dir.path().join("0000000001.floyd.log").exists());

    // The log stays usable from index 1 again.
    let (a, b) = log.append(vec![entry(2, "c", "3")]).unwrap();
    assert_eq!((a, b), (1, 1));
    assert_eq!(log.get_entry(1).term, 2);
}

#[test]
fn test_truncate_within_active_segment() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();
    for index in 1..=10u64 {
        log.append(vec![bulk_entry(1, index, 32)]).unwrap();
    }

    log.truncate_suffix(6).unwrap();
    assert_eq!(log.last_log_index(), 6);
    assert_eq!(log.active_segment_header().entry_end, 6);

    // New appends continue right after the cut.
    let (a, _) = log.append(vec![entry(2, "tail", "v")]).unwrap();
    assert_eq!(a, 7);

    drop(log);
    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), 7);
    assert_eq!(log.get_entry(7).key, b"tail");
    assert_eq!(log.get_entry(6).key, b"key_6");
}

#[test]
fn test_recovery_ignores_bytes_past_filesize() {
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        log.append(vec![entry(1, "a", "1"), entry(1, "b", "2"), entry(1, "c", "3")])
            .unwrap();
    }

    // A crashed append leaves payload bytes past the committed filesize;
    // they never became visible because the header was not rewritten.
    let seg = dir.path().join("0000000001.floyd.log");
    let file = std::fs::OpenOptions::new().write(true).open(&seg).unwrap();
    let len = file.metadata().unwrap().len();
    file.write_all_at(&[0xa5u8; 64], len).unwrap();

    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), 3);
    assert_eq!(log.get_entry(3).key, b"c");
}

#[test]
fn test_recovery_drops_corrupt_tail_inside_filesize() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        log.append(vec![entry(1, "a", "1"), entry(1, "b", "2"), entry(1, "c", "3")])
            .unwrap();
    }

    // Stretch the committed filesize over garbage bytes: the replay must
    // stop at the first broken frame and keep the surviving prefix.
    let seg = dir.path().join("0000000001.floyd.log");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&seg)
        .unwrap();
    let mut header = [0u8; 24];
    file.read_exact_at(&mut header, 0).unwrap();
    let filesize = u64::from_le_bytes(header[16..24].try_into().unwrap());
    file.write_all_at(&[0xa5u8; 64], filesize).unwrap();
    header[16..24].copy_from_slice(&(filesize + 64).to_le_bytes());
    header[8..16].copy_from_slice(&9u64.to_le_bytes());
    file.write_all_at(&header, 0).unwrap();

    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), 3);
    assert_eq!(log.get_entry(3).key, b"c");
    // The trimmed header exposes only the surviving prefix again.
    assert_eq!(log.active_segment_header().entry_end, 3);
    assert_eq!(log.active_segment_header().filesize, filesize);
}

#[test]
fn test_unreadable_manifest_falls_back_to_defaults() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        log.append(vec![entry(3, "a", "1")]).unwrap();
    }

    std::fs::write(dir.path().join("manifest"), vec![0xfeu8; 80]).unwrap();

    // Chosen torn-write policy: recover with cleared defaults rather than
    // refuse to start. The entry range resets, so old segments are stale.
    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.raft_meta().current_term, 1);
    assert_eq!(log.last_log_index(), 0);
    assert_eq!(log.persisted_range(), (0, 0));
}

#[test]
fn test_raft_meta_round_trips_through_manifest() {
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        let mut meta = log.raft_meta();
        meta.current_term = 12;
        meta.voted_for_ip = "10.1.1.4".to_string();
        meta.voted_for_port = 7100;
        log.set_raft_meta(meta).unwrap();
        log.append(vec![entry(12, "a", "1")]).unwrap();
    }

    let log = FileLog::open(dir.path()).unwrap();
    let meta = log.raft_meta();
    assert_eq!(meta.current_term, 12);
    assert_eq!(meta.voted_for(), Some(("10.1.1.4", 7100)));
    assert_eq!(log.last_log_index(), 1);
}

#[test]
fn test_take_sync_covers_prior_appends() {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open(dir.path()).unwrap();
    log.append(vec![entry(1, "a", "1"), entry(1, "b", "2")]).unwrap();

    let sync = log.take_sync();
    assert_eq!(sync.last_index(), 2);
    sync.wait().unwrap();

    // The fresh handle picks up from the new tail.
    log.append(vec![entry(1, "c", "3")]).unwrap();
    let sync = log.take_sync();
    assert_eq!(sync.last_index(), 3);
    sync.wait().unwrap();
}

#[test]
fn test_stale_segment_deleted_on_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let log = FileLog::open(dir.path()).unwrap();
        log.append(vec![entry(1, "a", "1")]).unwrap();
    }

    // A rotated-but-never-used segment from a crash right after a split:
    // its preset range lies entirely beyond the manifest's entry range.
    let orphan = dir.path().join("0000000002.floyd.log");
    let mut header = [0u8; 24];
    header[0..8].copy_from_slice(&2u64.to_le_bytes());
    header[8..16].copy_from_slice(&2u64.to_le_bytes());
    header[16..24].copy_from_slice(&24u64.to_le_bytes());
    std::fs::write(&orphan, header).unwrap();

    let log = FileLog::open(dir.path()).unwrap();
    assert_eq!(log.last_log_index(), 1);
    assert_eq!(log.log_number(), 1);
    assert!(!orphan.exists());

    // Appending keeps going in the surviving segment.
    let (a, _) = log.append(vec![entry(1, "b", "2")]).unwrap();
    assert_eq!(a, 2);
}
