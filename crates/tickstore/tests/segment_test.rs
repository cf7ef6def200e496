//! Integration tests for the segment store: file round-trips, index
//! reconstruction, compaction, and corrupt-file tolerance.

use std::fs;

use tempfile::TempDir;
use tickstore::{Point, SegmentStore, SegmentStoreConfig, COMPACTION_CHUNK};

const BASE_TS: i64 = 1_700_000_000_000_000;

fn store_in(dir: &TempDir) -> SegmentStore {
    SegmentStore::open(dir.path(), SegmentStoreConfig::default()).unwrap()
}

fn tick_series(symbol: &str, count: usize, start: i64, step_us: i64) -> Vec<Point> {
    (0..count)
        .map(|i| Point::new(symbol, start + i as i64 * step_us, i as f64))
        .collect()
}

#[test]
fn test_write_batch_and_read_back() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let written = tick_series("AAPL", 500, BASE_TS, 1_000);
    store.write_batch(&written).unwrap();

    let restored = store.read_range("AAPL", i64::MIN, i64::MAX).unwrap();
    assert_eq!(restored, written);
    assert_eq!(store.segment_count("AAPL"), 1);
}

#[test]
fn test_write_batch_groups_by_symbol() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let mut batch = tick_series("AAPL", 10, BASE_TS, 1_000);
    batch.extend(tick_series("MSFT", 20, BASE_TS, 1_000));
    store.write_batch(&batch).unwrap();

    assert_eq!(store.segment_count("AAPL"), 1);
    assert_eq!(store.segment_count("MSFT"), 1);
    assert_eq!(store.read_range("AAPL", i64::MIN, i64::MAX).unwrap().len(), 10);
    assert_eq!(store.read_range("MSFT", i64::MIN, i64::MAX).unwrap().len(), 20);
}

#[test]
fn test_write_batch_sorts_and_keeps_last_duplicate() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    store
        .write_batch(&[
            Point::new("AAPL", BASE_TS + 2_000, 2.0),
            Point::new("AAPL", BASE_TS, 1.0),
            Point::new("AAPL", BASE_TS + 2_000, 20.0),
        ])
        .unwrap();

    let restored = store.read_range("AAPL", i64::MIN, i64::MAX).unwrap();
    let got: Vec<(i64, f64)> = restored.iter().map(|p| (p.timestamp, p.value)).collect();
    assert_eq!(got, vec![(BASE_TS, 1.0), (BASE_TS + 2_000, 20.0)]);
}

#[test]
fn test_segment_ids_ascend_per_symbol() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    for batch in 0..3 {
        store
            .write_batch(&tick_series("AAPL", 10, BASE_TS + batch * 100_000, 1_000))
            .unwrap();
    }

    assert_eq!(store.segment_count("AAPL"), 3);
    for id in 0..3 {
        assert!(dir.path().join(format!("AAPL_{id}.seg")).exists());
    }
}

#[test]
fn test_read_range_filters_half_open() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    store.write_batch(&tick_series("AAPL", 10, BASE_TS, 1_000)).unwrap();

    let points = store
        .read_range("AAPL", BASE_TS + 2_000, BASE_TS + 5_000)
        .unwrap();
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(
        timestamps,
        vec![BASE_TS + 2_000, BASE_TS + 3_000, BASE_TS + 4_000]
    );
}

#[test]
fn test_read_range_merges_overlapping_segments() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    // Two segments over the same window, interleaved timestamps.
    store
        .write_batch(&[
            Point::new("AAPL", BASE_TS, 1.0),
            Point::new("AAPL", BASE_TS + 2_000, 3.0),
        ])
        .unwrap();
    store
        .write_batch(&[
            Point::new("AAPL", BASE_TS + 1_000, 2.0),
            Point::new("AAPL", BASE_TS + 3_000, 4.0),
        ])
        .unwrap();

    let points = store.read_range("AAPL", i64::MIN, i64::MAX).unwrap();
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_unknown_symbol_reads_empty() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    assert!(store.read_range("NONE", i64::MIN, i64::MAX).unwrap().is_empty());
}

#[test]
fn test_index_rebuilt_on_reopen() {
    let dir = TempDir::new().unwrap();
    let written = tick_series("AAPL", 100, BASE_TS, 1_000);

    {
        let store = store_in(&dir);
        store.write_batch(&written).unwrap();
    }

    let reopened = store_in(&dir);
    assert_eq!(reopened.segment_count("AAPL"), 1);
    assert_eq!(reopened.read_range("AAPL", i64::MIN, i64::MAX).unwrap(), written);
}

#[test]
fn test_scan_skips_corrupt_files() {
    let dir = TempDir::new().unwrap();

    {
        let store = store_in(&dir);
        store.write_batch(&tick_series("AAPL", 10, BASE_TS, 1_000)).unwrap();
    }

    // Garbage header, truncated file, and a name that does not parse.
    fs::write(dir.path().join("MSFT_0.seg"), b"not a segment").unwrap();
    fs::write(dir.path().join("junk.seg"), b"").unwrap();

    let reopened = store_in(&dir);
    assert_eq!(reopened.segment_count("AAPL"), 1);
    assert_eq!(reopened.segment_count("MSFT"), 0);
    assert_eq!(reopened.symbols(), vec!["AAPL".to_string()]);
}

#[test]
fn test_scan_skips_truncated_payload() {
    let dir = TempDir::new().unwrap();

    {
        let store = store_in(&dir);
        store.write_batch(&tick_series("AAPL", 100, BASE_TS, 1_000)).unwrap();
    }

    // Chop the tail off the segment, simulating a crash mid-write.
    let path = dir.path().join("AAPL_0.seg");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let reopened = store_in(&dir);
    assert_eq!(reopened.segment_count("AAPL"), 0);
}

#[test]
fn test_compact_merges_and_deduplicates() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    // Three generations at the same timestamps; the last flush must win.
    for generation in 0..3 {
        let points: Vec<Point> = (0..10)
            .map(|i| Point::new("AAPL", BASE_TS + i * 1_000, generation as f64 * 100.0 + i as f64))
            .collect();
        store.write_batch(&points).unwrap();
    }
    assert_eq!(store.segment_count("AAPL"), 3);

    store.compact("AAPL").unwrap();

    assert_eq!(store.segment_count("AAPL"), 1);
    let points = store.read_range("AAPL", i64::MIN, i64::MAX).unwrap();
    assert_eq!(points.len(), 10);
    for (i, point) in points.iter().enumerate() {
        assert_eq!(point.value, 200.0 + i as f64);
    }

    // Old files are gone; only the fresh id remains.
    assert!(dir.path().join("AAPL_0.seg").exists());
    assert!(!dir.path().join("AAPL_1.seg").exists());
    assert!(!dir.path().join("AAPL_2.seg").exists());
}

#[test]
fn test_compact_chunks_large_symbol() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let count = COMPACTION_CHUNK + COMPACTION_CHUNK / 2;
    store
        .write_batch(&tick_series("AAPL", count, BASE_TS, 1_000))
        .unwrap();
    store.compact("AAPL").unwrap();

    assert_eq!(store.segment_count("AAPL"), 2);
    let points = store.read_range("AAPL", i64::MIN, i64::MAX).unwrap();
    assert_eq!(points.len(), count);
    assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn test_compact_unknown_symbol_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    store.compact("NONE").unwrap();
}

#[test]
fn test_optimize_covers_all_symbols() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    for symbol in ["AAPL", "MSFT"] {
        for batch in 0..2 {
            store
                .write_batch(&tick_series(symbol, 10, BASE_TS + batch * 100_000, 1_000))
                .unwrap();
        }
        assert_eq!(store.segment_count(symbol), 2);
    }

    store.optimize();

    for symbol in ["AAPL", "MSFT"] {
        assert_eq!(store.segment_count(symbol), 1);
        assert_eq!(store.read_range(symbol, i64::MIN, i64::MAX).unwrap().len(), 20);
    }
}

#[test]
fn test_storage_size_tracks_files() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    assert_eq!(store.storage_size(), 0);

    store.write_batch(&tick_series("AAPL", 1_000, BASE_TS, 1_000)).unwrap();
    let size = store.storage_size();
    assert!(size > 0);

    let on_disk = fs::metadata(dir.path().join("AAPL_0.seg")).unwrap().len();
    assert_eq!(size, on_disk);
}

#[test]
fn test_uncompressed_store_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::open(
        dir.path(),
        SegmentStoreConfig {
            enable_compression: false,
        },
    )
    .unwrap();

    let written = tick_series("AAPL", 100, BASE_TS, 1_000);
    store.write_batch(&written).unwrap();

    // Reopen to force a read through the scan path as well.
    drop(store);
    let reopened = store_in(&dir);
    assert_eq!(reopened.read_range("AAPL", i64::MIN, i64::MAX).unwrap(), written);
}

#[test]
fn test_escaped_symbol_files_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let written = tick_series("ES_F", 10, BASE_TS, 1_000);

    {
        let store = store_in(&dir);
        store.write_batch(&written).unwrap();
        assert!(dir.path().join("ES%5FF_0.seg").exists());
    }

    let reopened = store_in(&dir);
    assert_eq!(reopened.symbols(), vec!["ES_F".to_string()]);
    assert_eq!(reopened.read_range("ES_F", i64::MIN, i64::MAX).unwrap(), written);
}

#[test]
fn test_compression_shrinks_typical_ticks() {
    let compressed_dir = TempDir::new().unwrap();
    let raw_dir = TempDir::new().unwrap();

    let compressed = store_in(&compressed_dir);
    let raw = SegmentStore::open(
        raw_dir.path(),
        SegmentStoreConfig {
            enable_compression: false,
        },
    )
    .unwrap();

    let points = tick_series("AAPL", 10_000, BASE_TS, 1_000);
    compressed.write_batch(&points).unwrap();
    raw.write_batch(&points).unwrap();

    assert!(
        compressed.storage_size() * 4 < raw.storage_size(),
        "compressed {} bytes vs raw {} bytes",
        compressed.storage_size(),
        raw.storage_size()
    );
}
