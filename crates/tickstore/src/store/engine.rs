//! The storage engine façade over both tiers.
//!
//! [`StorageEngine`] routes writes into the [`MemoryTier`], moves full
//! buffers to the [`SegmentStore`] via [`flush`](StorageEngine::flush), and
//! merges both tiers on read. One engine instance exclusively owns its data
//! directory; two engines over the same directory are undefined behavior.
//!
//! # Locking
//!
//! The engine lock covers memory-tier access and snapshotting only. It is
//! never held across segment-store I/O: flush snapshots under the lock,
//! writes without it, and re-acquires it to clear the memory tier once the
//! batch is durable. Lock order is engine -> segment index and
//! engine -> registry -> per-symbol buffer; no path reverses it.

use crate::error::Result;
use crate::store::memory::MemoryTier;
use crate::store::segment::{SegmentStore, SegmentStoreConfig};
use crate::store::{Point, Timestamp};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default advisory memory budget in megabytes.
pub const DEFAULT_MEMORY_CACHE_SIZE_MB: usize = 256;

/// Default advisory batch grouping hint.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default advisory segment size cap in megabytes.
pub const DEFAULT_MAX_SEGMENT_SIZE_MB: usize = 64;

/// Default memory-tier point count that triggers a flush.
pub const DEFAULT_MAX_MEMORY_POINTS: usize = 1_000_000;

/// Configuration for a [`StorageEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Advisory memory budget hint in megabytes; not enforced.
    pub memory_cache_size_mb: usize,
    /// Directory owning every segment file. Created if absent.
    pub data_directory: PathBuf,
    /// Compress segment payloads (default true).
    pub enable_compression: bool,
    /// Advisory write grouping hint; not enforced.
    pub batch_size: usize,
    /// Advisory per-segment size cap in megabytes; not enforced.
    pub max_segment_size_mb: usize,
    /// Memory-tier point count at which a write triggers a flush.
    pub max_memory_points: usize,
}

impl EngineConfig {
    /// Creates a configuration with defaults for the given data directory.
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            memory_cache_size_mb: DEFAULT_MEMORY_CACHE_SIZE_MB,
            data_directory: data_directory.into(),
            enable_compression: true,
            batch_size: DEFAULT_BATCH_SIZE,
            max_segment_size_mb: DEFAULT_MAX_SEGMENT_SIZE_MB,
            max_memory_points: DEFAULT_MAX_MEMORY_POINTS,
        }
    }

    /// Sets the flush threshold in points.
    pub fn with_max_memory_points(mut self, max: usize) -> Self {
        self.max_memory_points = max;
        self
    }

    /// Enables or disables payload compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// Sets the advisory batch grouping hint.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// A snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    /// Points admitted since the engine was constructed.
    pub total_points: u64,
    /// `get_latest` calls answered from the memory tier.
    pub cache_hits: u64,
    /// `get_latest` calls that fell through to disk.
    pub cache_misses: u64,
    /// hits / (hits + misses), 0.0 before the first lookup.
    pub cache_hit_ratio: f64,
    /// Bytes currently occupied by segment files.
    pub storage_size_bytes: u64,
}

/// Two-tier storage engine for tick data.
pub struct StorageEngine {
    config: EngineConfig,
    memory: MemoryTier,
    segments: SegmentStore,
    /// Engine lock per the locking contract above. Guards nothing by value;
    /// writers exclude readers across memory-tier snapshots.
    lock: RwLock<()>,
    total_points: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl StorageEngine {
    /// Opens an engine over `config.data_directory`, creating the directory
    /// if needed and reloading segment metadata persisted by earlier runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created or scanned.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let segments = SegmentStore::open(
            &config.data_directory,
            SegmentStoreConfig {
                enable_compression: config.enable_compression,
            },
        )?;

        Ok(Self {
            config,
            memory: MemoryTier::new(),
            segments,
            lock: RwLock::new(()),
            total_points: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Writes one point.
    ///
    /// Returns `false` when the memory tier already holds a point with this
    /// timestamp for the symbol. A write that pushes the memory tier past
    /// `max_memory_points` triggers a flush before returning.
    ///
    /// # Errors
    ///
    /// Propagates flush I/O failures; the point itself is already buffered.
    pub fn write_point(&self, point: Point) -> Result<bool> {
        let (admitted, needs_flush) = {
            let _guard = self.lock.write();
            let admitted = self.memory.insert(point);
            (admitted, self.memory.len() >= self.config.max_memory_points)
        };

        if admitted {
            self.total_points.fetch_add(1, Ordering::Relaxed);
        }
        if needs_flush {
            self.flush()?;
        }
        Ok(admitted)
    }

    /// Writes a batch of points.
    ///
    /// Returns `true` when at least one point was admitted; duplicates of
    /// already-buffered timestamps are dropped per the memory-tier policy.
    /// Triggers a flush when the buffered total crosses the threshold.
    ///
    /// # Errors
    ///
    /// Propagates flush I/O failures.
    pub fn write_batch(&self, points: Vec<Point>) -> Result<bool> {
        if points.is_empty() {
            return Ok(true);
        }

        let (admitted, needs_flush) = {
            let _guard = self.lock.write();
            let admitted = self.memory.insert_batch(points);
            (admitted, self.memory.len() >= self.config.max_memory_points)
        };

        self.total_points.fetch_add(admitted as u64, Ordering::Relaxed);
        if needs_flush {
            self.flush()?;
        }
        Ok(admitted > 0)
    }

    /// Moves every buffered point into new segments and empties the memory
    /// tier.
    ///
    /// The snapshot happens under the engine lock; the segment write does
    /// not. On write failure the memory tier is left untouched so no data
    /// is lost, and the error surfaces to the caller.
    pub fn flush(&self) -> Result<()> {
        let batch = {
            let _guard = self.lock.write();
            self.memory.snapshot()
        };
        if batch.is_empty() {
            return Ok(());
        }

        debug!("flushing {} points to segment store", batch.len());
        self.segments.write_batch(&batch)?;

        let _guard = self.lock.write();
        self.memory.clear();
        Ok(())
    }

    /// Reads all points for `symbol` between `start` and `end`, merged
    /// across both tiers and sorted by timestamp.
    ///
    /// The start bound is inclusive. The end bound follows each tier's
    /// convention: inclusive for buffered points, exclusive for on-disk
    /// points (see [`MemoryTier::get_range`] and
    /// [`SegmentStore::read_range`]).
    ///
    /// The sort is stable with memory-tier points first, so a point caught
    /// mid-flush in both tiers appears twice in buffer-then-segment order;
    /// [`optimize`](StorageEngine::optimize) is the terminal deduper. An
    /// unknown symbol yields an empty result.
    ///
    /// # Errors
    ///
    /// Propagates segment read failures.
    pub fn read_range(&self, symbol: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Point>> {
        let mut points = {
            let _guard = self.lock.read();
            self.memory.get_range(symbol, start, end)
        };

        let disk_points = self.segments.read_range(symbol, start, end)?;
        points.extend(disk_points);
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Returns the most recent point for `symbol` from either tier.
    ///
    /// The memory tier is consulted first; only on a miss is the symbol's
    /// full disk range scanned.
    ///
    /// # Errors
    ///
    /// Propagates segment read failures.
    pub fn get_latest(&self, symbol: &str) -> Result<Option<Point>> {
        let buffered = {
            let _guard = self.lock.read();
            self.memory.get_latest(symbol)
        };
        if buffered.is_some() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buffered);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let disk_points = self
            .segments
            .read_range(symbol, Timestamp::MIN, Timestamp::MAX)?;
        Ok(disk_points.into_iter().next_back())
    }

    /// Returns every symbol known to either tier.
    pub fn symbols(&self) -> HashSet<String> {
        let mut symbols = {
            let _guard = self.lock.read();
            self.memory.symbols()
        };
        symbols.extend(self.segments.symbols());
        symbols
    }

    /// Flushes, then compacts every symbol's segments into sorted,
    /// duplicate-free runs. Per-symbol compaction failures are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Propagates a flush failure; compaction itself never fails the call.
    pub fn optimize(&self) -> Result<()> {
        self.flush()?;
        self.segments.optimize();
        Ok(())
    }

    /// Returns a snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let requests = hits + misses;

        EngineStats {
            total_points: self.total_points.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_ratio: if requests > 0 {
                hits as f64 / requests as f64
            } else {
                0.0
            },
            storage_size_bytes: self.segments.storage_size(),
        }
    }

    /// Number of points currently buffered in the memory tier.
    pub fn buffered_points(&self) -> usize {
        self.memory.len()
    }
}
