//! In-memory staging tier: per-symbol sorted tick buffers.
//!
//! Every symbol owns an independent buffer of points kept strictly ascending
//! by timestamp with no duplicate timestamps. Buffers are created lazily on
//! first insert and dropped wholesale by [`MemoryTier::clear`] once a flush
//! has landed on disk.
//!
//! # Locking
//!
//! A registry `RwLock` guards the symbol map (exclusive only while creating
//! a new entry); each buffer carries its own `RwLock`. The registry lock is
//! always taken before a buffer lock, never the other way around.

use crate::store::{Point, Timestamp};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sorted, timestamp-unique points for one symbol.
#[derive(Debug, Default)]
struct SymbolBuffer {
    points: Vec<Point>,
}

/// The in-memory staging tier.
///
/// Duplicate policy: a single [`insert`](MemoryTier::insert) with an already
/// present timestamp is rejected (returns `false`); a batch insert keeps the
/// existing entry and drops the newcomer. Latest-write-wins resolution across
/// flushes is the segment store's job during compaction.
#[derive(Debug, Default)]
pub struct MemoryTier {
    symbols: RwLock<HashMap<String, Arc<RwLock<SymbolBuffer>>>>,
    total_points: AtomicUsize,
}

impl MemoryTier {
    /// Creates an empty memory tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the buffer for a symbol, creating it if absent.
    fn buffer(&self, symbol: &str) -> Arc<RwLock<SymbolBuffer>> {
        if let Some(buf) = self.symbols.read().get(symbol) {
            return Arc::clone(buf);
        }

        // Re-check under the exclusive lock; another thread may have raced us.
        let mut symbols = self.symbols.write();
        Arc::clone(symbols.entry(symbol.to_string()).or_default())
    }

    /// Inserts a single point in timestamp order.
    ///
    /// Returns `false` without modifying the buffer when a point with the
    /// same timestamp already exists for the symbol.
    pub fn insert(&self, point: Point) -> bool {
        let buffer = self.buffer(&point.symbol);
        let mut buffer = buffer.write();

        match buffer
            .points
            .binary_search_by_key(&point.timestamp, |p| p.timestamp)
        {
            Ok(_) => false,
            Err(idx) => {
                buffer.points.insert(idx, point);
                self.total_points.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Inserts a batch of points, grouped by symbol.
    ///
    /// Within each symbol the batch is sorted and merged into the existing
    /// buffer; on a duplicate timestamp the existing entry wins, matching
    /// point-by-point [`insert`](MemoryTier::insert) semantics. Returns the
    /// number of newly admitted points, which is also what the global
    /// counter advances by.
    pub fn insert_batch(&self, points: Vec<Point>) -> usize {
        if points.is_empty() {
            return 0;
        }

        let mut grouped: HashMap<String, Vec<Point>> = HashMap::new();
        for point in points {
            grouped.entry(point.symbol.clone()).or_default().push(point);
        }

        let mut admitted = 0;
        for (symbol, mut group) in grouped {
            group.sort_by_key(|p| p.timestamp);

            let buffer = self.buffer(&symbol);
            let mut buffer = buffer.write();

            let before = buffer.points.len();
            let mut merged = Vec::with_capacity(before + group.len());
            let mut existing = std::mem::take(&mut buffer.points).into_iter().peekable();
            let mut incoming = group.into_iter().peekable();

            while let (Some(old), Some(new)) = (existing.peek(), incoming.peek()) {
                match old.timestamp.cmp(&new.timestamp) {
                    std::cmp::Ordering::Less => merged.push(existing.next().unwrap()),
                    std::cmp::Ordering::Greater => {
                        let new = incoming.next().unwrap();
                        if merged.last().map(|p: &Point| p.timestamp) != Some(new.timestamp) {
                            merged.push(new);
                        }
                    }
                    std::cmp::Ordering::Equal => {
                        // Existing entry wins; drop the newcomer.
                        merged.push(existing.next().unwrap());
                        incoming.next();
                    }
                }
            }
            merged.extend(existing);
            for new in incoming {
                if merged.last().map(|p: &Point| p.timestamp) != Some(new.timestamp) {
                    merged.push(new);
                }
            }

            admitted += merged.len() - before;
            buffer.points = merged;
        }

        self.total_points.fetch_add(admitted, Ordering::Relaxed);
        admitted
    }

    /// Returns the most recent point for a symbol, if any.
    pub fn get_latest(&self, symbol: &str) -> Option<Point> {
        let buffer = {
            let symbols = self.symbols.read();
            Arc::clone(symbols.get(symbol)?)
        };
        let buffer = buffer.read();
        buffer.points.last().cloned()
    }

    /// Copies out the points for `symbol` with `start <= ts <= end`.
    ///
    /// Both bounds are inclusive here; the half-open convention applies on
    /// the segment-store side of a merged read.
    pub fn get_range(&self, symbol: &str, start: Timestamp, end: Timestamp) -> Vec<Point> {
        let buffer = {
            let symbols = self.symbols.read();
            match symbols.get(symbol) {
                Some(buf) => Arc::clone(buf),
                None => return Vec::new(),
            }
        };
        let buffer = buffer.read();

        let lo = buffer.points.partition_point(|p| p.timestamp < start);
        let hi = buffer.points.partition_point(|p| p.timestamp <= end);
        buffer.points[lo..hi].to_vec()
    }

    /// Returns a snapshot of every buffered point across all symbols.
    pub fn snapshot(&self) -> Vec<Point> {
        let buffers: Vec<Arc<RwLock<SymbolBuffer>>> =
            self.symbols.read().values().map(Arc::clone).collect();

        let mut points = Vec::new();
        for buffer in buffers {
            points.extend_from_slice(&buffer.read().points);
        }
        points
    }

    /// Returns the set of symbols with a buffer, empty or not.
    pub fn symbols(&self) -> HashSet<String> {
        self.symbols.read().keys().cloned().collect()
    }

    /// Total number of buffered points across all symbols.
    pub fn len(&self) -> usize {
        self.total_points.load(Ordering::Relaxed)
    }

    /// Returns true if no points are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every buffer and resets the point counter.
    pub fn clear(&self) {
        let mut symbols = self.symbols.write();
        symbols.clear();
        self.total_points.store(0, Ordering::Relaxed);
    }
}
