//! Tickstore - embedded two-tier storage engine for financial tick data.
//!
//! This crate stores (timestamp, value, symbol) ticks in a hybrid of an
//! in-memory staging tier and immutable on-disk segment files, absorbing
//! high-rate writes while answering latest-value and range queries per
//! symbol.
//!
//! # Components
//!
//! - [`StorageEngine`]: the façade routing writes, flushes, and merged reads
//! - [`MemoryTier`]: per-symbol sorted, de-duplicated in-memory buffers
//! - [`SegmentStore`]: on-disk segment files plus their in-memory index
//! - [`GorillaCodec`]: delta-of-delta / XOR compression for segment payloads
//! - [`analytics`]: pure numerical kernels over tick values
//!
//! # Example
//!
//! ```rust,ignore
//! use tickstore::{EngineConfig, Point, StorageEngine};
//!
//! let engine = StorageEngine::open(EngineConfig::new("/var/lib/ticks"))?;
//!
//! engine.write_point(Point::new("AAPL", now_us, 187.32))?;
//! engine.flush()?;
//!
//! let ticks = engine.read_range("AAPL", day_start_us, day_end_us)?;
//! let latest = engine.get_latest("AAPL")?;
//! ```

#![deny(missing_docs)]

pub mod analytics;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::codec::{GorillaCodec, PointCodec};
pub use store::engine::{EngineConfig, EngineStats, StorageEngine};
pub use store::memory::MemoryTier;
pub use store::segment::{SegmentInfo, SegmentStore, SegmentStoreConfig, COMPACTION_CHUNK};
pub use store::{Point, TimeRange, Timestamp};
