//! On-disk segment files and their in-memory index.
//!
//! A segment is an immutable file holding one timestamp-sorted run of points
//! for a single symbol. The [`SegmentStore`] owns every segment under one
//! data directory, rebuilds its index by scanning that directory on startup,
//! and rewrites segments during compaction.
//!
//! ## File structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (32 bytes)                                          │
//! │  - start_time  : i64   µs since epoch, first point          │
//! │  - end_time    : i64   µs since epoch, last point           │
//! │  - num_points  : u64                                        │
//! │  - compressed  : u8    0 or 1                               │
//! │  - reserved    : 7 bytes, zero (future format version)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  payload_len   : u64                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  payload       : u8[payload_len]                            │
//! │  - compressed == 1: codec frame over (timestamp, value)     │
//! │  - compressed == 0: fixed records, each                     │
//! │      timestamp : i64, value : f64,                          │
//! │      symbol_len: u32, symbol : u8[symbol_len]               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Compressed segments carry the symbol only
//! in the file name, since every point in a segment shares it by
//! construction.
//!
//! ## File naming
//!
//! `<symbol>_<segment_id>.seg`, where the symbol component is restricted to
//! `[A-Za-z0-9.-]`; any other byte (notably `_`, which delimits the id) is
//! escaped as `%XX` uppercase hex.

use crate::error::{Result, StoreError};
use crate::store::codec::{GorillaCodec, PointCodec};
use crate::store::{Point, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Segment file extension.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Points per segment written during compaction.
pub const COMPACTION_CHUNK: usize = 10_000;

/// Configuration for a [`SegmentStore`].
#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    /// Compress payloads through the codec (default true). When false,
    /// points are stored as fixed records.
    pub enable_compression: bool,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
        }
    }
}

/// Metadata for one on-disk segment.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Monotonic per-symbol identifier; no meaning beyond disambiguation.
    pub segment_id: u64,
    /// Timestamp of the first point (inclusive).
    pub start_time: Timestamp,
    /// Timestamp of the last point (inclusive).
    pub end_time: Timestamp,
    /// Number of points in the payload.
    pub num_points: u64,
    /// Path of the segment file.
    pub path: PathBuf,
    /// Whether the payload went through the codec.
    pub compressed: bool,
}

/// Fixed-size segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Timestamp of the first point (inclusive).
    pub start_time: Timestamp,
    /// Timestamp of the last point (inclusive).
    pub end_time: Timestamp,
    /// Number of points in the payload.
    pub num_points: u64,
    /// Whether the payload went through the codec.
    pub compressed: bool,
}

impl SegmentHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.start_time.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())?;
        writer.write_all(&self.num_points.to_le_bytes())?;
        writer.write_all(&[u8::from(self.compressed)])?;
        // Reserved, kept zero for a future format version byte.
        writer.write_all(&[0u8; 7])?;
        Ok(())
    }

    /// Reads a header using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns `CorruptSegment` when the compressed flag is out of range.
    /// Reserved bytes are ignored for forward compatibility.
    pub fn read_from<R: Read>(reader: &mut R, path: &Path) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let start_time = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let end_time = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let num_points = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let compressed = match buf[24] {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::CorruptSegment {
                    path: path.to_path_buf(),
                    reason: format!("invalid compressed flag {other}"),
                })
            }
        };

        Ok(Self {
            start_time,
            end_time,
            num_points,
            compressed,
        })
    }
}

/// Durable store of per-symbol segment files under one data directory.
pub struct SegmentStore {
    dir: PathBuf,
    config: SegmentStoreConfig,
    codec: Box<dyn PointCodec>,
    /// `symbol -> segment_id -> info`, ids ascending by arrival.
    index: RwLock<HashMap<String, BTreeMap<u64, SegmentInfo>>>,
}

impl SegmentStore {
    /// Opens a segment store over `dir`, creating the directory if needed
    /// and rebuilding the index from the segment files found there.
    ///
    /// Files that fail to parse are skipped with a warning; they never fail
    /// the open.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>, config: SegmentStoreConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            config,
            codec: Box::new(GorillaCodec),
            index: RwLock::new(HashMap::new()),
        };
        store.scan_directory()?;
        Ok(store)
    }

    /// Scans the data directory and registers every parseable segment.
    fn scan_directory(&self) -> Result<()> {
        let mut index = self.index.write();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }

            match self.load_segment_info(&path) {
                Ok((symbol, info)) => {
                    index.entry(symbol).or_default().insert(info.segment_id, info);
                }
                Err(err) => {
                    warn!("skipping unparseable segment {}: {err}", path.display());
                }
            }
        }

        let segments: usize = index.values().map(|m| m.len()).sum();
        debug!(
            "segment scan of {} found {} segments across {} symbols",
            self.dir.display(),
            segments,
            index.len()
        );
        Ok(())
    }

    /// Parses one segment file's name and header into its index entry.
    fn load_segment_info(&self, path: &Path) -> Result<(String, SegmentInfo)> {
        let (symbol, segment_id) =
            parse_segment_file_name(path).ok_or_else(|| StoreError::CorruptSegment {
                path: path.to_path_buf(),
                reason: "file name does not match <symbol>_<id>.seg".to_string(),
            })?;

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = SegmentHeader::read_from(&mut reader, path)?;
        let payload_len = read_u64(&mut reader)?;

        // A crashed write can leave a short file; reject it here so the
        // scan skips it instead of a later read failing.
        if (HEADER_SIZE as u64 + 8).saturating_add(payload_len) > file_len {
            return Err(StoreError::CorruptSegment {
                path: path.to_path_buf(),
                reason: format!("payload length {payload_len} exceeds file of {file_len} bytes"),
            });
        }

        let info = SegmentInfo {
            segment_id,
            start_time: header.start_time,
            end_time: header.end_time,
            num_points: header.num_points,
            path: path.to_path_buf(),
            compressed: header.compressed,
        };
        Ok((symbol, info))
    }

    /// Persists a batch of points, one new segment per symbol present.
    ///
    /// Each symbol group is sorted by timestamp with adjacent duplicates
    /// collapsed keeping the last occurrence, then written under the next
    /// free segment id for that symbol.
    ///
    /// # Errors
    ///
    /// Fails on the first group that cannot be persisted; earlier groups
    /// remain on disk, so the caller must treat any error as a failure of
    /// the whole batch.
    pub fn write_batch(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<&str, Vec<Point>> = HashMap::new();
        for point in points {
            grouped
                .entry(point.symbol.as_str())
                .or_default()
                .push(point.clone());
        }

        for (symbol, mut group) in grouped {
            group.sort_by_key(|p| p.timestamp);
            // Keep the most recent write for a repeated timestamp.
            dedup_keep_last(&mut group);

            let segment_id = {
                let index = self.index.read();
                index
                    .get(symbol)
                    .and_then(|segments| segments.keys().next_back())
                    .map_or(0, |max| max + 1)
            };

            let info = self.write_segment(symbol, segment_id, &group)?;
            self.index
                .write()
                .entry(symbol.to_string())
                .or_default()
                .insert(segment_id, info);
        }

        Ok(())
    }

    /// Writes one segment file through a temp-file + rename so a crash never
    /// leaves a half-written file under the final name.
    fn write_segment(&self, symbol: &str, segment_id: u64, points: &[Point]) -> Result<SegmentInfo> {
        let final_path = self.segment_path(symbol, segment_id);
        let tmp_path = final_path.with_extension(format!("{SEGMENT_EXTENSION}.tmp"));

        let info = self.write_segment_file(&tmp_path, &final_path, segment_id, points)?;

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.dir)?;
        debug!(
            "wrote segment {} ({} points)",
            final_path.display(),
            points.len()
        );
        Ok(info)
    }

    /// Writes the segment bytes to `tmp_path`; `final_path` only names the
    /// returned metadata.
    fn write_segment_file(
        &self,
        tmp_path: &Path,
        final_path: &Path,
        segment_id: u64,
        points: &[Point],
    ) -> Result<SegmentInfo> {
        let start_time = points.first().map_or(0, |p| p.timestamp);
        let end_time = points.last().map_or(0, |p| p.timestamp);
        let compressed = self.config.enable_compression;

        let payload = if compressed {
            let pairs: Vec<(Timestamp, f64)> =
                points.iter().map(|p| (p.timestamp, p.value)).collect();
            self.codec.encode(&pairs)
        } else {
            let mut payload = Vec::new();
            for point in points {
                payload.extend_from_slice(&point.timestamp.to_le_bytes());
                payload.extend_from_slice(&point.value.to_le_bytes());
                let symbol_bytes = point.symbol.as_bytes();
                payload.extend_from_slice(&(symbol_bytes.len() as u32).to_le_bytes());
                payload.extend_from_slice(symbol_bytes);
            }
            payload
        };

        let header = SegmentHeader {
            start_time,
            end_time,
            num_points: points.len() as u64,
            compressed,
        };

        let file = File::create(tmp_path)?;
        let mut writer = BufWriter::new(file);
        header.write_to(&mut writer)?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .sync_all()?;

        Ok(SegmentInfo {
            segment_id,
            start_time,
            end_time,
            num_points: points.len() as u64,
            path: final_path.to_path_buf(),
            compressed,
        })
    }

    /// Reads every point for `symbol` with `start <= timestamp < end`.
    ///
    /// Segment selection is conservative: any segment whose closed bounds
    /// touch the range is read fully and filtered. An unknown symbol yields
    /// an empty result.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and corrupt payloads from the selected
    /// segments.
    pub fn read_range(&self, symbol: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Point>> {
        let range = TimeRange::new(start, end);
        let selected: Vec<SegmentInfo> = {
            let index = self.index.read();
            match index.get(symbol) {
                Some(segments) => segments
                    .values()
                    .filter(|info| range.overlaps_closed(info.start_time, info.end_time))
                    .cloned()
                    .collect(),
                None => return Ok(Vec::new()),
            }
        };

        let mut points = Vec::new();
        for info in &selected {
            let segment_points = self.read_segment(symbol, info)?;
            points.extend(
                segment_points
                    .into_iter()
                    .filter(|p| range.contains(p.timestamp)),
            );
        }

        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Reads and decodes one whole segment.
    fn read_segment(&self, symbol: &str, info: &SegmentInfo) -> Result<Vec<Point>> {
        let file = File::open(&info.path)?;
        let mut reader = BufReader::new(file);
        let header = SegmentHeader::read_from(&mut reader, &info.path)?;
        let payload_len = read_u64(&mut reader)?;

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;

        if header.compressed {
            let pairs = self.codec.decode(&payload)?;
            Ok(pairs
                .into_iter()
                .map(|(ts, value)| Point::new(symbol, ts, value))
                .collect())
        } else {
            decode_fixed_records(&payload, header.num_points, &info.path)
        }
    }

    /// Rewrites every segment of `symbol` into sorted, duplicate-free chunks
    /// of [`COMPACTION_CHUNK`] points with fresh ids starting at 0.
    ///
    /// Replacement segments are staged as temp files first; the old files
    /// are only deleted once every chunk has been written, so a failure
    /// leaves the previous segment set untouched. On a repeated timestamp
    /// the occurrence from the highest old segment id wins, which is the
    /// most recently flushed write.
    ///
    /// # Errors
    ///
    /// Propagates read or write failures; the index is unchanged on error.
    pub fn compact(&self, symbol: &str) -> Result<()> {
        // Exclusive for the whole run: a concurrent write_batch must not
        // register a segment that the index swap below would orphan.
        let mut index = self.index.write();

        let old_segments: Vec<SegmentInfo> = match index.get(symbol) {
            Some(segments) => segments.values().cloned().collect(),
            None => return Ok(()),
        };

        // Ascending segment id is arrival order; the stable sort below keeps
        // it within equal timestamps so keep-last resolves to latest write.
        let mut points = Vec::new();
        for info in &old_segments {
            points.extend(self.read_segment(symbol, info)?);
        }
        points.sort_by_key(|p| p.timestamp);
        dedup_keep_last(&mut points);

        let mut staged: Vec<(PathBuf, PathBuf, SegmentInfo)> = Vec::new();
        let mut write_chunks = || -> Result<()> {
            for (segment_id, chunk) in (0u64..).zip(points.chunks(COMPACTION_CHUNK)) {
                let final_path = self.segment_path(symbol, segment_id);
                let tmp_path = final_path.with_extension(format!("{SEGMENT_EXTENSION}.tmp"));
                let info = self.write_segment_file(&tmp_path, &final_path, segment_id, chunk)?;
                staged.push((tmp_path, final_path, info));
            }
            Ok(())
        };

        if let Err(err) = write_chunks() {
            for (tmp_path, _, _) in &staged {
                let _ = fs::remove_file(tmp_path);
            }
            return Err(err);
        }

        // Point of no return: drop the old files, then move the staged
        // replacements onto their final names (an old id 0 would otherwise
        // collide with the new id 0).
        for info in &old_segments {
            fs::remove_file(&info.path)?;
        }

        let mut rebuilt = BTreeMap::new();
        for (tmp_path, final_path, info) in staged {
            fs::rename(&tmp_path, &final_path)?;
            rebuilt.insert(info.segment_id, info);
        }
        sync_dir(&self.dir)?;

        debug!(
            "compacted {symbol}: {} segments -> {} ({} points)",
            old_segments.len(),
            rebuilt.len(),
            points.len()
        );

        if rebuilt.is_empty() {
            index.remove(symbol);
        } else {
            index.insert(symbol.to_string(), rebuilt);
        }
        Ok(())
    }

    /// Compacts every known symbol. Per-symbol failures are logged and do
    /// not stop the remaining symbols.
    pub fn optimize(&self) {
        let symbols: Vec<String> = self.index.read().keys().cloned().collect();
        for symbol in symbols {
            if let Err(err) = self.compact(&symbol) {
                warn!("compaction of {symbol} failed, leaving segments as-is: {err}");
            }
        }
    }

    /// Sum of the file sizes of all indexed segments.
    pub fn storage_size(&self) -> u64 {
        let index = self.index.read();
        index
            .values()
            .flat_map(|segments| segments.values())
            .filter_map(|info| fs::metadata(&info.path).ok())
            .map(|meta| meta.len())
            .sum()
    }

    /// Returns the set of symbols with at least one segment.
    pub fn symbols(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Number of segments currently indexed for `symbol`.
    pub fn segment_count(&self, symbol: &str) -> usize {
        self.index.read().get(symbol).map_or(0, |s| s.len())
    }

    fn segment_path(&self, symbol: &str, segment_id: u64) -> PathBuf {
        self.dir.join(format!(
            "{}_{segment_id}.{SEGMENT_EXTENSION}",
            escape_symbol(symbol)
        ))
    }
}

/// Collapses adjacent points sharing a timestamp, keeping the last.
fn dedup_keep_last(points: &mut Vec<Point>) {
    let mut write = 0;
    for read in 0..points.len() {
        if read + 1 < points.len() && points[read + 1].timestamp == points[read].timestamp {
            continue;
        }
        points.swap(write, read);
        write += 1;
    }
    points.truncate(write);
}

/// Decodes the uncompressed fixed-record payload.
fn decode_fixed_records(payload: &[u8], num_points: u64, path: &Path) -> Result<Vec<Point>> {
    let mut points = Vec::with_capacity(num_points as usize);
    let mut offset = 0usize;

    for _ in 0..num_points {
        let record_err = |reason: &str| StoreError::CorruptSegment {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let fixed_end = offset
            .checked_add(20)
            .filter(|&end| end <= payload.len())
            .ok_or_else(|| record_err("record truncated"))?;
        let timestamp = i64::from_le_bytes(payload[offset..offset + 8].try_into().unwrap());
        let value = f64::from_le_bytes(payload[offset + 8..offset + 16].try_into().unwrap());
        let symbol_len =
            u32::from_le_bytes(payload[offset + 16..fixed_end].try_into().unwrap()) as usize;

        let symbol_end = fixed_end
            .checked_add(symbol_len)
            .filter(|&end| end <= payload.len())
            .ok_or_else(|| record_err("symbol truncated"))?;
        let symbol = std::str::from_utf8(&payload[fixed_end..symbol_end])
            .map_err(|_| record_err("symbol is not UTF-8"))?;

        points.push(Point::new(symbol, timestamp, value));
        offset = symbol_end;
    }

    Ok(points)
}

/// Escapes a symbol into the portable file-name alphabet `[A-Za-z0-9.-]`.
///
/// Any other byte, including `_` (the id delimiter) and `%` itself, becomes
/// `%XX` uppercase hex. The mapping is deterministic and reversible.
pub fn escape_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for &byte in symbol.as_bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverses [`escape_symbol`]. Returns `None` for malformed escapes.
pub fn unescape_symbol(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Parses `<escaped-symbol>_<id>.seg` into (symbol, segment id).
fn parse_segment_file_name(path: &Path) -> Option<(String, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let (escaped, id) = stem.rsplit_once('_')?;
    if escaped.is_empty() {
        return None;
    }
    let segment_id = id.parse().ok()?;
    let symbol = unescape_symbol(escaped)?;
    Some((symbol, segment_id))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Fsyncs a directory so renames within it survive a crash.
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
