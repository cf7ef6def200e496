//! Compression codec for (timestamp, value) sequences.
//!
//! Segment payloads store ticks through a [`PointCodec`], a symmetric
//! encoder/decoder over `(timestamp, f64)` pairs. The production
//! implementation is [`GorillaCodec`]: delta-of-delta encoding for the
//! (strictly ascending) timestamps and XOR encoding for the values, the
//! combination that typically yields 5-10x on real tick streams.
//!
//! # Frame layout
//!
//! ```text
//! count       : u64 LE   number of encoded points
//! ts_len      : u64 LE   byte length of the timestamp bit stream
//! ts_stream   : u8[ts_len]
//! val_stream  : u8[..]   remainder of the buffer
//! ```
//!
//! Empty input encodes to an empty buffer, and an empty buffer decodes to an
//! empty sequence. Any other framing inconsistency fails with
//! [`StoreError::CorruptPayload`].
//!
//! # Timestamp encoding (delta-of-delta)
//!
//! - first timestamp: 64 bits raw
//! - delta-of-delta `0`: `'0'`
//! - `[-63, 64]`: `'10'` + 7 bits
//! - `[-255, 256]`: `'110'` + 9 bits
//! - `[-2047, 2048]`: `'1110'` + 12 bits
//! - else: `'1111'` + 32 bits
//!
//! # Value encoding (XOR)
//!
//! - first value: 64 bits raw (IEEE 754)
//! - XOR with previous = 0: `'0'`
//! - previous leading/trailing-zero window still fits: `'10'` + meaningful bits
//! - new window: `'11'` + 5 bits leading + 6 bits length + meaningful bits

use crate::error::{Result, StoreError};
use crate::store::Timestamp;
use bitvec::prelude::*;

/// Byte length of the frame prefix (count + timestamp stream length).
const FRAME_PREFIX_LEN: usize = 16;

/// A symmetric codec over (timestamp, value) sequences.
///
/// Implementations must be deterministic bijections: `decode(encode(p)) == p`
/// for every finite input, with values preserved bit-exactly.
pub trait PointCodec: Send + Sync {
    /// Encodes a sequence of (timestamp, value) pairs into an opaque blob.
    fn encode(&self, points: &[(Timestamp, f64)]) -> Vec<u8>;

    /// Decodes a blob produced by [`encode`](PointCodec::encode).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptPayload`] if the framing is inconsistent.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<(Timestamp, f64)>>;
}

/// Gorilla-style codec: delta-of-delta timestamps, XOR-compressed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct GorillaCodec;

impl PointCodec for GorillaCodec {
    fn encode(&self, points: &[(Timestamp, f64)]) -> Vec<u8> {
        if points.is_empty() {
            return Vec::new();
        }

        let mut ts_bits = BitVec::<u8, Msb0>::new();
        let mut val_bits = BitVec::<u8, Msb0>::new();
        let mut ts_enc = TimestampEncoder::new();
        let mut val_enc = ValueEncoder::new();

        for &(ts, val) in points {
            ts_enc.push(ts, &mut ts_bits);
            val_enc.push(val, &mut val_bits);
        }

        let ts_bytes = ts_bits.into_vec();
        let val_bytes = val_bits.into_vec();

        let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + ts_bytes.len() + val_bytes.len());
        out.extend_from_slice(&(points.len() as u64).to_le_bytes());
        out.extend_from_slice(&(ts_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&ts_bytes);
        out.extend_from_slice(&val_bytes);
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<(Timestamp, f64)>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        if bytes.len() < FRAME_PREFIX_LEN {
            return Err(StoreError::CorruptPayload(format!(
                "frame prefix truncated: {} bytes",
                bytes.len()
            )));
        }

        let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let ts_len = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let ts_end = FRAME_PREFIX_LEN
            .checked_add(ts_len as usize)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                StoreError::CorruptPayload(format!(
                    "timestamp stream length {} exceeds payload of {} bytes",
                    ts_len,
                    bytes.len()
                ))
            })?;

        let mut ts_dec = TimestampDecoder::new(&bytes[FRAME_PREFIX_LEN..ts_end]);
        let mut val_dec = ValueDecoder::new(&bytes[ts_end..]);

        let mut points = Vec::with_capacity(count as usize);
        for i in 0..count {
            let ts = ts_dec.next().ok_or_else(|| {
                StoreError::CorruptPayload(format!("timestamp stream ended at point {i} of {count}"))
            })?;
            let val = val_dec.next().ok_or_else(|| {
                StoreError::CorruptPayload(format!("value stream ended at point {i} of {count}"))
            })?;
            points.push((ts, val));
        }

        Ok(points)
    }
}

/// Cursor over an Msb0 bit stream with bounds-checked reads.
struct BitCursor<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bits: bytes.view_bits::<Msb0>(),
            pos: 0,
        }
    }

    fn take(&mut self) -> Option<bool> {
        let bit = *self.bits.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    /// Reads `n` bits (n <= 64) most-significant-first.
    fn take_bits(&mut self, n: usize) -> Option<u64> {
        if self.pos + n > self.bits.len() {
            return None;
        }
        let mut out = 0u64;
        for _ in 0..n {
            out = (out << 1) | u64::from(self.bits[self.pos]);
            self.pos += 1;
        }
        Some(out)
    }
}

/// Appends the low `n` bits of `value` most-significant-first.
fn push_bits(out: &mut BitVec<u8, Msb0>, value: u64, n: usize) {
    for i in (0..n).rev() {
        out.push((value >> i) & 1 == 1);
    }
}

/// Streaming delta-of-delta encoder for timestamps.
struct TimestampEncoder {
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    fn new() -> Self {
        Self {
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn push(&mut self, ts: Timestamp, out: &mut BitVec<u8, Msb0>) {
        if !self.started {
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            push_bits(out, ts as u64, 64);
            return;
        }

        let delta = ts - self.prev_ts;
        let dod = delta - self.prev_delta;

        if dod == 0 {
            out.push(false);
        } else if (-63..=64).contains(&dod) {
            push_bits(out, 0b10, 2);
            push_bits(out, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            push_bits(out, 0b110, 3);
            push_bits(out, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            push_bits(out, 0b1110, 4);
            push_bits(out, (dod + 2047) as u64, 12);
        } else {
            push_bits(out, 0b1111, 4);
            push_bits(out, dod as i32 as u32 as u64, 32);
        }

        self.prev_delta = delta;
        self.prev_ts = ts;
    }
}

/// Streaming delta-of-delta decoder for timestamps.
struct TimestampDecoder<'a> {
    cursor: BitCursor<'a>,
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: BitCursor::new(bytes),
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn next(&mut self) -> Option<Timestamp> {
        if !self.started {
            let raw = self.cursor.take_bits(64)?;
            self.started = true;
            self.prev_ts = raw as i64;
            self.prev_delta = 0;
            return Some(self.prev_ts);
        }

        let dod = if !self.cursor.take()? {
            0
        } else if !self.cursor.take()? {
            self.cursor.take_bits(7)? as i64 - 63
        } else if !self.cursor.take()? {
            self.cursor.take_bits(9)? as i64 - 255
        } else if !self.cursor.take()? {
            self.cursor.take_bits(12)? as i64 - 2047
        } else {
            self.cursor.take_bits(32)? as u32 as i32 as i64
        };

        let delta = self.prev_delta + dod;
        let ts = self.prev_ts + delta;
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Streaming XOR encoder for values.
struct ValueEncoder {
    started: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    fn new() -> Self {
        Self {
            started: false,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn push(&mut self, value: f64, out: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_bits = bits;
            push_bits(out, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_bits;
        self.prev_bits = bits;

        if xor == 0 {
            out.push(false);
            return;
        }

        let leading = xor.leading_zeros();
        let trailing = xor.trailing_zeros();

        if leading >= self.prev_leading && trailing >= self.prev_trailing {
            // Previous window still covers the meaningful bits.
            push_bits(out, 0b10, 2);
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            push_bits(out, xor >> self.prev_trailing, meaningful as usize);
        } else {
            // Leading zeros capped at 31 to fit the 5-bit field.
            let leading = leading.min(31);
            let meaningful = 64 - leading - trailing;
            push_bits(out, 0b11, 2);
            push_bits(out, leading as u64, 5);
            push_bits(out, (meaningful - 1) as u64, 6);
            push_bits(out, xor >> trailing, meaningful as usize);
            self.prev_leading = leading;
            self.prev_trailing = trailing;
        }
    }
}

/// Streaming XOR decoder for values.
struct ValueDecoder<'a> {
    cursor: BitCursor<'a>,
    started: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: BitCursor::new(bytes),
            started: false,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn next(&mut self) -> Option<f64> {
        if !self.started {
            let raw = self.cursor.take_bits(64)?;
            self.started = true;
            self.prev_bits = raw;
            return Some(f64::from_bits(raw));
        }

        let xor = if !self.cursor.take()? {
            0
        } else if !self.cursor.take()? {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            self.cursor.take_bits(meaningful as usize)? << self.prev_trailing
        } else {
            let leading = self.cursor.take_bits(5)? as u32;
            let meaningful = self.cursor.take_bits(6)? as u32 + 1;
            if leading + meaningful > 64 {
                return None;
            }
            let trailing = 64 - leading - meaningful;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.cursor.take_bits(meaningful as usize)? << trailing
        };

        self.prev_bits ^= xor;
        Some(f64::from_bits(self.prev_bits))
    }
}
