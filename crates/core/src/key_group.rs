//! Key groups: the unit in which keyed state is partitioned and redistributed.
//!
//! A job has a fixed number of key groups (its maximum parallelism). Every key
//! hashes into exactly one key group, and every parallel instance owns one
//! contiguous [`KeyGroupRange`]. Rescaling only moves whole key groups between
//! instances, so the hash must be stable across processes and restarts. We
//! therefore do not use `DefaultHasher`; keys are fed through their `Hash`
//! impl into a buffering murmur3 hasher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Smallest maximum parallelism picked by [`compute_default_max_parallelism`].
pub const DEFAULT_LOWER_BOUND_MAX_PARALLELISM: u32 = 1 << 7;

/// Largest supported maximum parallelism.
pub const UPPER_BOUND_MAX_PARALLELISM: u32 = 1 << 15;

/// Errors raised when building ranges or computing rescaling assignments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyGroupError {
    #[error("invalid key group range: start {start} is after end {end}")]
    InvalidRange { start: u32, end: u32 },

    #[error("parallelism must be between 1 and 32768, got {0}")]
    InvalidParallelism(u32),

    #[error("maximum parallelism {max_parallelism} must not be smaller than parallelism {parallelism}")]
    ParallelismExceedsMax {
        max_parallelism: u32,
        parallelism: u32,
    },

    #[error("operator index {index} is out of bounds for parallelism {parallelism}")]
    OperatorIndexOutOfBounds { index: u32, parallelism: u32 },
}

// ============================================================================
// KeyGroupRange
// ============================================================================

/// Inclusive, contiguous range of key-group indices `[start, end]`.
///
/// A range with `end < start` is empty; [`KeyGroupRange::empty`] is the
/// canonical empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    start: u32,
    end: u32,
}

impl KeyGroupRange {
    /// Create the range `[start, end]`.
    pub fn of(start: u32, end: u32) -> Result<Self, KeyGroupError> {
        if start > end {
            return Err(KeyGroupError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The range containing no key groups.
    pub const fn empty() -> Self {
        Self { start: 1, end: 0 }
    }

    pub fn start_key_group(&self) -> u32 {
        self.start
    }

    pub fn end_key_group(&self) -> u32 {
        self.end
    }

    /// Number of key groups in the range.
    pub fn number_of_key_groups(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).saturating_add(1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, key_group: u32) -> bool {
        self.start <= key_group && key_group <= self.end
    }

    /// Key groups present in both ranges.
    pub fn intersection(&self, other: &KeyGroupRange) -> KeyGroupRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start <= end {
            KeyGroupRange { start, end }
        } else {
            KeyGroupRange::empty()
        }
    }

    /// Iterate the key-group indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl fmt::Display for KeyGroupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "KeyGroupRange{{empty}}")
        } else {
            write!(f, "KeyGroupRange{{start={}, end={}}}", self.start, self.end)
        }
    }
}

// ============================================================================
// Assignment
// ============================================================================

/// Assign a key to its key group.
///
/// # Panics
///
/// Panics if `max_parallelism` is zero.
pub fn assign_to_key_group<K: Hash + ?Sized>(key: &K, max_parallelism: u32) -> u32 {
    compute_key_group_for_key_hash(key_hash(key), max_parallelism)
}

/// Fold an already computed key hash into `[0, max_parallelism)`.
pub fn compute_key_group_for_key_hash(key_hash: u32, max_parallelism: u32) -> u32 {
    key_hash % max_parallelism
}

/// Stable 32-bit hash of a key.
pub fn key_hash<K: Hash + ?Sized>(key: &K) -> u32 {
    let mut hasher = KeyGroupHasher::default();
    key.hash(&mut hasher);
    hasher.finish32()
}

/// Index of the parallel operator instance that owns `key_group`.
pub fn compute_operator_index_for_key_group(
    max_parallelism: u32,
    parallelism: u32,
    key_group: u32,
) -> u32 {
    (u64::from(key_group) * u64::from(parallelism) / u64::from(max_parallelism)) as u32
}

/// Key-group range owned by the operator instance `operator_index`.
///
/// The ranges for indices `0..parallelism` are disjoint and together cover
/// `[0, max_parallelism)`.
pub fn compute_key_group_range_for_operator_index(
    max_parallelism: u32,
    parallelism: u32,
    operator_index: u32,
) -> Result<KeyGroupRange, KeyGroupError> {
    check_parallelism(parallelism)?;
    check_parallelism(max_parallelism)?;
    if max_parallelism < parallelism {
        return Err(KeyGroupError::ParallelismExceedsMax {
            max_parallelism,
            parallelism,
        });
    }
    if operator_index >= parallelism {
        return Err(KeyGroupError::OperatorIndexOutOfBounds {
            index: operator_index,
            parallelism,
        });
    }

    let max = u64::from(max_parallelism);
    let par = u64::from(parallelism);
    let index = u64::from(operator_index);
    let start = (index * max + par - 1) / par;
    let end = ((index + 1) * max - 1) / par;
    KeyGroupRange::of(start as u32, end as u32)
}

/// Default maximum parallelism for an operator: 1.5x the parallelism rounded
/// up to a power of two, clamped to the supported bounds.
pub fn compute_default_max_parallelism(operator_parallelism: u32) -> u32 {
    let scaled = operator_parallelism.saturating_add(operator_parallelism / 2);
    scaled
        .checked_next_power_of_two()
        .unwrap_or(UPPER_BOUND_MAX_PARALLELISM)
        .clamp(DEFAULT_LOWER_BOUND_MAX_PARALLELISM, UPPER_BOUND_MAX_PARALLELISM)
}

fn check_parallelism(parallelism: u32) -> Result<(), KeyGroupError> {
    if parallelism == 0 || parallelism > UPPER_BOUND_MAX_PARALLELISM {
        return Err(KeyGroupError::InvalidParallelism(parallelism));
    }
    Ok(())
}

// ============================================================================
// Hashing
// ============================================================================

/// Buffers everything a key writes through `Hash`, then runs murmur3-32 once.
///
/// Integers are fed as fixed-width little-endian bytes and `usize`/`isize`
/// (including slice length prefixes) as 64-bit values, so a key lands in the
/// same key group regardless of the host's endianness or pointer width.
#[derive(Default)]
struct KeyGroupHasher {
    buf: Vec<u8>,
}

macro_rules! write_le {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(&mut self, value: $ty) {
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl KeyGroupHasher {
    fn finish32(&self) -> u32 {
        murmur3_32(&self.buf, 0)
    }
}

impl Hasher for KeyGroupHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    write_le! {
        write_u8: u8,
        write_u16: u16,
        write_u32: u32,
        write_u64: u64,
        write_u128: u128,
        write_i8: i8,
        write_i16: i16,
        write_i32: i32,
        write_i64: i64,
        write_i128: i128,
    }

    fn write_usize(&mut self, value: usize) {
        self.write_u64(value as u64);
    }

    fn write_isize(&mut self, value: isize) {
        self.write_i64(value as i64);
    }

    fn finish(&self) -> u64 {
        u64::from(self.finish32())
    }
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= u32::from(*byte) << (8 * i);
        }
        h ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h ^= data.len() as u32;
    fmix32(h)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
