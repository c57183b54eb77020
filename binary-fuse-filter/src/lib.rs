//! A binary fuse filter: a static, space-efficient probabilistic
//! set-membership structure built by peeling a 3-uniform hypergraph. Once
//! built, a filter never has false negatives for the keys it was built
//! from, and has a false-positive rate of roughly 1/256 for the 8-bit
//! fingerprint variant implemented here.
//!
//! Construction consumes the key set; the filter is immutable afterward.
//! Keys must be unique -- duplicate keys make the peeling step fail (see
//! [`Error::ConstructionFailed`]).

mod construct;
mod hash;
mod simd;

use rand::Rng;

/// Smallest and largest segment length this implementation will choose.
/// Segment length is always a power of two in this range.
const MIN_SEGMENT_LEN: u32 = 32;
const MAX_SEGMENT_LEN: u32 = 262_144;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("binary fuse construction did not converge after {attempts} attempts; keys are likely not unique")]
    ConstructionFailed { attempts: u32 },
}

/// An 8-bit-fingerprint binary fuse filter.
#[derive(Debug, Clone)]
pub struct BinaryFuse8 {
    seed: u64,
    segment_len: u32,
    segment_mask: u32,
    segment_count_minus_2: u32,
    fingerprints: Vec<u8>,
}

fn calculate_segment_len(n: usize) -> u32 {
    if n <= 1 {
        return MIN_SEGMENT_LEN;
    }
    let exponent = (n as f64).ln() / 3.33f64.ln() + 2.25;
    let log2_len = exponent
        .floor()
        .clamp(MIN_SEGMENT_LEN.ilog2() as f64, MAX_SEGMENT_LEN.ilog2() as f64) as u32;
    1u32 << log2_len
}

fn calculate_capacity(n: usize, segment_len: u32) -> u32 {
    let ratio = if n <= 1 {
        1.0
    } else {
        1_000_000f64.ln() / (n as f64).ln()
    };
    let size_factor = 0.875 + 0.25 * ratio.max(1.0);
    let mut capacity = (size_factor * n as f64).floor() as u32;

    let remainder = capacity % segment_len;
    if remainder != 0 {
        capacity += segment_len - remainder;
    }
    let min_capacity = segment_len.saturating_mul(3);
    if capacity < min_capacity {
        capacity = min_capacity;
    }
    capacity
}

impl BinaryFuse8 {
    /// Builds a filter over `keys`, which must be pairwise distinct.
    /// Retries construction with a freshly drawn seed, up to 100 times,
    /// should peeling fail to cover every key.
    pub fn try_new(keys: &[u64]) -> Result<Self, Error> {
        let mut rng = rand::thread_rng();
        Self::build(keys, move |_attempt| rng.gen())
    }

    /// Like [`Self::try_new`], but deterministic: every attempt's seed is
    /// derived from `seed` by the same avalanche finalizer used for
    /// hashing keys, so the same `(seed, keys)` pair always produces the
    /// same filter.
    pub fn try_new_with_seed(keys: &[u64], seed: u64) -> Result<Self, Error> {
        Self::build(keys, move |attempt| {
            hash::mix(seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        })
    }

    fn build(keys: &[u64], next_seed: impl FnMut(u32) -> u64) -> Result<Self, Error> {
        let segment_len = calculate_segment_len(keys.len());
        let segment_mask = segment_len - 1;
        let capacity = calculate_capacity(keys.len(), segment_len);
        let segment_count_minus_2 = capacity / segment_len - 2;

        construct::build(
            keys,
            segment_len,
            segment_mask,
            segment_count_minus_2,
            capacity,
            next_seed,
        )
    }

    /// Tests whether `key` is a member. Never false-negative for a key
    /// present at construction time; false-positive with probability
    /// approximately 1/256 for keys that were not.
    pub fn contain(&self, key: u64) -> bool {
        let h = hash::mix_split(key, self.seed);
        let (h0, h1, h2) = hash::segment_indices(
            h,
            self.segment_len,
            self.segment_mask,
            self.segment_count_minus_2,
        );
        hash::fingerprint(h)
            == self.fingerprints[h0 as usize]
                ^ self.fingerprints[h1 as usize]
                ^ self.fingerprints[h2 as usize]
    }

    /// Total slots backing this filter's fingerprint array.
    pub fn capacity(&self) -> u32 {
        self.fingerprints.len() as u32
    }

    /// Power-of-two segment length chosen for this filter.
    pub fn segment_len(&self) -> u32 {
        self.segment_len
    }
}
