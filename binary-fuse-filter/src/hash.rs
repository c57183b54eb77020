//! The avalanche finalizer and per-key index derivation shared by
//! construction and lookup. Every constant here is wire-contract-relevant:
//! changing them changes which filter a given `(seed, keys)` pair produces.

/// `murmur3`-style 64-bit finalizer. Bit-exact: the two multiplier
/// constants must never change, or filters built by one version would
/// silently stop matching lookups performed by another.
#[inline]
pub fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[inline]
pub fn mix_split(key: u64, seed: u64) -> u64 {
    mix(key ^ seed)
}

/// Low byte of `h XOR (h >> 32)`. The 8-bit fingerprint stored per slot.
#[inline]
pub fn fingerprint(h: u64) -> u8 {
    (h ^ (h >> 32)) as u8
}

/// Maps a key hash to its three candidate slots. `segment_mask` is always
/// `segment_len - 1` (segment_len is a power of two); `segment_count_minus_2`
/// is `capacity / segment_len - 2`, the width of the valid base-segment
/// window.
#[inline]
pub fn segment_indices(
    h: u64,
    segment_len: u32,
    segment_mask: u32,
    segment_count_minus_2: u32,
) -> (u32, u32, u32) {
    // 128-bit multiply-high: picks a uniformly distributed base segment in
    // [0, segment_count_minus_2] without a modulo or floating point.
    let base = (((h as u128) * (segment_count_minus_2 as u128)) >> 64) as u32;
    let h0 = base * segment_len + (h as u32 & segment_mask);
    let h1 = (base + 1) * segment_len + ((h >> 21) as u32 & segment_mask);
    let h2 = (base + 2) * segment_len + ((h >> 42) as u32 & segment_mask);
    (h0, h1, h2)
}
