//! Key hashing and the per-level/per-probe derived hashes built on top of
//! it. Keys are hashed structurally via [`std::hash::Hash`] into an
//! xxHash64 state seeded per table, so byte slices, strings, and
//! fixed-size keys alike hash over their content bytes.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh64::Xxh64;

/// Hashes `key` using the table's seed. Content-equal keys always produce
/// the same hash regardless of their concrete type, since `Hash` itself is
/// what determines which bytes get fed to the hasher.
pub fn hash_key<K: Hash + ?Sized>(key: &K, seed: u64) -> u64 {
    let mut hasher = Xxh64::new(seed);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Same avalanche finalizer used by the peeling-construction sibling crate
/// in this workspace. Reused here to derive per-level and per-probe
/// hashes from a key's base hash without re-hashing the key itself.
#[inline]
pub fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// `h_i` for level `i`: the hash that selects this key's bucket within
/// level `i`'s bucket array.
#[inline]
pub fn level_hash(base_hash: u64, level: usize) -> u64 {
    mix(base_hash ^ level as u64)
}

/// Uniformly maps `h` into `[0, count)` via a 128-bit multiply-high,
/// avoiding a modulo.
#[inline]
pub fn bucket_index(h: u64, count: usize) -> usize {
    (((h as u128) * (count as u128)) >> 64) as usize
}

/// The two derived hashes used by overflow B's double-hashing probe
/// sequence: a start index hash and an odd step hash (forced odd so the
/// probe sequence covers a power-of-two-sized region fully).
#[inline]
pub fn overflow_b_hashes(base_hash: u64) -> (u64, u64) {
    let h1 = mix(base_hash ^ 0xB100_0000_0000_0001);
    let h2 = mix(base_hash ^ 0xB200_0000_0000_0002) | 1;
    (h1, h2)
}

/// The two candidate bucket hashes used by overflow C's two-choice scheme.
#[inline]
pub fn overflow_c_hashes(base_hash: u64) -> (u64, u64) {
    let h1 = mix(base_hash ^ 0xC100_0000_0000_0001);
    let h2 = mix(base_hash ^ 0xC200_0000_0000_0002);
    (h1, h2)
}
