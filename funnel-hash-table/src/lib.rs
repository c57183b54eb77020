//! An open-addressed hash table built around funnel hashing: a cascade of
//! shrinking levels, each probed once per lookup, backed by two overflow
//! strategies for the rare key that falls through every level. Unlike
//! classic linear or quadratic probing, a funnel table never reorders
//! existing entries to make room for a new one -- insertion either finds
//! room along a key's own probe path or the table grows.
//!
//! The `delta` parameter passed to [`FunnelTable::with_capacity`] is the
//! fraction of the table's nominal capacity held back as slack. Smaller
//! `delta` packs the table tighter at the cost of a deeper level cascade
//! (`alpha`) and larger buckets (`beta`); both are derived from `delta`
//! rather than chosen directly.

mod hash;
mod layout;

use std::hash::Hash;

use layout::Layout;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capacity must be a power of two no smaller than 8, got {0}")]
    InvalidCapacity(usize),
    #[error("failed to grow the table after 8 rehash attempts")]
    AllocError,
}

/// Outcome of a single [`FunnelTable::set`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Filled,
    Tombstone,
}

/// A funnel-hashed open-addressing table mapping `K` to `V`.
///
/// Keys are hashed structurally: anything implementing [`Hash`] works,
/// and two keys that hash and compare equal are treated as the same
/// entry regardless of their concrete byte layout.
#[derive(Debug)]
pub struct FunnelTable<K, V> {
    seed: u64,
    delta: f64,
    capacity: usize,
    len: usize,
    tombstones: usize,
    layout: Layout,
    states: Vec<SlotState>,
    hashes: Vec<u64>,
    entries: Vec<Option<(K, V)>>,
}

enum ProbeOutcome {
    Found(usize),
    NotFound,
}

impl<K, V> FunnelTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates an empty table. `capacity` must be a power of two `>= 8`;
    /// `delta` is the slack fraction in `(0, 1)` and is clamped into a
    /// safe range if given outside it.
    pub fn with_capacity(capacity: usize, delta: f64) -> Result<Self, Error> {
        Self::with_capacity_and_seed(capacity, delta, 0x9E37_79B9_7F4A_7C15)
    }

    /// Like [`Self::with_capacity`], but with an explicit seed so the
    /// resulting bucket assignment is reproducible.
    pub fn with_capacity_and_seed(capacity: usize, delta: f64, seed: u64) -> Result<Self, Error> {
        if capacity < 8 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }
        let layout = layout::build(capacity, delta);
        let total = layout.total_slots;
        Ok(FunnelTable {
            seed,
            delta,
            capacity,
            len: 0,
            tombstones: 0,
            layout,
            states: vec![SlotState::Empty; total],
            hashes: vec![0u64; total],
            entries: (0..total).map(|_| None).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes every entry without shrinking the backing allocation.
    pub fn clear(&mut self) {
        for state in self.states.iter_mut() {
            *state = SlotState::Empty;
        }
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
        self.len = 0;
        self.tombstones = 0;
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let base_hash = hash::hash_key(key, self.seed);
        match self.probe(base_hash, key) {
            ProbeOutcome::Found(slot) => self.entries[slot].as_ref().map(|(_, v)| v),
            ProbeOutcome::NotFound => None,
        }
    }

    /// Inserts `key` with `value`, replacing any existing value for an
    /// equal key. Internally retries through [`Self::grow_and_rebuild`]
    /// if every probed slot along the key's path is occupied, so callers
    /// never observe a bare insertion failure.
    pub fn set(&mut self, key: K, value: V) -> Result<InsertResult, Error> {
        let base_hash = hash::hash_key(&key, self.seed);
        if let ProbeOutcome::Found(slot) = self.probe(base_hash, &key) {
            self.entries[slot] = Some((key, value));
            return Ok(InsertResult::Replaced);
        }

        loop {
            // `self.seed` may change underneath us on each iteration:
            // `grow_and_rebuild` can install a freshly reseeded table, so
            // the hash has to be recomputed against whatever seed is
            // current before probing it, not reused from before the grow.
            let base_hash = hash::hash_key(&key, self.seed);
            if let Some(slot) = self.find_empty_slot(base_hash) {
                if self.states[slot] == SlotState::Tombstone {
                    self.tombstones -= 1;
                }
                self.states[slot] = SlotState::Filled;
                self.hashes[slot] = base_hash;
                self.entries[slot] = Some((key, value));
                self.len += 1;
                return Ok(InsertResult::Inserted);
            }
            self.grow_and_rebuild()?;
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let base_hash = hash::hash_key(key, self.seed);
        if let ProbeOutcome::Found(slot) = self.probe(base_hash, key) {
            self.states[slot] = SlotState::Tombstone;
            self.entries[slot] = None;
            self.len -= 1;
            self.tombstones += 1;
            true
        } else {
            false
        }
    }

    /// Scans every level bucket and both overflow regions along `key`'s
    /// probe path, returning the slot holding a matching key if any.
    /// Empty slots never terminate the scan except in overflow B's linear
    /// probe, where a gap means nothing further down that probe sequence
    /// could have been placed there.
    fn probe(&self, base_hash: u64, key: &K) -> ProbeOutcome {
        for (i, level) in self.layout.levels.iter().enumerate() {
            let hi = hash::level_hash(base_hash, i);
            let bucket = hash::bucket_index(hi, level.bucket_count);
            let base = level.start + bucket * level.bucket_size;
            if let Some(slot) = self.scan_bucket(base, level.bucket_size, base_hash, key) {
                return ProbeOutcome::Found(slot);
            }
        }

        let ob = &self.layout.overflow_b;
        let (h1, h2) = hash::overflow_b_hashes(base_hash);
        for step in 0..ob.probe_limit {
            let idx = ob.start + ((h1.wrapping_add(h2.wrapping_mul(step as u64)) as usize) % ob.size);
            match self.states[idx] {
                SlotState::Empty => break,
                SlotState::Filled => {
                    if self.hashes[idx] == base_hash {
                        if let Some((k, _)) = &self.entries[idx] {
                            if k == key {
                                return ProbeOutcome::Found(idx);
                            }
                        }
                    }
                }
                SlotState::Tombstone => {}
            }
        }

        let oc = &self.layout.overflow_c;
        let (c1, c2) = hash::overflow_c_hashes(base_hash);
        for bucket_hash in [c1, c2] {
            let bucket = hash::bucket_index(bucket_hash, oc.bucket_count);
            let base = oc.start + bucket * oc.bucket_size;
            if let Some(slot) = self.scan_bucket(base, oc.bucket_size, base_hash, key) {
                return ProbeOutcome::Found(slot);
            }
        }

        ProbeOutcome::NotFound
    }

    fn scan_bucket(&self, base: usize, size: usize, base_hash: u64, key: &K) -> Option<usize> {
        for slot in base..base + size {
            if self.states[slot] == SlotState::Filled && self.hashes[slot] == base_hash {
                if let Some((k, _)) = &self.entries[slot] {
                    if k == key {
                        return Some(slot);
                    }
                }
            }
        }
        None
    }

    /// Finds a slot to place a brand-new key in: the first tombstone seen
    /// in a bucket if any, else the first empty slot, preferring levels
    /// in order before falling back to the two overflow regions. Returns
    /// `None` only when every level bucket is fully occupied and both
    /// overflow regions are exhausted, signalling the caller to grow the
    /// table.
    fn find_empty_slot(&mut self, base_hash: u64) -> Option<usize> {
        for (i, level) in self.layout.levels.iter().enumerate() {
            let hi = hash::level_hash(base_hash, i);
            let bucket = hash::bucket_index(hi, level.bucket_count);
            let base = level.start + bucket * level.bucket_size;
            if let Some(slot) = self.claim_in_bucket(base, level.bucket_size) {
                return Some(slot);
            }
        }

        let ob = self.layout.overflow_b;
        let (h1, h2) = hash::overflow_b_hashes(base_hash);
        let mut tombstone_slot = None;
        for step in 0..ob.probe_limit {
            let idx = ob.start + ((h1.wrapping_add(h2.wrapping_mul(step as u64)) as usize) % ob.size);
            match self.states[idx] {
                SlotState::Empty => {
                    return Some(tombstone_slot.unwrap_or(idx));
                }
                SlotState::Tombstone => {
                    if tombstone_slot.is_none() {
                        tombstone_slot = Some(idx);
                    }
                }
                SlotState::Filled => {}
            }
        }
        if let Some(slot) = tombstone_slot {
            return Some(slot);
        }

        let oc = self.layout.overflow_c;
        let (c1, c2) = hash::overflow_c_hashes(base_hash);
        let bucket1 = hash::bucket_index(c1, oc.bucket_count);
        let bucket2 = hash::bucket_index(c2, oc.bucket_count);
        let base1 = oc.start + bucket1 * oc.bucket_size;
        let base2 = oc.start + bucket2 * oc.bucket_size;
        let (first, second) = if self.bucket_load(base1, oc.bucket_size) <= self.bucket_load(base2, oc.bucket_size)
        {
            (base1, base2)
        } else {
            (base2, base1)
        };
        if let Some(slot) = self.claim_in_bucket(first, oc.bucket_size) {
            return Some(slot);
        }
        self.claim_in_bucket(second, oc.bucket_size)
    }

    /// Finds a slot to claim within one bucket: the first tombstone seen,
    /// reused only once an `Empty` slot is also found later in the same
    /// bucket. A bucket that is fully `Filled`/`Tombstone` with no `Empty`
    /// at all has no room and must fall through to the next level (§4.7
    /// Pass 2), so this returns `None` in that case even if a tombstone
    /// was seen.
    fn claim_in_bucket(&self, base: usize, size: usize) -> Option<usize> {
        let mut tombstone_slot = None;
        for slot in base..base + size {
            match self.states[slot] {
                SlotState::Empty => return Some(tombstone_slot.unwrap_or(slot)),
                SlotState::Tombstone => {
                    if tombstone_slot.is_none() {
                        tombstone_slot = Some(slot);
                    }
                }
                SlotState::Filled => {}
            }
        }
        None
    }

    fn bucket_load(&self, base: usize, size: usize) -> usize {
        self.states[base..base + size]
            .iter()
            .filter(|s| **s == SlotState::Filled)
            .count()
    }

    /// Rebuilds the table at double its current capacity, reinserting
    /// every live entry. Tries up to 8 candidate seeds, since occasional
    /// seeds make a subset of keys unplaceable even at the larger
    /// capacity; restores the table to its pre-call state verbatim if all
    /// 8 fail.
    fn grow_and_rebuild(&mut self) -> Result<(), Error> {
        let new_capacity = self.capacity.checked_mul(2).ok_or(Error::AllocError)?;
        tracing::debug!(
            old_capacity = self.capacity,
            new_capacity,
            "funnel table is full along every probed path, rebuilding at double capacity"
        );
        let mut attempt_seed = self.seed;

        for attempt in 0..8u32 {
            let candidate_seed = if attempt == 0 {
                attempt_seed
            } else {
                hash::mix(attempt_seed ^ attempt as u64)
            };
            let mut candidate =
                FunnelTable::with_capacity_and_seed(new_capacity, self.delta, candidate_seed)?;

            let mut ok = true;
            'reinsert: for slot in 0..self.states.len() {
                if self.states[slot] == SlotState::Filled {
                    let (key, value) = self.entries[slot].clone().expect("filled slot has an entry");
                    let base_hash = hash::hash_key(&key, candidate.seed);
                    let Some(dest) = candidate.find_empty_slot(base_hash) else {
                        ok = false;
                        break 'reinsert;
                    };
                    if candidate.states[dest] == SlotState::Tombstone {
                        candidate.tombstones -= 1;
                    }
                    candidate.states[dest] = SlotState::Filled;
                    candidate.hashes[dest] = base_hash;
                    candidate.entries[dest] = Some((key, value));
                    candidate.len += 1;
                }
            }

            if ok {
                *self = candidate;
                return Ok(());
            }

            tracing::warn!(attempt, "funnel table rebuild attempt failed, retrying with a new seed");
            attempt_seed = hash::mix(attempt_seed ^ (attempt as u64 + 1));
        }

        Err(Error::AllocError)
    }
}
