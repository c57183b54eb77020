//! Peeling construction: the hypergraph-peeling algorithm that assigns
//! every key's fingerprint to exactly one of its three candidate slots. See
//! the degree/xor-sum scratch description in the crate-level design notes.

use crate::hash::{fingerprint, mix_split, segment_indices};
use crate::{BinaryFuse8, Error};

/// Power-of-two ring buffer of slot indices awaiting peeling. Reused across
/// construction attempts so retries don't reallocate.
struct RingQueue {
    buf: Vec<u32>,
    mask: u32,
    head: u32,
    tail: u32,
}

impl RingQueue {
    fn with_capacity(min_capacity: u32) -> Self {
        let size = min_capacity.next_power_of_two().max(1);
        RingQueue {
            buf: vec![0; size as usize],
            mask: size - 1,
            head: 0,
            tail: 0,
        }
    }

    fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    fn push(&mut self, value: u32) {
        self.buf[(self.tail & self.mask) as usize] = value;
        self.tail = self.tail.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<u32> {
        if self.head == self.tail {
            None
        } else {
            let v = self.buf[(self.head & self.mask) as usize];
            self.head = self.head.wrapping_add(1);
            Some(v)
        }
    }
}

/// Reusable construction scratch: degree counters, per-slot xor-sum of
/// mapped hashes, the assignment stack, and the peeling ring queue. Owned
/// by the construction loop and cleared (not reallocated) between retries.
struct Scratch {
    degree: Vec<u8>,
    xor_sum: Vec<u64>,
    stack: Vec<(u64, u8)>,
    queue: RingQueue,
}

impl Scratch {
    fn new(capacity: u32, key_count: usize) -> Self {
        Scratch {
            degree: vec![0u8; capacity as usize],
            xor_sum: vec![0u64; capacity as usize],
            stack: Vec::with_capacity(key_count),
            queue: RingQueue::with_capacity(capacity),
        }
    }

    fn reset(&mut self) {
        self.degree.iter_mut().for_each(|d| *d = 0);
        self.xor_sum.iter_mut().for_each(|x| *x = 0);
        self.stack.clear();
        self.queue.clear();
    }
}

const MAX_ATTEMPTS: u32 = 100;

/// Attempts one peeling round with `seed`. Returns the assignment stack on
/// success (every key was peeled, in peel order) or `None` on a cycle.
fn try_peel(
    keys: &[u64],
    seed: u64,
    segment_len: u32,
    segment_mask: u32,
    segment_count_minus_2: u32,
    scratch: &mut Scratch,
) -> bool {
    scratch.reset();

    for &key in keys {
        let h = mix_split(key, seed);
        let (h0, h1, h2) = segment_indices(h, segment_len, segment_mask, segment_count_minus_2);
        for i in [h0, h1, h2] {
            scratch.degree[i as usize] += 1;
            scratch.xor_sum[i as usize] ^= h;
        }
    }

    for (i, &d) in scratch.degree.iter().enumerate() {
        if d == 1 {
            scratch.queue.push(i as u32);
        }
    }

    while let Some(i) = scratch.queue.pop() {
        if scratch.degree[i as usize] != 1 {
            continue; // stale entry: i was re-touched after being enqueued.
        }
        let h = scratch.xor_sum[i as usize];
        let (h0, h1, h2) = segment_indices(h, segment_len, segment_mask, segment_count_minus_2);
        let which = if i == h0 {
            0
        } else if i == h1 {
            1
        } else {
            debug_assert_eq!(i, h2);
            2
        };
        scratch.stack.push((h, which));
        for idx in [h0, h1, h2] {
            scratch.degree[idx as usize] -= 1;
            scratch.xor_sum[idx as usize] ^= h;
            if scratch.degree[idx as usize] == 1 {
                scratch.queue.push(idx);
            }
        }
    }

    scratch.stack.len() == keys.len()
}

/// Builds a filter from `keys`, retrying with a freshly derived seed on
/// every peeling failure (a hypergraph cycle, most often caused by
/// duplicate keys). `next_seed` is called once per attempt.
pub fn build(
    keys: &[u64],
    segment_len: u32,
    segment_mask: u32,
    segment_count_minus_2: u32,
    capacity: u32,
    mut next_seed: impl FnMut(u32) -> u64,
) -> Result<BinaryFuse8, Error> {
    let mut scratch = Scratch::new(capacity, keys.len());

    for attempt in 0..MAX_ATTEMPTS {
        let seed = next_seed(attempt);
        let peeled = try_peel(
            keys,
            seed,
            segment_len,
            segment_mask,
            segment_count_minus_2,
            &mut scratch,
        );
        if !peeled {
            tracing::warn!(attempt, "binary fuse peeling hit a cycle, retrying");
            continue;
        }

        let mut fingerprints = vec![0u8; capacity as usize];
        for &(h, which) in scratch.stack.iter().rev() {
            let (h0, h1, h2) =
                segment_indices(h, segment_len, segment_mask, segment_count_minus_2);
            let slots = [h0, h1, h2];
            let target = slots[which as usize] as usize;
            let fp = fingerprint(h);
            let xor_all = fingerprints[h0 as usize] ^ fingerprints[h1 as usize] ^ fingerprints[h2 as usize];
            fingerprints[target] = fp ^ xor_all;
        }

        tracing::debug!(attempt, "binary fuse construction converged");
        return Ok(BinaryFuse8 {
            seed,
            segment_len,
            segment_mask,
            segment_count_minus_2,
            fingerprints,
        });
    }

    Err(Error::ConstructionFailed {
        attempts: MAX_ATTEMPTS,
    })
}
