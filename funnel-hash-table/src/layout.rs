//! Geometry of the backing store: how many levels, how big each level's
//! buckets are, and how the two overflow regions are sized. All of this
//! is derived once from `(capacity, delta)` and never changes except
//! across a [`crate::FunnelTable::grow_and_rebuild`] call, which rebuilds
//! the geometry from scratch at double the capacity.

/// One level's view into the flat backing arrays: `bucket_count` buckets
/// of `bucket_size` slots each, starting at `start`.
#[derive(Debug, Clone, Copy)]
pub struct Level {
    pub start: usize,
    pub bucket_size: usize,
    pub bucket_count: usize,
}

impl Level {
    #[inline]
    pub fn len(&self) -> usize {
        self.bucket_size * self.bucket_count
    }
}

/// Overflow region B: a single flat region probed with double hashing.
#[derive(Debug, Clone, Copy)]
pub struct OverflowB {
    pub start: usize,
    pub size: usize,
    pub probe_limit: usize,
}

/// Overflow region C: bucketed, probed with a two-choice scheme.
#[derive(Debug, Clone, Copy)]
pub struct OverflowC {
    pub start: usize,
    pub bucket_size: usize,
    pub bucket_count: usize,
}

impl OverflowC {
    #[inline]
    pub fn len(&self) -> usize {
        self.bucket_size * self.bucket_count
    }
}

/// The full backing-store geometry for a given `(capacity, delta)`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub alpha: usize,
    pub beta: usize,
    pub levels: Vec<Level>,
    pub overflow_b: OverflowB,
    pub overflow_c: OverflowC,
    pub total_slots: usize,
}

fn round_up(value: usize, multiple: usize) -> usize {
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + (multiple - rem)
    }
}

fn log2_f64(x: f64) -> f64 {
    x.max(1.0).log2()
}

/// `probe_limit = ceil(2 * log2(log2(n)))`, floored at 1 so a table never
/// ends up with an empty overflow-B probe sequence.
fn probe_limit(n: usize) -> usize {
    let inner = log2_f64(n as f64).max(2.0);
    let limit = (2.0 * log2_f64(inner)).ceil();
    limit.max(1.0) as usize
}

/// Builds the level cascade and overflow regions for `capacity` slots of
/// slack `delta`. `capacity` must already be validated as a power of two
/// `>= 8` by the caller.
pub fn build(capacity: usize, delta: f64) -> Layout {
    let delta = delta.clamp(1.0e-3, 0.999);
    let log2_inv_delta = (1.0 / delta).log2();

    let alpha = ((4.0 * log2_inv_delta) + 10.0).ceil().max(1.0) as usize;
    let beta = ((2.0 * log2_inv_delta).ceil() as usize).max(2);

    let mut levels = Vec::with_capacity(alpha);
    let mut offset = 0usize;
    for i in 0..alpha {
        let geometric = (0.75f64.powi(i as i32) * capacity as f64).ceil() as usize;
        let raw_size = geometric.max(beta);
        let size = round_up(raw_size, beta);
        levels.push(Level {
            start: offset,
            bucket_size: beta,
            bucket_count: size / beta,
        });
        offset += size;
    }

    // The two overflow regions share a budget proportional to the
    // table's own capacity; B gets a flat double-hashed region, C gets
    // bucketed two-choice placement so it can compare load between two
    // candidates.
    let overflow_budget = capacity.max(beta * 2);
    let overflow_b_size = overflow_budget.next_power_of_two().max(8);
    let overflow_b = OverflowB {
        start: offset,
        size: overflow_b_size,
        probe_limit: probe_limit(capacity),
    };
    offset += overflow_b.size;

    let overflow_c_bucket_count = (overflow_budget / beta).max(2);
    let overflow_c = OverflowC {
        start: offset,
        bucket_size: beta,
        bucket_count: overflow_c_bucket_count,
    };
    offset += overflow_c.len();

    Layout {
        alpha,
        beta,
        levels,
        overflow_b,
        overflow_c,
        total_slots: offset,
    }
}
