//! Batch membership lookup: computes `mix_split` for four keys at a time
//! before touching memory, so the three dependent loads per key can issue
//! back to back instead of waiting on a scalar hash chain. The gather
//! itself stays scalar -- there is no hardware gather cheap enough for
//! three random 1-byte loads per key to beat a plain loop.
//!
//! CPU feature detection is kept here, the same shape as other runtime-
//! dispatched code in this workspace: detect once, cache the result, fall
//! back to the portable path when the detected feature doesn't help.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hash::{fingerprint, mix_split, segment_indices};
use crate::BinaryFuse8;

static WIDE_LANES_CHECKED: AtomicBool = AtomicBool::new(false);
static WIDE_LANES_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Whether the 4-lane batch path is worth taking on this host. Cached
/// after the first call; the answer can't change at runtime.
fn wide_lanes_available() -> bool {
    if !WIDE_LANES_CHECKED.load(Ordering::Relaxed) {
        #[cfg(target_arch = "x86_64")]
        let available = std::is_x86_feature_detected!("sse2");
        #[cfg(not(target_arch = "x86_64"))]
        let available = true;

        WIDE_LANES_AVAILABLE.store(available, Ordering::Relaxed);
        WIDE_LANES_CHECKED.store(true, Ordering::Relaxed);
    }
    WIDE_LANES_AVAILABLE.load(Ordering::Relaxed)
}

impl BinaryFuse8 {
    /// Tests membership of `keys`, writing one bool per key into `results`.
    /// `results` must be at least as long as `keys`. Matches `contain`
    /// element-wise.
    pub fn contain_batch(&self, keys: &[u64], results: &mut [bool]) {
        assert!(results.len() >= keys.len());
        if wide_lanes_available() {
            self.contain_batch_wide(keys, results);
        } else {
            self.contain_batch_scalar(keys, results);
        }
    }

    fn contain_batch_scalar(&self, keys: &[u64], results: &mut [bool]) {
        for (key, slot) in keys.iter().zip(results.iter_mut()) {
            *slot = self.contain(*key);
        }
    }

    /// Computes `mix_split` for four keys up front (independent, so the
    /// scalar multiplies pipeline), then does the three dependent gathers
    /// per key and the fingerprint compare.
    fn contain_batch_wide(&self, keys: &[u64], results: &mut [bool]) {
        let full_chunks = keys.len() / 4;

        for chunk in 0..full_chunks {
            let base = chunk * 4;
            let h = [
                mix_split(keys[base], self.seed),
                mix_split(keys[base + 1], self.seed),
                mix_split(keys[base + 2], self.seed),
                mix_split(keys[base + 3], self.seed),
            ];
            for lane in 0..4 {
                let (h0, h1, h2) = segment_indices(
                    h[lane],
                    self.segment_len,
                    self.segment_mask,
                    self.segment_count_minus_2,
                );
                let xor_all = self.fingerprints[h0 as usize]
                    ^ self.fingerprints[h1 as usize]
                    ^ self.fingerprints[h2 as usize];
                results[base + lane] = fingerprint(h[lane]) == xor_all;
            }
        }

        for i in (full_chunks * 4)..keys.len() {
            results[i] = self.contain(keys[i]);
        }
    }
}
