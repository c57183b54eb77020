// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! The segment manager: an ordered list of word-aligned, bump-allocated
//! buffers that back a message under construction, and the read-only
//! counterpart that a [`crate::message::Reader`] walks.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::message::{Allocator, ReaderOptions, ReaderSegments};
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, ErrorKind, Result};

/// The traversal-budget counter cell. Plain `Cell<u64>` by default; with the
/// `sync_reader` feature enabled this becomes an `AtomicU64` so a `Reader`
/// can be shared (read-only) across threads. Either way only
/// [`ReaderArena::charge_traversal`] ever touches it.
#[cfg(not(feature = "sync_reader"))]
type BudgetCell = core::cell::Cell<u64>;
#[cfg(feature = "sync_reader")]
type BudgetCell = core::sync::atomic::AtomicU64;

#[cfg(not(feature = "sync_reader"))]
fn budget_new(value: u64) -> BudgetCell {
    core::cell::Cell::new(value)
}
#[cfg(feature = "sync_reader")]
fn budget_new(value: u64) -> BudgetCell {
    core::sync::atomic::AtomicU64::new(value)
}

#[cfg(not(feature = "sync_reader"))]
fn budget_get(cell: &BudgetCell) -> u64 {
    cell.get()
}
#[cfg(feature = "sync_reader")]
fn budget_get(cell: &BudgetCell) -> u64 {
    cell.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(not(feature = "sync_reader"))]
fn budget_set(cell: &BudgetCell, value: u64) {
    cell.set(value)
}
#[cfg(feature = "sync_reader")]
fn budget_set(cell: &BudgetCell, value: u64) {
    cell.store(value, core::sync::atomic::Ordering::Relaxed)
}

/// Default size, in words, of the first segment created for a new message
/// when the caller doesn't override it.
pub const DEFAULT_FIRST_SEGMENT_WORDS: u32 = 1024;

/// One bump-allocated, word-aligned buffer of a message under construction.
pub struct Segment {
    pub id: u32,
    data: *mut u8,
    capacity_words: u32,
    used_words: u32,
}

impl Segment {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data, self.used_words as usize * BYTES_PER_WORD) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.data, self.used_words as usize * BYTES_PER_WORD)
        }
    }

    /// The full backing capacity, including bytes not yet bumped into use.
    /// Pointer targets are validated against this, not `used_words`, since a
    /// pointer may legally target content written after the pointer itself
    /// within the same bump allocation.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_words as usize * BYTES_PER_WORD
    }

    pub fn full_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data, self.capacity_bytes()) }
    }
}

/// An ordered collection of [`Segment`]s under construction, plus the
/// injected [`Allocator`] that owns their memory.
pub struct SegmentManager<A>
where
    A: Allocator,
{
    allocator: A,
    segments: Vec<Segment>,
}

impl<A> SegmentManager<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        SegmentManager {
            allocator,
            segments: Vec::new(),
        }
    }

    fn new_segment(&mut self, minimum_size: u32) -> usize {
        let (ptr, len_words) = self.allocator.allocate_segment(minimum_size);
        let id = self.segments.len() as u32;
        self.segments.push(Segment {
            id,
            data: ptr,
            capacity_words: len_words,
            used_words: 0,
        });
        self.segments.len() - 1
    }

    /// Bump-allocates `words` words, preferring `preferred_seg_id` if it
    /// still has room, then the most recently allocated segment, then
    /// falling back to a fresh segment sized to fit `words` (or the default
    /// first-segment size, whichever is larger).
    pub fn allocate(&mut self, preferred_seg_id: u32, words: u32) -> Result<(u32, u32)> {
        if let Some(seg) = self.segments.get_mut(preferred_seg_id as usize) {
            if seg.capacity_words - seg.used_words >= words {
                let offset = seg.used_words;
                seg.used_words += words;
                return Ok((seg.id, offset));
            }
        }
        if let Some(last) = self.segments.last_mut() {
            if last.id != preferred_seg_id && last.capacity_words - last.used_words >= words {
                let offset = last.used_words;
                last.used_words += words;
                let id = last.id;
                return Ok((id, offset));
            }
        }
        let idx = self.new_segment(core::cmp::max(words, DEFAULT_FIRST_SEGMENT_WORDS));
        let seg = &mut self.segments[idx];
        if seg.capacity_words < words {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                "allocator returned a segment smaller than requested",
            ));
        }
        let offset = seg.used_words;
        seg.used_words += words;
        Ok((seg.id, offset))
    }

    /// Remaining bump capacity, in words, of segment `seg_id`.
    pub fn remaining_in_segment(&self, seg_id: u32) -> u32 {
        self.segments
            .get(seg_id as usize)
            .map(|s| s.capacity_words - s.used_words)
            .unwrap_or(0)
    }

    pub fn get_segment(&self, id: u32) -> Result<&Segment> {
        self.segments
            .get(id as usize)
            .ok_or_else(|| Error::new(ErrorKind::PointerOutOfBounds, "segment id out of range"))
    }

    pub fn get_segment_mut(&mut self, id: u32) -> Result<&mut Segment> {
        self.segments
            .get_mut(id as usize)
            .ok_or_else(|| Error::new(ErrorKind::PointerOutOfBounds, "segment id out of range"))
    }

    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Frees every segment past index 0 and zeroes/resets segment 0's bump
    /// pointer, retaining its capacity for reuse.
    pub fn clear(&mut self) {
        for seg in self.segments.drain(1..) {
            let cap = seg.capacity_words;
            let ptr = seg.data;
            self.allocator.deallocate_segment(ptr, cap, seg.used_words);
        }
        if let Some(first) = self.segments.first_mut() {
            first.full_bytes_mut().fill(0);
            first.used_words = 0;
        }
    }

    pub fn output_segments(&self) -> Vec<&[u8]> {
        self.segments.iter().map(Segment::as_bytes).collect()
    }
}

impl<A> Drop for SegmentManager<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        for seg in self.segments.drain(..) {
            self.allocator
                .deallocate_segment(seg.data, seg.capacity_words, seg.used_words);
        }
    }
}

/// Object-safe facade over a [`SegmentManager`] so that [`private::layout`]
/// can address segments by id without being generic over the allocator type.
pub trait BuilderArena {
    fn allocate(&mut self, preferred_seg_id: u32, words: u32) -> Result<(u32, u32)>;
    fn remaining_in_segment(&self, seg_id: u32) -> u32;
    fn get_segment_bytes(&self, id: u32) -> Result<&[u8]>;
    fn get_segment_bytes_mut(&mut self, id: u32) -> Result<&mut [u8]>;
    fn num_segments(&self) -> u32;
    fn clear(&mut self);
    fn output_segments(&self) -> Vec<&[u8]>;
}

impl<A> BuilderArena for SegmentManager<A>
where
    A: Allocator,
{
    fn allocate(&mut self, preferred_seg_id: u32, words: u32) -> Result<(u32, u32)> {
        SegmentManager::allocate(self, preferred_seg_id, words)
    }

    fn remaining_in_segment(&self, seg_id: u32) -> u32 {
        SegmentManager::remaining_in_segment(self, seg_id)
    }

    fn get_segment_bytes(&self, id: u32) -> Result<&[u8]> {
        Ok(self.get_segment(id)?.as_bytes())
    }

    fn get_segment_bytes_mut(&mut self, id: u32) -> Result<&mut [u8]> {
        Ok(self.get_segment_mut(id)?.as_bytes_mut())
    }

    fn num_segments(&self) -> u32 {
        SegmentManager::num_segments(self)
    }

    fn clear(&mut self) {
        SegmentManager::clear(self)
    }

    fn output_segments(&self) -> Vec<&[u8]> {
        SegmentManager::output_segments(self)
    }
}

/// Shared handle to a [`BuilderArena`]. Builders carry a `(segment id, word
/// offset)` pair plus a clone of this handle rather than an aliasing
/// reference, matching the arena-plus-index ownership model used throughout
/// this crate.
pub type ArenaHandle = Rc<RefCell<dyn BuilderArena>>;

/// Wraps a concrete [`SegmentManager`] as a shared, type-erased arena handle.
pub fn make_arena_handle<A: Allocator + 'static>(manager: SegmentManager<A>) -> ArenaHandle {
    Rc::new(RefCell::new(manager))
}

/// A read-only view of the segments backing a [`crate::message::Reader`],
/// plus the traversal/nesting budget state shared by every pointer
/// dereference performed against it.
pub struct ReaderArena<S>
where
    S: ReaderSegments,
{
    segments: S,
    traversal_budget_words: BudgetCell,
    nesting_limit: i32,
}

impl<S> ReaderArena<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        ReaderArena {
            segments,
            traversal_budget_words: budget_new(
                options.traversal_limit_in_words.unwrap_or(u64::MAX as usize) as u64,
            ),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }

    pub fn get_segment(&self, id: u32) -> Result<&[u8]> {
        self.segments
            .get_segment(id)
            .ok_or_else(|| Error::new(ErrorKind::PointerOutOfBounds, "segment id out of range"))
    }

    /// Deducts `words` from the traversal budget, failing if that would
    /// drive it negative. This is the sole defence against amplification
    /// attacks where a small message claims to contain a huge tree.
    pub fn charge_traversal(&self, words: u64) -> Result<()> {
        let remaining = budget_get(&self.traversal_budget_words);
        if words > remaining {
            Err(Error::new(
                ErrorKind::TraversalLimitExceeded,
                "message traversed more words than the configured traversal limit",
            ))
        } else {
            budget_set(&self.traversal_budget_words, remaining - words);
            Ok(())
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}
