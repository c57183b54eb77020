// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! Untyped root container for a Cap'n Proto message: [`Reader`] for
//! traversing an existing message and [`Builder`] for constructing a new
//! one. Neither type assumes anything about the shape of the data beyond
//! what the caller asks for -- there is no generated schema layer here.

use alloc::vec::Vec;

use crate::private::arena::{make_arena_handle, ArenaHandle, ReaderArena, SegmentManager};
use crate::private::layout::{ListReader, StructBuilder, StructReader};
use crate::private::units::{ElementSize, BYTES_PER_WORD};
use crate::{Error, ErrorKind, OutputSegments, Result, Word};

/// Options controlling how a [`Reader`] enforces resource limits while
/// traversing a message.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Cumulative cap, in words, on how much content a single traversal of
    /// this message may visit. Exists to bound the CPU cost of processing
    /// an untrusted message whose pointers alias the same content many
    /// times over (an amplification attack). `None` disables the limit.
    pub traversal_limit_in_words: Option<usize>,

    /// Cap on how deeply structs/lists may nest before a pointer
    /// dereference fails. Bounds the stack depth of recursive traversal
    /// code against a maliciously (or accidentally) deep or cyclic message.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: Some(8 * 1024 * 1024),
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: Option<usize>) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// An object that manages the byte segments underlying a message reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`. Returns `None` if `idx` is out of
    /// range. The slice must be 8-byte aligned (or the `unaligned` feature
    /// must be enabled) and remain valid for the lifetime of `self`.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    fn len(&self) -> usize {
        for i in 0.. {
            if self.get_segment(i as u32).is_none() {
                return i;
            }
        }
        unreachable!()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: ReaderSegments> ReaderSegments for &S {
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }
    fn len(&self) -> usize {
        (**self).len()
    }
}

/// A borrowed array of segments, for reading a message that arrived as
/// pre-split byte slices rather than a single framed byte stream.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl<'b> ReaderSegments for SegmentArray<'b> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }
    fn len(&self) -> usize {
        self.segments.len()
    }
}

/// Owns the bytes of a message read from a contiguous buffer (e.g. a flat
/// [`crate::serialize::read_message`] call), sliced into per-segment views.
pub struct OwnedSegments {
    pub(crate) segment_slices: Vec<(usize, usize)>,
    pub(crate) owned_space: Vec<Word>,
}

impl ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        let (a, b) = *self.segment_slices.get(id as usize)?;
        Some(Word::words_to_bytes(&self.owned_space[a..b]))
    }
    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// A container used to read a message: wraps a [`ReaderSegments`] plus the
/// shared traversal/nesting budget state that every pointer dereference
/// charges against.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArena<S>,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Reader {
            arena: ReaderArena::new(segments, options),
        }
    }

    /// Gets the root struct of the message. Fails if the root pointer is
    /// null or does not describe a struct.
    pub fn get_root(&self) -> Result<StructReader<'_, S>> {
        StructReader::get_root(&self.arena, self.arena.nesting_limit())
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }
}

/// An object that allocates memory for a message as it is being built.
/// Implementors are wrapped by [`crate::private::arena::SegmentManager`],
/// which handles bump allocation within each returned segment and calls
/// `deallocate_segment` exactly once per segment, on drop.
///
/// # Safety
/// Implementations must ensure:
///   1. Memory returned by `allocate_segment` is zeroed.
///   2. It remains valid until `deallocate_segment` is called on it.
///   3. It does not overlap with any other allocation returned by this
///      allocator.
///   4. It is 8-byte aligned (unless the `unaligned` feature is enabled).
pub unsafe trait Allocator {
    /// Allocates zeroed memory for a new segment, returning a pointer to
    /// its start and its length in words (at least `minimum_size`).
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32);

    /// Called exactly once per segment returned from `allocate_segment`,
    /// when that segment is no longer in use. `word_size` is the length
    /// returned at allocation time; `words_used` (`<= word_size`) is how
    /// many leading words may have been written with non-zero values.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by `allocate_segment` on
    /// this allocator, not yet deallocated.
    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32);
}

/// The default [`Allocator`]: each segment is a heap allocation, freed with
/// the global allocator on `deallocate_segment`.
pub struct HeapAllocator {
    first_segment_words: u32,
}

impl HeapAllocator {
    pub fn new() -> Self {
        HeapAllocator {
            first_segment_words: crate::private::arena::DEFAULT_FIRST_SEGMENT_WORDS,
        }
    }

    pub fn first_segment_words(mut self, value: u32) -> Self {
        self.first_segment_words = value;
        self
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        HeapAllocator::new()
    }
}

unsafe impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        let size = core::cmp::max(minimum_size, self.first_segment_words);
        let mut v: Vec<Word> = Word::allocate_zeroed_vec(size as usize);
        let ptr = v.as_mut_ptr() as *mut u8;
        core::mem::forget(v);
        (ptr, size)
    }

    fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, _words_used: u32) {
        unsafe {
            drop(Vec::from_raw_parts(
                ptr as *mut Word,
                word_size as usize,
                word_size as usize,
            ));
        }
    }
}

/// A container used to build a message. Owns a [`SegmentManager`] (shared
/// behind an `Rc<RefCell<_>>` so builder handles can carry plain
/// `(segment, offset)` pairs instead of aliasing references) and hands out
/// [`StructBuilder`]s that address it.
pub struct Builder<A>
where
    A: Allocator + 'static,
{
    arena: ArenaHandle,
    _allocator: core::marker::PhantomData<A>,
}

impl Builder<HeapAllocator> {
    pub fn new_default() -> Self {
        Builder::new(HeapAllocator::new())
    }
}

impl Default for Builder<HeapAllocator> {
    fn default() -> Self {
        Builder::new_default()
    }
}

impl<A> Builder<A>
where
    A: Allocator + 'static,
{
    pub fn new(allocator: A) -> Self {
        Builder {
            arena: make_arena_handle(SegmentManager::new(allocator)),
            _allocator: core::marker::PhantomData,
        }
    }

    /// Allocates the root struct of the message: `1 + data_words +
    /// ptr_words` words in segment 0, with a struct pointer at word 0.
    /// Passing `data_words = ptr_words = 0` allocates only the root
    /// pointer word itself, written as a zero-sized struct pointer.
    pub fn init_root(&mut self, data_words: u16, ptr_words: u16) -> Result<StructBuilder> {
        if data_words == 0 && ptr_words == 0 {
            let (seg, word) = self.arena.borrow_mut().allocate(0, 1)?;
            {
                let mut arena = self.arena.borrow_mut();
                let bytes = arena.get_segment_bytes_mut(seg)?;
                let raw = crate::private::layout::encode_struct_pointer(-1, 0, 0);
                bytes[word as usize * BYTES_PER_WORD..word as usize * BYTES_PER_WORD + 8]
                    .copy_from_slice(&raw.to_le_bytes());
            }
            return Ok(StructBuilder::new(self.arena.clone(), seg, word, 0, word, 0));
        }
        let content_words = data_words as u32 + ptr_words as u32;
        let (seg, ptr_word) = self.arena.borrow_mut().allocate(0, 1 + content_words)?;
        let content_word = ptr_word + 1;
        {
            let mut arena = self.arena.borrow_mut();
            let bytes = arena.get_segment_bytes_mut(seg)?;
            let raw = crate::private::layout::encode_struct_pointer(0, data_words, ptr_words);
            bytes[ptr_word as usize * BYTES_PER_WORD..ptr_word as usize * BYTES_PER_WORD + 8]
                .copy_from_slice(&raw.to_le_bytes());
        }
        Ok(StructBuilder::new(
            self.arena.clone(),
            seg,
            content_word,
            data_words,
            content_word + data_words as u32,
            ptr_words,
        ))
    }

    /// Frees every segment past the first and resets the first segment's
    /// bump pointer, retaining its capacity. Does not change the
    /// allocator's identity.
    pub fn clear(&mut self) {
        self.arena.borrow_mut().clear();
    }

    /// Returns the segments that make up this message, in frame order,
    /// ready to be passed to [`crate::serialize::write_message`].
    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        let arena = self.arena.borrow();
        let segs: Vec<&[u8]> = arena.output_segments();
        let words: Vec<&[Word]> = segs
            .into_iter()
            .map(|b| {
                let ptr = b.as_ptr() as *const Word;
                // Safety: every segment's backing storage is `Word`-aligned
                // and its byte length is always a whole number of words.
                unsafe { core::slice::from_raw_parts(ptr, b.len() / BYTES_PER_WORD) }
            })
            .collect();
        if words.len() == 1 {
            OutputSegments::SingleSegment([words[0]; 1])
        } else {
            OutputSegments::MultiSegment(words)
        }
    }
}

/// Reads a list of byte-sized elements as an element-size-validated view.
/// Thin helper used by `serialize`/tests that want to assert a builder's
/// text/data field without round-tripping through bytes.
pub fn expect_byte_list<S: ReaderSegments>(list: ListReader<'_, S>) -> Result<&[u8]> {
    if list.element_size() != ElementSize::Byte {
        return Err(Error::new(
            ErrorKind::InvalidElementSize,
            "expected a Byte-element list",
        ));
    }
    Ok(list.as_bytes())
}
