// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Runtime support for reading and writing Cap'n Proto messages.
//!
//! This crate implements the wire-level encoding only: word-aligned segments,
//! struct/list/far pointers, a bounds- and budget-checked reader, and the
//! byte-oriented packing compressor. There is no schema compiler here -- callers
//! build and read messages directly through [`message::Builder`] and
//! [`message::Reader`], addressing data and pointer sections by byte/pointer
//! offset.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(not(feature = "alloc"))]
mod alloc {
    // no_std without alloc is not a supported configuration for this crate;
    // every container here is heap-backed.
}

pub mod message;
pub mod private;
#[cfg(feature = "std")]
pub mod serialize;
#[cfg(feature = "std")]
pub mod serialize_packed;

use core::fmt;

/// A single 64-bit Cap'n Proto word.
///
/// All message content is word-aligned; segments are `[Word]` slices and
/// every pointer offset is counted in words, not bytes.
#[derive(Clone, Copy, Default)]
#[repr(align(8))]
pub struct Word([u8; 8]);

impl Word {
    pub const fn default_value() -> Word {
        Word([0; 8])
    }

    /// Does not perform endianness conversion. The bytes are taken as-is.
    pub fn words_to_bytes(words: &[Word]) -> &[u8] {
        let ptr = words.as_ptr() as *const u8;
        // Safety: Word is repr(align(8)) over [u8; 8], so this reinterpretation
        // is valid for any length.
        unsafe { core::slice::from_raw_parts(ptr, words.len() * 8) }
    }

    pub fn words_to_bytes_mut(words: &mut [Word]) -> &mut [u8] {
        let ptr = words.as_mut_ptr() as *mut u8;
        unsafe { core::slice::from_raw_parts_mut(ptr, words.len() * 8) }
    }

    #[cfg(feature = "alloc")]
    pub fn allocate_zeroed_vec(num_words: usize) -> alloc::vec::Vec<Word> {
        alloc::vec![Word::default_value(); num_words]
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({:#018x})", u64::from_le_bytes(self.0))
    }
}

impl From<u64> for Word {
    fn from(n: u64) -> Word {
        Word(n.to_le_bytes())
    }
}

impl From<Word> for u64 {
    fn from(w: Word) -> u64 {
        u64::from_le_bytes(w.0)
    }
}

/// Describes the taxonomy of things that can go wrong while reading or
/// building a message. Every variant here is a documented wire-format or
/// resource-limit violation -- there is no variant for "internal bug".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The first word of a stream-framed message did not parse, or claimed
    /// an unreasonable segment count.
    InvalidFrameHeader,
    /// The segment count in a frame header overflows the limits this
    /// implementation is willing to allocate for.
    SegmentCountOverflow,
    /// A segment size (or, during packing, an unpacked size) is larger than
    /// this implementation is willing to allocate.
    SegmentSizeOverflow,
    /// The input ended before a frame header or segment could be fully read.
    UnexpectedEndOfInput,
    /// A pointer's computed target, or a list/struct's content, falls
    /// outside the bounds of its segment.
    PointerOutOfBounds,
    /// A pointer's low tag bits do not match the kind the caller expected
    /// (e.g. a struct pointer read as a list).
    InvalidPointerType,
    /// The caller dereferenced a pointer that is required to be non-null
    /// (e.g. the message root).
    NullPointer,
    /// The cumulative traversal budget for this reader has been exhausted.
    TraversalLimitExceeded,
    /// The nesting-depth limit for this reader has been exhausted.
    NestingLimitExceeded,
    /// A list was read with an element size incompatible with the caller's
    /// expectation.
    InvalidElementSize,
    /// A list index is out of bounds for its element count.
    ListIndexOutOfBounds,
    /// A text blob's final byte is not NUL.
    TextNotNulTerminated,
    /// A text blob is not valid UTF-8.
    InvalidUtf8,
    /// The injected allocator could not satisfy an allocation request.
    OutOfMemory,
    /// A segment could not accept a bump allocation it was asked to hold
    /// (internal invariant violation surfaced to the caller).
    SegmentFull,
    /// The packed byte stream is truncated or its tag bytes are
    /// inconsistent with the remaining input.
    InvalidPackedData,
}

/// An error produced while building, serializing, or reading a message.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: alloc::string::String,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<alloc::string::String>) -> Error {
        Error {
            kind,
            description: description.into(),
        }
    }

    pub fn failed(description: impl Into<alloc::string::String>) -> Error {
        Error::new(ErrorKind::PointerOutOfBounds, description)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(ErrorKind::UnexpectedEndOfInput, alloc::format!("{err}"))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The segments that make up a message, ready to be written out in frame
/// order. Returned by [`message::Builder::get_segments_for_output`].
pub enum OutputSegments<'a> {
    SingleSegment([&'a [Word]; 1]),
    MultiSegment(alloc::vec::Vec<&'a [Word]>),
}

impl<'a> core::ops::Deref for OutputSegments<'a> {
    type Target = [&'a [Word]];
    fn deref(&self) -> &[&'a [Word]] {
        match self {
            OutputSegments::SingleSegment(s) => s,
            OutputSegments::MultiSegment(v) => v,
        }
    }
}
