// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! The flat, unpacked stream framing: a little-endian segment-count-and-size
//! header followed by each segment's raw words, back to back. See section
//! 4.5 of the wire format notes.

use std::io::{Read, Write};
use std::vec::Vec;

use crate::message::{Allocator, Builder, OwnedSegments, Reader, ReaderOptions};
use crate::{Error, ErrorKind, OutputSegments, Result, Word};

/// Hard cap on the number of segments a frame header may declare. Matches
/// the limit enforced by the reference implementation; without it, a
/// maliciously small input could force an enormous header allocation.
const MAX_SEGMENTS: usize = 512;

/// An object that can be written out as an ordered list of word segments.
pub trait AsOutputSegments {
    fn as_output_segments(&self) -> OutputSegments<'_>;
}

impl<A> AsOutputSegments for Builder<A>
where
    A: Allocator + 'static,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        self.get_segments_for_output()
    }
}

impl<A> AsOutputSegments for &Builder<A>
where
    A: Allocator + 'static,
{
    fn as_output_segments(&self) -> OutputSegments<'_> {
        (**self).get_segments_for_output()
    }
}

/// Parses a frame header: `segment_count - 1` as a little-endian `u32`,
/// followed by `segment_count` little-endian `u32` segment sizes (in
/// words), followed by zero padding if needed to reach 8-byte alignment.
/// Returns the segment sizes.
fn read_segment_table<R: Read>(read: &mut R) -> Result<Vec<u32>> {
    let mut first_word = [0u8; 8];
    read.read_exact(&mut first_word)?;
    let segment_count = u32::from_le_bytes(first_word[0..4].try_into().unwrap()) as usize + 1;
    if segment_count == 0 || segment_count > MAX_SEGMENTS {
        return Err(Error::new(
            ErrorKind::SegmentCountOverflow,
            format!("declared segment count {segment_count} is out of the supported range"),
        ));
    }

    let mut sizes = Vec::with_capacity(segment_count);
    sizes.push(u32::from_le_bytes(first_word[4..8].try_into().unwrap()));

    // One word holds two u32 sizes; (segment_count - 1) more sizes remain
    // after the one packed into first_word, so (segment_count - 1 + 1) / 2
    // more words follow (rounded up), with the header padded to a whole
    // word if segment_count is even.
    let remaining = segment_count - 1;
    let mut buf = [0u8; 8];
    for i in 0..remaining {
        if i % 2 == 0 {
            read.read_exact(&mut buf)?;
            sizes.push(u32::from_le_bytes(buf[0..4].try_into().unwrap()));
        } else {
            sizes.push(u32::from_le_bytes(buf[4..8].try_into().unwrap()));
        }
    }

    for &size in &sizes {
        if size as u64 > (u32::MAX as u64) / 8 {
            return Err(Error::new(
                ErrorKind::SegmentSizeOverflow,
                "declared segment size is too large to allocate",
            ));
        }
    }

    Ok(sizes)
}

/// Reads a complete message from a byte stream into a single owned buffer,
/// returning a [`Reader`] over it.
pub fn read_message<R: Read>(
    mut read: R,
    options: ReaderOptions,
) -> Result<Reader<OwnedSegments>> {
    let sizes = read_segment_table(&mut read)?;
    // Deliberately not bounded by `options.traversal_limit_in_words` here:
    // that budget is charged per pointer dereference (see
    // `ReaderArena::charge_traversal`), not against the raw input size, so
    // that a caller can open a large message and read only a small part of
    // it under a tight limit. `read_segment_table`'s own per-segment cap
    // is what stands between this allocation and a malicious size claim.
    let total_words: u64 = sizes.iter().map(|&s| s as u64).sum();

    let mut owned_space = Word::allocate_zeroed_vec(total_words as usize);
    read.read_exact(Word::words_to_bytes_mut(&mut owned_space))?;

    let mut segment_slices = Vec::with_capacity(sizes.len());
    let mut start = 0usize;
    for &size in &sizes {
        let end = start + size as usize;
        segment_slices.push((start, end));
        start = end;
    }

    Ok(Reader::new(
        OwnedSegments {
            segment_slices,
            owned_space,
        },
        options,
    ))
}

/// Like [`read_message`] but the caller supplies the exact flat byte
/// buffer, avoiding a copy when the message has already been read into
/// memory in one piece.
pub fn read_message_from_flat_slice(
    bytes: &mut &[u8],
    options: ReaderOptions,
) -> Result<Reader<OwnedSegments>> {
    read_message(&mut *bytes, options)
}

fn segment_table_bytes(sizes: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 * ((sizes.len() + 2) / 2));
    buf.extend_from_slice(&((sizes.len() - 1) as u32).to_le_bytes());
    for &size in sizes {
        buf.extend_from_slice(&size.to_le_bytes());
    }
    if sizes.len() % 2 == 0 {
        buf.extend_from_slice(&[0u8; 4]);
    }
    buf
}

/// Writes a frame header followed by each segment's words, back to back.
pub fn write_message<W: Write, M: AsOutputSegments>(mut write: W, message: &M) -> Result<()> {
    let segments = message.as_output_segments();
    let sizes: Vec<u32> = segments.iter().map(|s| s.len() as u32).collect();
    write.write_all(&segment_table_bytes(&sizes))?;
    for segment in segments.iter() {
        write.write_all(Word::words_to_bytes(segment))?;
    }
    Ok(())
}
