// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! The packed stream encoding: a zero-run-length and all-nonzero-run-length
//! compressor layered transparently over the flat framing in
//! [`crate::serialize`]. Every word is reduced to a tag byte describing
//! which of its 8 bytes are nonzero, followed by just those bytes; a run of
//! all-zero or all-nonzero words collapses further into a single count
//! byte. See section 4.5 of the wire format notes.

use std::io::{Read, Write};
use std::vec::Vec;

use crate::message::{OwnedSegments, Reader, ReaderOptions};
use crate::serialize::AsOutputSegments;
use crate::{Error, ErrorKind, Result, Word};

const ZERO_WORD: [u8; 8] = [0; 8];

fn is_all_nonzero(word: &[u8; 8]) -> bool {
    word.iter().all(|&b| b != 0)
}

fn tag_byte(word: &[u8; 8]) -> u8 {
    let mut tag = 0u8;
    for (j, &b) in word.iter().enumerate() {
        if b != 0 {
            tag |= 1 << j;
        }
    }
    tag
}

/// A word is "highly compressible" -- cheaper to emit via the tag-plus-
/// nonzero-bytes path than to fold into an in-progress literal run -- once
/// its tag has two or fewer bits set. The all-zero word (tag 0) is the
/// degenerate case of this and is never a candidate for continuing a run.
fn is_highly_compressible(tag: u8) -> bool {
    tag.count_ones() <= 2
}

/// Wraps a [`Read`] stream of packed bytes, presenting the unpacked bytes
/// through the `Read` interface. Used so that [`crate::serialize::read_message`]
/// can be driven directly over a packed stream without buffering the whole
/// message up front.
pub struct PackedRead<R>
where
    R: Read,
{
    inner: R,
    buf: [u8; 8],
    buf_pos: u8,
    buf_len: u8,
    outstanding_zero_words: u16,
    outstanding_raw_words: u16,
}

impl<R> PackedRead<R>
where
    R: Read,
{
    pub fn new(inner: R) -> Self {
        PackedRead {
            inner,
            buf: [0; 8],
            buf_pos: 0,
            buf_len: 0,
            outstanding_zero_words: 0,
            outstanding_raw_words: 0,
        }
    }

    fn read_byte(&mut self) -> std::io::Result<u8> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }
}

impl<R> Read for PackedRead<R>
where
    R: Read,
{
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < out.len() {
            if self.buf_pos < self.buf_len {
                let avail = (self.buf_len - self.buf_pos) as usize;
                let n = core::cmp::min(avail, out.len() - written);
                out[written..written + n].copy_from_slice(
                    &self.buf[self.buf_pos as usize..self.buf_pos as usize + n],
                );
                self.buf_pos += n as u8;
                written += n;
                continue;
            }

            if self.outstanding_zero_words > 0 {
                self.buf = ZERO_WORD;
                self.buf_pos = 0;
                self.buf_len = 8;
                self.outstanding_zero_words -= 1;
                continue;
            }

            if self.outstanding_raw_words > 0 {
                self.inner.read_exact(&mut self.buf)?;
                self.buf_pos = 0;
                self.buf_len = 8;
                self.outstanding_raw_words -= 1;
                continue;
            }

            let mut tag_buf = [0u8; 1];
            let n = self.inner.read(&mut tag_buf)?;
            if n == 0 {
                return Ok(written);
            }
            let tag = tag_buf[0];

            let mut word = [0u8; 8];
            for (j, byte) in word.iter_mut().enumerate() {
                if tag & (1 << j) != 0 {
                    *byte = self.read_byte()?;
                }
            }
            self.buf = word;
            self.buf_pos = 0;
            self.buf_len = 8;

            if tag == 0 {
                self.outstanding_zero_words = self.read_byte()? as u16;
            } else if tag == 0xff {
                self.outstanding_raw_words = self.read_byte()? as u16;
            }
        }
        Ok(written)
    }
}

enum PendingRun {
    Zero { count: u16 },
    Raw { words: Vec<[u8; 8]> },
}

/// Wraps a [`Write`] sink, packing bytes written to it before forwarding
/// them. Input must be written in whole words; call [`PackedWrite::finish`]
/// once the full message has been written to flush any in-progress run and
/// reclaim the inner writer.
pub struct PackedWrite<W>
where
    W: Write,
{
    inner: W,
    incoming: Vec<u8>,
    pending: Option<PendingRun>,
}

impl<W> PackedWrite<W>
where
    W: Write,
{
    pub fn new(inner: W) -> Self {
        PackedWrite {
            inner,
            incoming: Vec::new(),
            pending: None,
        }
    }

    fn flush_pending(&mut self) -> std::io::Result<()> {
        match self.pending.take() {
            None => {}
            Some(PendingRun::Zero { count }) => {
                self.inner.write_all(&[count as u8])?;
            }
            Some(PendingRun::Raw { words }) => {
                self.inner.write_all(&[words.len() as u8])?;
                for word in &words {
                    self.inner.write_all(word)?;
                }
            }
        }
        Ok(())
    }

    fn process_word(&mut self, word: [u8; 8]) -> std::io::Result<()> {
        match &mut self.pending {
            Some(PendingRun::Zero { count }) => {
                if word == ZERO_WORD && *count < 255 {
                    *count += 1;
                    return Ok(());
                }
                self.flush_pending()?;
            }
            Some(PendingRun::Raw { words }) => {
                // The literal run absorbs any word that isn't cheaper to
                // encode via the tag-plus-nonzero-bytes path, not just
                // all-nonzero ones -- a word with interior zeros still gets
                // copied verbatim once we're inside a run (see section 4.5).
                if !is_highly_compressible(tag_byte(&word)) && words.len() < 255 {
                    words.push(word);
                    return Ok(());
                }
                self.flush_pending()?;
            }
            None => {}
        }

        if word == ZERO_WORD {
            self.inner.write_all(&[0u8])?;
            self.pending = Some(PendingRun::Zero { count: 0 });
        } else if is_all_nonzero(&word) {
            self.inner.write_all(&[0xffu8])?;
            self.inner.write_all(&word)?;
            self.pending = Some(PendingRun::Raw { words: Vec::new() });
        } else {
            let tag = tag_byte(&word);
            self.inner.write_all(&[tag])?;
            for &b in word.iter() {
                if b != 0 {
                    self.inner.write_all(&[b])?;
                }
            }
        }
        Ok(())
    }

    /// Flushes any in-progress run and returns the inner writer. The
    /// stream written so far must consist of whole 8-byte words; a
    /// trailing partial word is an error.
    pub fn finish(mut self) -> Result<W> {
        if !self.incoming.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidPackedData,
                "packed stream ended mid-word",
            ));
        }
        self.flush_pending()?;
        Ok(self.inner)
    }
}

impl<W> Write for PackedWrite<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.incoming.extend_from_slice(buf);
        while self.incoming.len() >= 8 {
            let mut word = [0u8; 8];
            word.copy_from_slice(&self.incoming[..8]);
            self.process_word(word)?;
            self.incoming.drain(..8);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reads a packed message from `read`, transparently unpacking it through
/// [`PackedRead`] and delegating to [`crate::serialize::read_message`].
pub fn read_packed_message<R: Read>(
    read: R,
    options: ReaderOptions,
) -> Result<Reader<OwnedSegments>> {
    crate::serialize::read_message(PackedRead::new(read), options)
}

/// Writes a message to `write` in packed form.
pub fn write_packed_message<W: Write, M: AsOutputSegments>(write: W, message: &M) -> Result<()> {
    let mut packed = PackedWrite::new(write);
    crate::serialize::write_message(&mut packed, message)?;
    packed.finish()?;
    Ok(())
}

/// Default cap on the size of [`unpack_into_vec`]'s output when the caller
/// doesn't supply one, matching the reference implementation's decompression-
/// bomb guard.
pub const DEFAULT_MAX_UNPACKED_SIZE: usize = 64 * 1024 * 1024;

/// Translates an I/O error raised while draining a [`PackedRead`] into the
/// packed-data error it actually represents: any short read here means the
/// packed byte stream itself was truncated or malformed, not that some
/// downstream I/O resource failed.
fn packed_data_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::InvalidPackedData, format!("{err}"))
}

/// Unpacks `packed` into a freshly allocated `Vec<u8>`. Fails with
/// [`ErrorKind::SegmentSizeOverflow`] if the unpacked size would exceed
/// `max_output_size` bytes, guarding against a maliciously small packed
/// input that expands into an enormous all-zero message; fails with
/// [`ErrorKind::InvalidPackedData`] if the input ends mid-tag-group.
pub fn unpack_into_vec(packed: &[u8], max_output_size: usize) -> Result<Vec<u8>> {
    let mut reader = PackedRead::new(packed);
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).map_err(packed_data_error)?;
        if n == 0 {
            break;
        }
        if out.len() + n > max_output_size {
            return Err(Error::new(
                ErrorKind::SegmentSizeOverflow,
                "unpacked size exceeds the configured maximum output size",
            ));
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

/// Packs `unpacked` (whose length must be a multiple of 8) into a freshly
/// allocated `Vec<u8>`.
pub fn pack_into_vec(unpacked: &[u8]) -> Result<Vec<u8>> {
    let mut packed = PackedWrite::new(Vec::new());
    packed.write_all(unpacked)?;
    packed.finish()
}
