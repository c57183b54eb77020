// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! The pointer codec and the struct/list reader and builder types that sit
//! on top of it. This is the untyped layer: callers address data fields by
//! byte offset and pointer fields by index, exactly as the wire format
//! describes them. There is no schema-generated layer above this one.

use crate::private::arena::{ArenaHandle, ReaderArena};
use crate::private::units::{round_bytes_up_to_words, ElementSize, BYTES_PER_WORD};
use crate::message::ReaderSegments;
use crate::{Error, ErrorKind, Result};

// ---------------------------------------------------------------------
// Pointer codec (section 4.1)
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireKind {
    Struct,
    List,
    Far,
    Capability,
}

pub fn kind_of(raw: u64) -> WireKind {
    match raw & 3 {
        0 => WireKind::Struct,
        1 => WireKind::List,
        2 => WireKind::Far,
        _ => WireKind::Capability,
    }
}

pub fn is_null(raw: u64) -> bool {
    raw == 0
}

fn sign_extend_30(bits: u32) -> i32 {
    if bits & 0x2000_0000 != 0 {
        (bits | 0xC000_0000) as i32
    } else {
        bits as i32
    }
}

pub fn encode_struct_pointer(offset: i32, data_words: u16, ptr_words: u16) -> u64 {
    let offset_bits = (offset as u32) & 0x3FFF_FFFF;
    (offset_bits as u64) << 2 | (data_words as u64) << 32 | (ptr_words as u64) << 48
}

pub fn decode_struct_pointer(raw: u64) -> Option<(i32, u16, u16)> {
    if kind_of(raw) != WireKind::Struct {
        return None;
    }
    let offset = sign_extend_30(((raw >> 2) & 0x3FFF_FFFF) as u32);
    let data_words = ((raw >> 32) & 0xFFFF) as u16;
    let ptr_words = ((raw >> 48) & 0xFFFF) as u16;
    Some((offset, data_words, ptr_words))
}

pub fn encode_list_pointer(offset: i32, element_size: u8, count: u32) -> u64 {
    let offset_bits = (offset as u32) & 0x3FFF_FFFF;
    1u64 | (offset_bits as u64) << 2
        | ((element_size as u64) & 0x7) << 32
        | ((count as u64) & 0x1FFF_FFFF) << 35
}

pub fn decode_list_pointer(raw: u64) -> Option<(i32, u8, u32)> {
    if kind_of(raw) != WireKind::List {
        return None;
    }
    let offset = sign_extend_30(((raw >> 2) & 0x3FFF_FFFF) as u32);
    let size_code = ((raw >> 32) & 0x7) as u8;
    let count = ((raw >> 35) & 0x1FFF_FFFF) as u32;
    Some((offset, size_code, count))
}

pub fn encode_far_pointer(double_far: bool, offset: u32, seg_id: u32) -> u64 {
    2u64 | (double_far as u64) << 2 | ((offset as u64) & 0x1FFF_FFFF) << 3 | (seg_id as u64) << 32
}

pub fn decode_far_pointer(raw: u64) -> Option<(bool, u32, u32)> {
    if kind_of(raw) != WireKind::Far {
        return None;
    }
    let double_far = (raw >> 2) & 1 != 0;
    let offset = ((raw >> 3) & 0x1FFF_FFFF) as u32;
    let seg_id = (raw >> 32) as u32;
    Some((double_far, offset, seg_id))
}

/// `loc + 1 + offset`, the word index that a struct/list pointer located at
/// word `loc` of its own segment refers to. Fails on overflow/underflow
/// rather than wrapping, since a wrapped value could alias into validly
/// bounded memory.
pub fn target(loc: u32, offset: i32) -> Result<u32> {
    let t = loc as i64 + 1 + offset as i64;
    if t < 0 || t > u32::MAX as i64 {
        Err(Error::new(
            ErrorKind::PointerOutOfBounds,
            "pointer target over/underflowed segment word index",
        ))
    } else {
        Ok(t as u32)
    }
}

fn bounds_check(segment_words: u32, start: u32, len_words: u64) -> Result<()> {
    let end = start as u64 + len_words;
    if end > segment_words as u64 {
        Err(Error::new(
            ErrorKind::PointerOutOfBounds,
            "pointer content extends past the end of its segment",
        ))
    } else {
        Ok(())
    }
}

fn get_u64_le(bytes: &[u8], word_idx: u32) -> u64 {
    let start = word_idx as usize * BYTES_PER_WORD;
    u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap())
}

fn put_u64_le(bytes: &mut [u8], word_idx: u32, value: u64) {
    let start = word_idx as usize * BYTES_PER_WORD;
    bytes[start..start + 8].copy_from_slice(&value.to_le_bytes());
}

// ---------------------------------------------------------------------
// Reader-side dereferencing
// ---------------------------------------------------------------------

/// What a (possibly far-indirected) pointer resolves to, expressed as an
/// absolute `(segment, word index)` location plus the content's shape.
enum Resolved {
    Struct {
        seg_id: u32,
        content_word: u32,
        data_words: u16,
        ptr_words: u16,
    },
    List {
        seg_id: u32,
        content_word: u32,
        element_size: ElementSize,
        count: u32,
        composite_data_words: u16,
        composite_ptr_words: u16,
    },
}

fn words_for_segment<S: ReaderSegments>(arena: &ReaderArena<S>, seg_id: u32) -> Result<u32> {
    Ok((arena.get_segment(seg_id)?.len() / BYTES_PER_WORD) as u32)
}

/// Resolves the pointer word at `(seg_id, word_idx)`, following up to two
/// far-pointer hops, charging the traversal budget, and bounds-checking the
/// content. Returns `None` for a null pointer.
fn dereference<S: ReaderSegments>(
    arena: &ReaderArena<S>,
    seg_id: u32,
    word_idx: u32,
) -> Result<Option<Resolved>> {
    let seg_len = words_for_segment(arena, seg_id)?;
    bounds_check(seg_len, word_idx, 1)?;
    let bytes = arena.get_segment(seg_id)?;
    let raw = get_u64_le(bytes, word_idx);
    if is_null(raw) {
        return Ok(None);
    }

    match kind_of(raw) {
        WireKind::Far => {
            let (double, offset, target_seg) =
                decode_far_pointer(raw).expect("checked kind above");
            let target_len = words_for_segment(arena, target_seg)?;
            if !double {
                bounds_check(target_len, offset, 1)?;
                let pad_bytes = arena.get_segment(target_seg)?;
                let landing_raw = get_u64_le(pad_bytes, offset);
                if kind_of(landing_raw) == WireKind::Far {
                    return Err(Error::new(
                        ErrorKind::InvalidPointerType,
                        "single far-pointer landing pad must not itself be a far pointer",
                    ));
                }
                resolve_non_far(arena, target_seg, offset, landing_raw)
            } else {
                bounds_check(target_len, offset, 2)?;
                let pad_bytes = arena.get_segment(target_seg)?;
                let far_word = get_u64_le(pad_bytes, offset);
                let tag_word = get_u64_le(pad_bytes, offset + 1);
                let (inner_double, content_word, content_seg) = decode_far_pointer(far_word)
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidPointerType,
                            "double far-pointer landing pad's first word must be a far pointer",
                        )
                    })?;
                if inner_double {
                    return Err(Error::new(
                        ErrorKind::InvalidPointerType,
                        "double far pointer may not chain to another double far pointer",
                    ));
                }
                resolve_tag(arena, content_seg, content_word, tag_word)
            }
        }
        WireKind::Capability => Err(Error::new(
            ErrorKind::InvalidPointerType,
            "capability pointers are not supported",
        )),
        _ => resolve_non_far(arena, seg_id, word_idx, raw),
    }
}

fn resolve_non_far<S: ReaderSegments>(
    arena: &ReaderArena<S>,
    seg_id: u32,
    word_idx: u32,
    raw: u64,
) -> Result<Option<Resolved>> {
    match kind_of(raw) {
        WireKind::Struct => {
            let (offset, d, p) = decode_struct_pointer(raw).unwrap();
            let content_word = target(word_idx, offset)?;
            let seg_len = words_for_segment(arena, seg_id)?;
            bounds_check(seg_len, content_word, (d as u64) + (p as u64))?;
            Ok(Some(Resolved::Struct {
                seg_id,
                content_word,
                data_words: d,
                ptr_words: p,
            }))
        }
        WireKind::List => {
            let (offset, size_code, count) = decode_list_pointer(raw).unwrap();
            let content_word = target(word_idx, offset)?;
            let seg_len = words_for_segment(arena, seg_id)?;
            if size_code == 7 {
                // inline composite: a tag word precedes the content.
                bounds_check(seg_len, content_word, 1)?;
                let bytes = arena.get_segment(seg_id)?;
                let tag = get_u64_le(bytes, content_word);
                let (tag_offset, d, p) = decode_struct_pointer(tag).ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidPointerType,
                        "inline composite list tag word is not struct-pointer-shaped",
                    )
                })?;
                let element_count = tag_offset as u32; // unsigned 30-bit value
                let elem_words = (d as u64) + (p as u64);
                bounds_check(
                    seg_len,
                    content_word + 1,
                    elem_words * element_count as u64,
                )?;
                Ok(Some(Resolved::List {
                    seg_id,
                    content_word: content_word + 1,
                    element_size: ElementSize::InlineComposite,
                    count: element_count,
                    composite_data_words: d,
                    composite_ptr_words: p,
                }))
            } else {
                let element_size = ElementSize::from_code(size_code).unwrap();
                let total_bits = element_size.data_bits_per_element() as u64 * count as u64
                    + element_size.pointers_per_element() as u64 * 64 * count as u64;
                let words = round_bytes_up_to_words(((total_bits + 7) / 8) as u32) as u64;
                bounds_check(seg_len, content_word, words)?;
                Ok(Some(Resolved::List {
                    seg_id,
                    content_word,
                    element_size,
                    count,
                    composite_data_words: 0,
                    composite_ptr_words: 0,
                }))
            }
        }
        _ => unreachable!("far/capability handled by caller"),
    }
}

fn resolve_tag<S: ReaderSegments>(
    arena: &ReaderArena<S>,
    seg_id: u32,
    content_word: u32,
    tag: u64,
) -> Result<Option<Resolved>> {
    let seg_len = words_for_segment(arena, seg_id)?;
    match kind_of(tag) {
        WireKind::Struct => {
            let (_offset, d, p) = decode_struct_pointer(tag).unwrap();
            bounds_check(seg_len, content_word, (d as u64) + (p as u64))?;
            Ok(Some(Resolved::Struct {
                seg_id,
                content_word,
                data_words: d,
                ptr_words: p,
            }))
        }
        WireKind::List => {
            let (_offset, size_code, count) = decode_list_pointer(tag).unwrap();
            let element_size = ElementSize::from_code(size_code).ok_or_else(|| {
                Error::new(ErrorKind::InvalidElementSize, "invalid element size code")
            })?;
            let total_bits = element_size.data_bits_per_element() as u64 * count as u64;
            let words = round_bytes_up_to_words(((total_bits + 7) / 8) as u32) as u64;
            bounds_check(seg_len, content_word, words)?;
            Ok(Some(Resolved::List {
                seg_id,
                content_word,
                element_size,
                count,
                composite_data_words: 0,
                composite_ptr_words: 0,
            }))
        }
        _ => Err(Error::new(
            ErrorKind::InvalidPointerType,
            "double far-pointer tag word must be struct- or list-shaped",
        )),
    }
}

/// Traversal cost, in words, of visiting the content described by
/// `resolved`. See section 4.4 of the design: primitive content is charged
/// by its packed size; void/zero-shaped composite lists are charged by
/// element count to defend against amplification attacks.
fn traversal_words(resolved: &Resolved) -> u64 {
    match *resolved {
        Resolved::Struct {
            data_words,
            ptr_words,
            ..
        } => core::cmp::max(data_words as u64 + ptr_words as u64, 1),
        Resolved::List {
            element_size,
            count,
            composite_data_words,
            composite_ptr_words,
            ..
        } => match element_size {
            ElementSize::InlineComposite => {
                if composite_data_words == 0 && composite_ptr_words == 0 {
                    count as u64
                } else {
                    core::cmp::max(
                        (composite_data_words as u64 + composite_ptr_words as u64)
                            * count as u64,
                        1,
                    )
                }
            }
            ElementSize::Void => count as u64,
            _ => {
                let bits = element_size.data_bits_per_element() as u64 * count as u64
                    + element_size.pointers_per_element() as u64 * 64 * count as u64;
                core::cmp::max(round_bytes_up_to_words(((bits + 7) / 8) as u32) as u64, 1)
            }
        },
    }
}

// ---------------------------------------------------------------------
// Struct reader
// ---------------------------------------------------------------------

pub struct StructReader<'a, S>
where
    S: ReaderSegments,
{
    arena: &'a ReaderArena<S>,
    seg_id: u32,
    data_start: u32,
    data_words: u16,
    ptr_start: u32,
    ptr_words: u16,
    nesting_limit: i32,
}

impl<'a, S: ReaderSegments> Clone for StructReader<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, S: ReaderSegments> Copy for StructReader<'a, S> {}

impl<'a, S: ReaderSegments> StructReader<'a, S> {
    pub fn new_default(arena: &'a ReaderArena<S>, nesting_limit: i32) -> Self {
        StructReader {
            arena,
            seg_id: 0,
            data_start: 0,
            data_words: 0,
            ptr_start: 0,
            ptr_words: 0,
            nesting_limit,
        }
    }

    pub fn get_root(arena: &'a ReaderArena<S>, nesting_limit: i32) -> Result<Self> {
        match dereference(arena, 0, 0)? {
            None => Err(Error::new(
                ErrorKind::NullPointer,
                "message root pointer is null",
            )),
            Some(Resolved::Struct {
                seg_id,
                content_word,
                data_words,
                ptr_words,
            }) => {
                arena.charge_traversal(core::cmp::max(data_words as u64 + ptr_words as u64, 1))?;
                Ok(StructReader {
                    arena,
                    seg_id,
                    data_start: content_word,
                    data_words,
                    ptr_start: content_word + data_words as u32,
                    ptr_words,
                    nesting_limit,
                })
            }
            Some(Resolved::List { .. }) => Err(Error::new(
                ErrorKind::InvalidPointerType,
                "message root pointer is a list, not a struct",
            )),
        }
    }

    fn data_bit(&self, bit_offset: u32) -> Option<bool> {
        if bit_offset as u64 >= self.data_words as u64 * 64 {
            return None;
        }
        let bytes = self.arena.get_segment(self.seg_id).ok()?;
        let byte_idx = self.data_start as usize * BYTES_PER_WORD + (bit_offset / 8) as usize;
        let bit = bit_offset % 8;
        Some((bytes[byte_idx] >> bit) & 1 != 0)
    }

    fn data_bytes<const N: usize>(&self, byte_offset: u32) -> Option<[u8; N]> {
        if byte_offset as u64 + N as u64 > self.data_words as u64 * BYTES_PER_WORD as u64 {
            return None;
        }
        let bytes = self.arena.get_segment(self.seg_id).ok()?;
        let start = self.data_start as usize * BYTES_PER_WORD + byte_offset as usize;
        Some(bytes[start..start + N].try_into().unwrap())
    }

    pub fn get_bool(&self, bit_offset: u32, default: bool) -> bool {
        self.data_bit(bit_offset).unwrap_or(false) ^ default
    }

    pub fn get_u8(&self, byte_offset: u32, default: u8) -> u8 {
        self.data_bytes::<1>(byte_offset).map(|b| b[0]).unwrap_or(0) ^ default
    }
    pub fn get_i8(&self, byte_offset: u32, default: i8) -> i8 {
        self.get_u8(byte_offset, default as u8) as i8
    }
    pub fn get_u16(&self, byte_offset: u32, default: u16) -> u16 {
        self.data_bytes::<2>(byte_offset)
            .map(u16::from_le_bytes)
            .unwrap_or(0)
            ^ default
    }
    pub fn get_i16(&self, byte_offset: u32, default: i16) -> i16 {
        self.get_u16(byte_offset, default as u16) as i16
    }
    pub fn get_u32(&self, byte_offset: u32, default: u32) -> u32 {
        self.data_bytes::<4>(byte_offset)
            .map(u32::from_le_bytes)
            .unwrap_or(0)
            ^ default
    }
    pub fn get_i32(&self, byte_offset: u32, default: i32) -> i32 {
        self.get_u32(byte_offset, default as u32) as i32
    }
    pub fn get_u64(&self, byte_offset: u32, default: u64) -> u64 {
        self.data_bytes::<8>(byte_offset)
            .map(u64::from_le_bytes)
            .unwrap_or(0)
            ^ default
    }
    pub fn get_i64(&self, byte_offset: u32, default: i64) -> i64 {
        self.get_u64(byte_offset, default as u64) as i64
    }
    pub fn get_f32(&self, byte_offset: u32, default: f32) -> f32 {
        f32::from_bits(self.get_u32(byte_offset, default.to_bits()))
    }
    pub fn get_f64(&self, byte_offset: u32, default: f64) -> f64 {
        f64::from_bits(self.get_u64(byte_offset, default.to_bits()))
    }

    pub fn has_pointer(&self, ptr_idx: u32) -> bool {
        if ptr_idx >= self.ptr_words as u32 {
            return false;
        }
        let Ok(bytes) = self.arena.get_segment(self.seg_id) else {
            return false;
        };
        !is_null(get_u64_le(bytes, self.ptr_start + ptr_idx))
    }

    fn descend(&self) -> Result<i32> {
        if self.nesting_limit <= 0 {
            Err(Error::new(
                ErrorKind::NestingLimitExceeded,
                "message is nested too deeply to be processed; see ReaderOptions::nesting_limit",
            ))
        } else {
            Ok(self.nesting_limit - 1)
        }
    }

    /// Reads pointer field `ptr_idx` as a struct. A null pointer or an
    /// out-of-range index yields an all-defaults empty struct, per Cap'n
    /// Proto's default-value semantics.
    pub fn get_struct(&self, ptr_idx: u32) -> Result<StructReader<'a, S>> {
        if ptr_idx >= self.ptr_words as u32 {
            return Ok(StructReader::new_default(self.arena, self.nesting_limit));
        }
        let next_limit = self.descend()?;
        match dereference(self.arena, self.seg_id, self.ptr_start + ptr_idx)? {
            None => Ok(StructReader::new_default(self.arena, self.nesting_limit)),
            Some(Resolved::Struct {
                seg_id,
                content_word,
                data_words,
                ptr_words,
            }) => {
                self.arena
                    .charge_traversal(core::cmp::max(data_words as u64 + ptr_words as u64, 1))?;
                Ok(StructReader {
                    arena: self.arena,
                    seg_id,
                    data_start: content_word,
                    data_words,
                    ptr_start: content_word + data_words as u32,
                    ptr_words,
                    nesting_limit: next_limit,
                })
            }
            Some(Resolved::List { .. }) => Err(Error::new(
                ErrorKind::InvalidPointerType,
                "expected a struct pointer but found a list pointer",
            )),
        }
    }

    /// Reads pointer field `ptr_idx` as a list. A null pointer yields an
    /// empty list reader of `expected_element_size`.
    pub fn get_list(
        &self,
        ptr_idx: u32,
        expected_element_size: ElementSize,
    ) -> Result<ListReader<'a, S>> {
        if ptr_idx >= self.ptr_words as u32 {
            return Ok(ListReader::new_empty(
                self.arena,
                expected_element_size,
                self.nesting_limit,
            ));
        }
        let next_limit = self.descend()?;
        match dereference(self.arena, self.seg_id, self.ptr_start + ptr_idx)? {
            None => Ok(ListReader::new_empty(
                self.arena,
                expected_element_size,
                self.nesting_limit,
            )),
            Some(resolved @ Resolved::List { .. }) => {
                self.arena.charge_traversal(traversal_words(&resolved))?;
                let Resolved::List {
                    seg_id,
                    content_word,
                    element_size,
                    count,
                    composite_data_words,
                    composite_ptr_words,
                } = resolved
                else {
                    unreachable!()
                };
                Ok(ListReader {
                    arena: self.arena,
                    seg_id,
                    content_word,
                    element_size,
                    count,
                    composite_data_words,
                    composite_ptr_words,
                    nesting_limit: next_limit,
                })
            }
            Some(Resolved::Struct { .. }) => Err(Error::new(
                ErrorKind::InvalidPointerType,
                "expected a list pointer but found a struct pointer",
            )),
        }
    }

    pub fn get_text(&self, ptr_idx: u32) -> Result<&'a str> {
        let list = self.get_list(ptr_idx, ElementSize::Byte)?;
        list.as_text()
    }

    pub fn get_data(&self, ptr_idx: u32) -> Result<&'a [u8]> {
        let list = self.get_list(ptr_idx, ElementSize::Byte)?;
        Ok(list.as_bytes())
    }
}

// ---------------------------------------------------------------------
// List reader
// ---------------------------------------------------------------------

pub struct ListReader<'a, S>
where
    S: ReaderSegments,
{
    arena: &'a ReaderArena<S>,
    seg_id: u32,
    content_word: u32,
    element_size: ElementSize,
    count: u32,
    composite_data_words: u16,
    composite_ptr_words: u16,
    nesting_limit: i32,
}

impl<'a, S: ReaderSegments> Clone for ListReader<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, S: ReaderSegments> Copy for ListReader<'a, S> {}

impl<'a, S: ReaderSegments> ListReader<'a, S> {
    fn new_empty(arena: &'a ReaderArena<S>, element_size: ElementSize, nesting_limit: i32) -> Self {
        ListReader {
            arena,
            seg_id: 0,
            content_word: 0,
            element_size,
            count: 0,
            composite_data_words: 0,
            composite_ptr_words: 0,
            nesting_limit,
        }
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    fn step_bits(&self) -> u64 {
        match self.element_size {
            ElementSize::InlineComposite => {
                (self.composite_data_words as u64 + self.composite_ptr_words as u64) * 64
            }
            other => {
                other.data_bits_per_element() as u64 + other.pointers_per_element() as u64 * 64
            }
        }
    }

    fn raw_bytes(&self) -> Result<&'a [u8]> {
        self.arena.get_segment(self.seg_id)
    }

    /// Struct-shaped access into an inline-composite list, used for lists of
    /// structs.
    pub fn get_struct(&self, index: u32) -> StructReader<'a, S> {
        if index >= self.count || self.element_size != ElementSize::InlineComposite {
            return StructReader::new_default(self.arena, self.nesting_limit);
        }
        let elem_words = self.composite_data_words as u32 + self.composite_ptr_words as u32;
        let word = self.content_word + index * elem_words;
        StructReader {
            arena: self.arena,
            seg_id: self.seg_id,
            data_start: word,
            data_words: self.composite_data_words,
            ptr_start: word + self.composite_data_words as u32,
            ptr_words: self.composite_ptr_words,
            nesting_limit: self.nesting_limit,
        }
    }

    fn scalar_bit_offset(&self, index: u32) -> u64 {
        self.content_word as u64 * 64 + index as u64 * self.step_bits()
    }

    pub fn get_bool(&self, index: u32) -> bool {
        if index >= self.count || self.element_size != ElementSize::Bit {
            return false;
        }
        let Ok(bytes) = self.raw_bytes() else {
            return false;
        };
        let bit = self.scalar_bit_offset(index);
        let byte_idx = (bit / 8) as usize;
        ((bytes[byte_idx] >> (bit % 8)) & 1) != 0
    }

    fn get_bytes<const N: usize>(&self, index: u32, expect: ElementSize) -> Option<[u8; N]> {
        if index >= self.count || self.element_size != expect {
            return None;
        }
        let bytes = self.raw_bytes().ok()?;
        let start = (self.scalar_bit_offset(index) / 8) as usize;
        Some(bytes[start..start + N].try_into().unwrap())
    }

    pub fn get_u8(&self, index: u32) -> u8 {
        self.get_bytes::<1>(index, ElementSize::Byte)
            .map(|b| b[0])
            .unwrap_or(0)
    }
    pub fn get_i8(&self, index: u32) -> i8 {
        self.get_u8(index) as i8
    }
    pub fn get_u16(&self, index: u32) -> u16 {
        self.get_bytes::<2>(index, ElementSize::TwoBytes)
            .map(u16::from_le_bytes)
            .unwrap_or(0)
    }
    pub fn get_i16(&self, index: u32) -> i16 {
        self.get_u16(index) as i16
    }
    pub fn get_u32(&self, index: u32) -> u32 {
        self.get_bytes::<4>(index, ElementSize::FourBytes)
            .map(u32::from_le_bytes)
            .unwrap_or(0)
    }
    pub fn get_i32(&self, index: u32) -> i32 {
        self.get_u32(index) as i32
    }
    pub fn get_u64(&self, index: u32) -> u64 {
        self.get_bytes::<8>(index, ElementSize::EightBytes)
            .map(u64::from_le_bytes)
            .unwrap_or(0)
    }
    pub fn get_i64(&self, index: u32) -> i64 {
        self.get_u64(index) as i64
    }
    pub fn get_f32(&self, index: u32) -> f32 {
        f32::from_bits(self.get_u32(index))
    }
    pub fn get_f64(&self, index: u32) -> f64 {
        f64::from_bits(self.get_u64(index))
    }

    /// Raw byte view of a `Byte`-element list, used by `set_data`'s reader
    /// counterpart. Out-of-range element sizes yield an empty slice.
    pub fn as_bytes(&self) -> &'a [u8] {
        if self.element_size != ElementSize::Byte {
            return &[];
        }
        let Ok(bytes) = self.raw_bytes() else {
            return &[];
        };
        let start = self.content_word as usize * BYTES_PER_WORD;
        &bytes[start..start + self.count as usize]
    }

    /// Interprets a `Byte`-element list as NUL-terminated text.
    pub fn as_text(&self) -> Result<&'a str> {
        if self.count == 0 {
            return Ok("");
        }
        let all = self.as_bytes();
        if *all.last().unwrap() != 0 {
            return Err(Error::new(
                ErrorKind::TextNotNulTerminated,
                "text blob's final byte is not NUL",
            ));
        }
        core::str::from_utf8(&all[..all.len() - 1])
            .map_err(|_| Error::new(ErrorKind::InvalidUtf8, "text blob is not valid UTF-8"))
    }

    /// Pointer-element access, for lists of pointers (lists of lists, lists
    /// of text/data, lists of capabilities are all excluded here).
    pub fn get_pointer_struct(&self, index: u32) -> Result<StructReader<'a, S>> {
        if index >= self.count || self.element_size != ElementSize::Pointer {
            return Ok(StructReader::new_default(self.arena, self.nesting_limit));
        }
        let next_limit = if self.nesting_limit <= 0 {
            return Err(Error::new(
                ErrorKind::NestingLimitExceeded,
                "message is nested too deeply to be processed",
            ));
        } else {
            self.nesting_limit - 1
        };
        let word = self.content_word + index;
        match dereference(self.arena, self.seg_id, word)? {
            None => Ok(StructReader::new_default(self.arena, self.nesting_limit)),
            Some(Resolved::Struct {
                seg_id,
                content_word,
                data_words,
                ptr_words,
            }) => {
                self.arena
                    .charge_traversal(core::cmp::max(data_words as u64 + ptr_words as u64, 1))?;
                Ok(StructReader {
                    arena: self.arena,
                    seg_id,
                    data_start: content_word,
                    data_words,
                    ptr_start: content_word + data_words as u32,
                    ptr_words,
                    nesting_limit: next_limit,
                })
            }
            Some(Resolved::List { .. }) => Err(Error::new(
                ErrorKind::InvalidPointerType,
                "expected a struct pointer in pointer list element",
            )),
        }
    }
}

// ---------------------------------------------------------------------
// Struct / list / message builders
// ---------------------------------------------------------------------

/// A struct under construction. Holds an `(segment id, word offset)` pair
/// plus a clone of the shared arena handle rather than an aliasing
/// reference -- see the ownership notes in the crate-level design.
#[derive(Clone)]
pub struct StructBuilder {
    arena: ArenaHandle,
    seg_id: u32,
    data_start: u32,
    data_words: u16,
    ptr_start: u32,
    ptr_words: u16,
}

impl StructBuilder {
    pub fn new(
        arena: ArenaHandle,
        seg_id: u32,
        data_start: u32,
        data_words: u16,
        ptr_start: u32,
        ptr_words: u16,
    ) -> Self {
        StructBuilder {
            arena,
            seg_id,
            data_start,
            data_words,
            ptr_start,
            ptr_words,
        }
    }

    fn set_bytes(&self, byte_offset: u32, bytes: &[u8]) {
        if byte_offset as u64 + bytes.len() as u64 > self.data_words as u64 * BYTES_PER_WORD as u64
        {
            return; // out-of-bounds setter calls silently no-op, per section 4.3.
        }
        let mut arena = self.arena.borrow_mut();
        let Ok(seg) = arena.get_segment_bytes_mut(self.seg_id) else {
            return;
        };
        let start = self.data_start as usize * BYTES_PER_WORD + byte_offset as usize;
        seg[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_bool(&self, bit_offset: u32, value: bool, default: bool) {
        if bit_offset as u64 >= self.data_words as u64 * 64 {
            return;
        }
        let stored = value ^ default;
        let mut arena = self.arena.borrow_mut();
        let Ok(seg) = arena.get_segment_bytes_mut(self.seg_id) else {
            return;
        };
        let byte_idx = self.data_start as usize * BYTES_PER_WORD + (bit_offset / 8) as usize;
        let bit = bit_offset % 8;
        if stored {
            seg[byte_idx] |= 1 << bit;
        } else {
            seg[byte_idx] &= !(1 << bit);
        }
    }

    pub fn set_u8(&self, byte_offset: u32, value: u8, default: u8) {
        self.set_bytes(byte_offset, &[value ^ default]);
    }
    pub fn set_i8(&self, byte_offset: u32, value: i8, default: i8) {
        self.set_u8(byte_offset, value as u8, default as u8);
    }
    pub fn set_u16(&self, byte_offset: u32, value: u16, default: u16) {
        self.set_bytes(byte_offset, &(value ^ default).to_le_bytes());
    }
    pub fn set_i16(&self, byte_offset: u32, value: i16, default: i16) {
        self.set_u16(byte_offset, value as u16, default as u16);
    }
    pub fn set_u32(&self, byte_offset: u32, value: u32, default: u32) {
        self.set_bytes(byte_offset, &(value ^ default).to_le_bytes());
    }
    pub fn set_i32(&self, byte_offset: u32, value: i32, default: i32) {
        self.set_u32(byte_offset, value as u32, default as u32);
    }
    pub fn set_u64(&self, byte_offset: u32, value: u64, default: u64) {
        self.set_bytes(byte_offset, &(value ^ default).to_le_bytes());
    }
    pub fn set_i64(&self, byte_offset: u32, value: i64, default: i64) {
        self.set_u64(byte_offset, value as u64, default as u64);
    }
    pub fn set_f32(&self, byte_offset: u32, value: f32, default: f32) {
        self.set_u32(byte_offset, value.to_bits(), default.to_bits());
    }
    pub fn set_f64(&self, byte_offset: u32, value: f64, default: f64) {
        self.set_u64(byte_offset, value.to_bits(), default.to_bits());
    }

    fn ptr_word_index(&self, ptr_idx: u32) -> Result<u32> {
        if ptr_idx >= self.ptr_words as u32 {
            Err(Error::new(
                ErrorKind::PointerOutOfBounds,
                "pointer index out of bounds for this struct's pointer section",
            ))
        } else {
            Ok(self.ptr_start + ptr_idx)
        }
    }

    fn write_pointer_word(&self, word_idx: u32, value: u64) {
        let mut arena = self.arena.borrow_mut();
        if let Ok(seg) = arena.get_segment_bytes_mut(self.seg_id) {
            put_u64_le(seg, word_idx, value);
        }
    }

    /// Allocates and links new content from pointer slot `word_idx`,
    /// choosing a near struct/list pointer when the content lands in the
    /// same segment within the 30-bit signed offset window, and a
    /// single-indirection far pointer otherwise (see section 4.3 and the
    /// design notes on the 30-bit window).
    fn link_content(
        &self,
        word_idx: u32,
        content_words: u32,
        tag_at_offset: impl Fn(i32) -> u64,
    ) -> Result<(u32, u32)> {
        let (seg, offset) = self.arena.borrow_mut().allocate(self.seg_id, content_words)?;
        if seg == self.seg_id {
            let rel = offset as i64 - (word_idx as i64 + 1);
            if (-(1i64 << 29)..(1i64 << 29)).contains(&rel) {
                self.write_pointer_word(word_idx, tag_at_offset(rel as i32));
                return Ok((seg, offset));
            }
        }
        // Cross-segment, or an offset too large for the 30-bit signed
        // window: fall back to a single-indirection far pointer. The
        // content we already allocated at (seg, offset) is abandoned
        // (bump allocators don't support partial frees); we allocate a
        // fresh, contiguous (landing pad + content) block instead so the
        // landing pad's pointer can use offset zero.
        self.emit_far(word_idx, content_words, tag_at_offset)
    }

    fn emit_far(
        &self,
        word_idx: u32,
        content_words: u32,
        tag_at_offset: impl Fn(i32) -> u64,
    ) -> Result<(u32, u32)> {
        let (pad_seg, pad_word) = self
            .arena
            .borrow_mut()
            .allocate(self.seg_id, 1 + content_words)?;
        {
            let mut arena = self.arena.borrow_mut();
            let seg = arena.get_segment_bytes_mut(pad_seg)?;
            put_u64_le(seg, pad_word, tag_at_offset(0));
        }
        self.write_pointer_word(word_idx, encode_far_pointer(false, pad_word, pad_seg));
        Ok((pad_seg, pad_word + 1))
    }

    pub fn init_struct(&self, ptr_idx: u32, data_words: u16, ptr_words: u16) -> Result<StructBuilder> {
        let word_idx = self.ptr_word_index(ptr_idx)?;
        let content_words = data_words as u32 + ptr_words as u32;
        let (seg, content_word) = self.link_content(word_idx, content_words, move |off| {
            encode_struct_pointer(off, data_words, ptr_words)
        })?;
        Ok(StructBuilder {
            arena: self.arena.clone(),
            seg_id: seg,
            data_start: content_word,
            data_words,
            ptr_start: content_word + data_words as u32,
            ptr_words,
        })
    }

    pub fn init_list(&self, ptr_idx: u32, element_size: ElementSize, count: u32) -> Result<ListBuilder> {
        let word_idx = self.ptr_word_index(ptr_idx)?;
        let bits = element_size.data_bits_per_element() as u64 * count as u64
            + element_size.pointers_per_element() as u64 * 64 * count as u64;
        let content_words = round_bytes_up_to_words(((bits + 7) / 8) as u32);
        let code = element_size.as_code();
        let (seg, content_word) = self.link_content(word_idx, content_words, move |off| {
            encode_list_pointer(off, code, count)
        })?;
        // Zero the newly allocated region: bump-allocated memory from the
        // allocator is already zeroed, so no explicit clear is needed here.
        Ok(ListBuilder {
            arena: self.arena.clone(),
            seg_id: seg,
            content_word,
            element_size,
            count,
            composite_data_words: 0,
            composite_ptr_words: 0,
        })
    }

    pub fn init_struct_list(
        &self,
        ptr_idx: u32,
        count: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<ListBuilder> {
        let word_idx = self.ptr_word_index(ptr_idx)?;
        let elem_words = data_words as u32 + ptr_words as u32;
        let content_words = 1 + elem_words * count;
        let tag_word_count = elem_words * count;
        let (seg, tag_word) = self.link_content(word_idx, content_words, move |off| {
            encode_list_pointer(off, ElementSize::InlineComposite.as_code(), tag_word_count)
        })?;
        {
            let mut arena = self.arena.borrow_mut();
            let bytes = arena.get_segment_bytes_mut(seg)?;
            // The tag word is struct-pointer-shaped: its "offset" field
            // stores the element count, not a real offset.
            put_u64_le(bytes, tag_word, encode_struct_pointer(count as i32, data_words, ptr_words));
        }
        Ok(ListBuilder {
            arena: self.arena.clone(),
            seg_id: seg,
            content_word: tag_word + 1,
            element_size: ElementSize::InlineComposite,
            count,
            composite_data_words: data_words,
            composite_ptr_words: ptr_words,
        })
    }

    pub fn set_text(&self, ptr_idx: u32, s: &str) -> Result<()> {
        let word_idx = self.ptr_word_index(ptr_idx)?;
        let len = s.len() as u32 + 1;
        let content_words = round_bytes_up_to_words(len);
        let (seg, content_word) = self.link_content(word_idx, content_words, move |off| {
            encode_list_pointer(off, ElementSize::Byte.as_code(), len)
        })?;
        let mut arena = self.arena.borrow_mut();
        let bytes = arena.get_segment_bytes_mut(seg)?;
        let start = content_word as usize * BYTES_PER_WORD;
        bytes[start..start + s.len()].copy_from_slice(s.as_bytes());
        bytes[start + s.len()] = 0;
        Ok(())
    }

    pub fn set_data(&self, ptr_idx: u32, data: &[u8]) -> Result<()> {
        let word_idx = self.ptr_word_index(ptr_idx)?;
        if data.is_empty() {
            // Zero-length Data requires no content allocation: an empty
            // non-null Byte-list pointer with offset 0, count 0 suffices.
            self.write_pointer_word(word_idx, encode_list_pointer(0, ElementSize::Byte.as_code(), 0));
            return Ok(());
        }
        let content_words = round_bytes_up_to_words(data.len() as u32);
        let len = data.len() as u32;
        let (seg, content_word) = self.link_content(word_idx, content_words, move |off| {
            encode_list_pointer(off, ElementSize::Byte.as_code(), len)
        })?;
        let mut arena = self.arena.borrow_mut();
        let bytes = arena.get_segment_bytes_mut(seg)?;
        let start = content_word as usize * BYTES_PER_WORD;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

pub struct ListBuilder {
    arena: ArenaHandle,
    seg_id: u32,
    content_word: u32,
    element_size: ElementSize,
    count: u32,
    composite_data_words: u16,
    composite_ptr_words: u16,
}

impl ListBuilder {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn get_struct(&self, index: u32) -> StructBuilder {
        let elem_words = self.composite_data_words as u32 + self.composite_ptr_words as u32;
        let word = self.content_word + index * elem_words;
        StructBuilder {
            arena: self.arena.clone(),
            seg_id: self.seg_id,
            data_start: word,
            data_words: self.composite_data_words,
            ptr_start: word + self.composite_data_words as u32,
            ptr_words: self.composite_ptr_words,
        }
    }

    fn step_bits(&self) -> u64 {
        match self.element_size {
            ElementSize::InlineComposite => {
                (self.composite_data_words as u64 + self.composite_ptr_words as u64) * 64
            }
            other => other.data_bits_per_element() as u64,
        }
    }

    fn set_bytes(&self, index: u32, bytes: &[u8]) {
        if index >= self.count {
            return;
        }
        let bit = self.content_word as u64 * 64 + index as u64 * self.step_bits();
        let start = (bit / 8) as usize;
        let mut arena = self.arena.borrow_mut();
        let Ok(seg) = arena.get_segment_bytes_mut(self.seg_id) else {
            return;
        };
        seg[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_bool(&self, index: u32, value: bool) {
        if index >= self.count || self.element_size != ElementSize::Bit {
            return;
        }
        let bit = self.content_word as u64 * 64 + index as u64 * self.step_bits();
        let byte_idx = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let mut arena = self.arena.borrow_mut();
        let Ok(seg) = arena.get_segment_bytes_mut(self.seg_id) else {
            return;
        };
        if value {
            seg[byte_idx] |= mask;
        } else {
            seg[byte_idx] &= !mask;
        }
    }

    pub fn set_u8(&self, index: u32, value: u8) {
        self.set_bytes(index, &[value]);
    }
    pub fn set_i8(&self, index: u32, value: i8) {
        self.set_u8(index, value as u8);
    }
    pub fn set_u16(&self, index: u32, value: u16) {
        self.set_bytes(index, &value.to_le_bytes());
    }
    pub fn set_i16(&self, index: u32, value: i16) {
        self.set_u16(index, value as u16);
    }
    pub fn set_u32(&self, index: u32, value: u32) {
        self.set_bytes(index, &value.to_le_bytes());
    }
    pub fn set_i32(&self, index: u32, value: i32) {
        self.set_u32(index, value as u32);
    }
    pub fn set_u64(&self, index: u32, value: u64) {
        self.set_bytes(index, &value.to_le_bytes());
    }
    pub fn set_i64(&self, index: u32, value: i64) {
        self.set_u64(index, value as u64);
    }
    pub fn set_f32(&self, index: u32, value: f32) {
        self.set_u32(index, value.to_bits());
    }
    pub fn set_f64(&self, index: u32, value: f64) {
        self.set_u64(index, value.to_bits());
    }
}
