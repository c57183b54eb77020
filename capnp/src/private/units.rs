// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE at the crate root.

//! Small unit-conversion helpers shared by the arena and layout modules.

pub const BYTES_PER_WORD: usize = 8;

/// Element sizes that can appear in a list pointer's 3-bit size code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    /// Inline composite (struct) list. Not a valid element-size code on the
    /// wire by itself -- it is implied by the tag word preceding the list
    /// content.
    InlineComposite = 7,
}

impl ElementSize {
    pub fn from_code(code: u8) -> Option<ElementSize> {
        Some(match code {
            0 => ElementSize::Void,
            1 => ElementSize::Bit,
            2 => ElementSize::Byte,
            3 => ElementSize::TwoBytes,
            4 => ElementSize::FourBytes,
            5 => ElementSize::EightBytes,
            6 => ElementSize::Pointer,
            7 => ElementSize::InlineComposite,
            _ => return None,
        })
    }

    pub fn as_code(self) -> u8 {
        self as u8
    }

    /// Bits occupied by a single element of this size. Meaningless for
    /// `InlineComposite`, whose per-element layout is described by a tag word.
    pub fn data_bits_per_element(self) -> u32 {
        match self {
            ElementSize::Void => 0,
            ElementSize::Bit => 1,
            ElementSize::Byte => 8,
            ElementSize::TwoBytes => 16,
            ElementSize::FourBytes => 32,
            ElementSize::EightBytes => 64,
            ElementSize::Pointer => 0,
            ElementSize::InlineComposite => 0,
        }
    }

    pub fn pointers_per_element(self) -> u32 {
        match self {
            ElementSize::Pointer => 1,
            _ => 0,
        }
    }
}

/// Rounds a bit count up to a whole number of 8-byte words.
pub fn round_bits_up_to_words(bits: u64) -> u32 {
    ((bits + 63) / (8 * BYTES_PER_WORD as u64)) as u32
}

/// Rounds a byte count up to a whole number of 8-byte words.
pub fn round_bytes_up_to_words(bytes: u32) -> u32 {
    (bytes + 7) / 8
}
