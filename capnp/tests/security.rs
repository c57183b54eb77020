//! Bounds, traversal, and nesting defenses against untrusted input, plus a
//! handful of wire-format corner cases spelled out byte-exactly enough to
//! be worth pinning down in a test rather than just prose.

use capnp::message::{Builder, HeapAllocator, ReaderOptions};
use capnp::private::units::ElementSize;
use capnp::serialize;
use capnp::ErrorKind;

#[test]
fn traversal_limit_is_charged_per_dereference_not_at_read_time() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        let list = root.init_list(0, ElementSize::EightBytes, 100).unwrap();
        for i in 0..100u32 {
            list.set_u64(i, i as u64);
        }
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    // A tight limit must not prevent opening the message at all -- only
    // dereferencing past the budget should fail.
    let tight = ReaderOptions {
        traversal_limit_in_words: Some(10),
        nesting_limit: 64,
    };
    let reader = serialize::read_message(&bytes[..], tight).unwrap();
    let root = reader.get_root().unwrap();
    let err = root
        .get_list(0, ElementSize::EightBytes)
        .expect_err("100-word list should blow a 10-word traversal budget");
    assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
}

#[test]
fn void_list_amplification_is_charged_by_element_count() {
    // A Void list costs zero bits per element on the wire, so without a
    // per-element charge a tiny message could claim to contain an
    // arbitrarily large list almost for free.
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        root.init_list(0, ElementSize::Void, 10_000).unwrap();
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let tight = ReaderOptions {
        traversal_limit_in_words: Some(1_000),
        nesting_limit: 64,
    };
    let reader = serialize::read_message(&bytes[..], tight).unwrap();
    let root = reader.get_root().unwrap();
    let err = root
        .get_list(0, ElementSize::Void)
        .expect_err("10000-element void list should exceed a 1000-word budget");
    assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
}

#[test]
fn nesting_limit_rejects_a_deep_chain_of_structs() {
    let mut builder = Builder::new_default();
    {
        let mut current = builder.init_root(0, 1).unwrap();
        for _ in 0..70 {
            current = current.init_struct(0, 0, 1).unwrap();
        }
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let shallow = ReaderOptions {
        traversal_limit_in_words: Some(8 * 1024 * 1024),
        nesting_limit: 5,
    };
    let reader = serialize::read_message(&bytes[..], shallow).unwrap();
    let mut current = reader.get_root().unwrap();
    let mut err_kind = None;
    for _ in 0..70 {
        match current.get_struct(0) {
            Ok(next) => current = next,
            Err(e) => {
                err_kind = Some(e.kind);
                break;
            }
        }
    }
    assert_eq!(err_kind, Some(ErrorKind::NestingLimitExceeded));
}

#[test]
fn crafted_out_of_bounds_pointer_is_rejected() {
    // Hand-build a one-segment message whose root pointer claims a struct
    // with a data section wider than the segment actually is.
    let mut raw = vec![0u8; 8];
    // Struct pointer, offset 0, data_words = 100 (way past the 1-word
    // segment), ptr_words = 0.
    let bad_ptr: u64 = 0 | (100u64) << 32;
    raw[0..8].copy_from_slice(&bad_ptr.to_le_bytes());

    let mut framed = Vec::new();
    framed.extend_from_slice(&0u32.to_le_bytes()); // segment_count - 1 == 0
    framed.extend_from_slice(&1u32.to_le_bytes()); // segment 0 is 1 word
    framed.extend_from_slice(&raw);

    let reader = serialize::read_message(&framed[..], ReaderOptions::default()).unwrap();
    let err = reader.get_root().expect_err("offset runs past the segment");
    assert_eq!(err.kind, ErrorKind::PointerOutOfBounds);
}

#[test]
fn frame_header_length_rounds_up_to_eight_bytes() {
    // One segment: header is exactly 4*(1+1) = 8 bytes, no padding.
    let mut one_segment = Builder::new_default();
    one_segment.init_root(1, 0).unwrap();
    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &one_segment).unwrap();
    assert_eq!(&bytes[0..4], &0u32.to_le_bytes());
    // data starts right after the 8-byte header.
    assert_eq!(bytes.len(), 8 + 8 * 1);

    // Force a second segment by starving the first of room for the child
    // struct, so the frame header must describe two segments: 4*(1+2) = 12,
    // rounded up to 16.
    let mut two_segments = Builder::new(HeapAllocator::new().first_segment_words(2));
    {
        let root = two_segments.init_root(0, 1).unwrap();
        let child = root.init_struct(0, 1, 0).unwrap();
        child.set_u64(0, 42, 0);
    }
    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &two_segments).unwrap();
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1); // N - 1 == 1
    assert_eq!(&bytes[12..16], &[0, 0, 0, 0]); // alignment pad

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_struct(0).unwrap().get_u64(0, 0), 42);
}

#[test]
fn zero_sized_root_struct_allocates_only_the_pointer_word() {
    let mut builder = Builder::new_default();
    builder.init_root(0, 0).unwrap();
    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();
    // 8-byte header + a single root pointer word.
    assert_eq!(bytes.len(), 16);
    // Zero-sized struct pointer encodes offset = -1: low 32 bits are
    // 0xFFFF_FFFC (offset -1 in the low-30-bit field, shifted left 2, kind bits 0).
    let ptr = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    assert_eq!(ptr, 0xFFFF_FFFC);

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_u64(0, 0), 0); // defaults for an empty struct
}

#[test]
fn defaults_are_returned_for_null_and_out_of_bounds_reads() {
    let mut builder = Builder::new_default();
    builder.init_root(1, 1).unwrap(); // data word present, but left at zero; pointer is null
    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_u64(0, 0xABCD), 0xABCD, "zero XOR default == default");
    assert_eq!(root.get_u32(4096, 7), 7, "out-of-bounds offset returns the default");
    assert!(!root.has_pointer(0));
    let child = root.get_struct(0).unwrap();
    assert_eq!(child.get_u64(0, 99), 99, "null pointer dereferences to an all-default struct");
}

#[test]
fn cross_segment_pointer_resolves_through_a_far_pointer() {
    // A first segment too small to hold the child struct forces the
    // builder to land it in segment 1 and link via a single-indirection
    // far pointer.
    let mut builder = Builder::new(HeapAllocator::new().first_segment_words(2));
    {
        let root = builder.init_root(0, 1).unwrap();
        let child = root.init_struct(0, 1, 0).unwrap();
        child.set_u64(0, 0x1234_5678, 0);
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    let child = root.get_struct(0).unwrap();
    assert_eq!(child.get_u64(0, 0), 0x1234_5678);
}
