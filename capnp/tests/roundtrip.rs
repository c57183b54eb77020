use capnp::message::{Builder, ReaderOptions};
use capnp::private::units::ElementSize;
use capnp::serialize;
use capnp::serialize_packed;

#[test]
fn single_segment_struct_round_trips_through_flat_framing() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(1, 0).unwrap();
        root.set_u64(0, 0xDEAD_BEEF_CAFE_BABE, 0);
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_u64(0, 0), 0xDEAD_BEEF_CAFE_BABE);
}

#[test]
fn nested_struct_pointer_round_trips() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        let child = root.init_struct(0, 1, 0).unwrap();
        child.set_u64(0, 42, 0);
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    let child = root.get_struct(0).unwrap();
    assert_eq!(child.get_u64(0, 0), 42);
}

#[test]
fn text_and_data_blobs_round_trip() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 2).unwrap();
        root.set_text(0, "hello, capnp").unwrap();
        root.set_data(1, &[1, 2, 3, 4, 5]).unwrap();
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_text(0).unwrap(), "hello, capnp");
    assert_eq!(root.get_data(1).unwrap(), &[1, 2, 3, 4, 5]);
}

#[test]
fn primitive_list_round_trips() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        let list = root.init_list(0, ElementSize::EightBytes, 5).unwrap();
        for i in 0..5u32 {
            list.set_u64(i, (i as u64) * 11);
        }
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    let list = root.get_list(0, ElementSize::EightBytes).unwrap();
    assert_eq!(list.len(), 5);
    for i in 0..5u32 {
        assert_eq!(list.get_u64(i), (i as u64) * 11);
    }
}

#[test]
fn bit_packed_bool_list_round_trips() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        let list = root.init_list(0, ElementSize::Bit, 10).unwrap();
        for i in 0..10u32 {
            list.set_bool(i, i % 3 == 0);
        }
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    let list = root.get_list(0, ElementSize::Bit).unwrap();
    assert_eq!(list.len(), 10);
    for i in 0..10u32 {
        assert_eq!(list.get_bool(i), i % 3 == 0);
    }
}

#[test]
fn composite_list_of_structs_round_trips() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(0, 1).unwrap();
        let list = root.init_struct_list(0, 2, 1, 0).unwrap();
        list.get_struct(0).set_u64(0, 100, 0);
        list.get_struct(1).set_u64(0, 200, 0);
    }

    let mut bytes = Vec::new();
    serialize::write_message(&mut bytes, &builder).unwrap();

    let reader = serialize::read_message(&bytes[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    let list = root.get_list(0, ElementSize::InlineComposite).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.get_struct(0).get_u64(0, 0), 100);
    assert_eq!(list.get_struct(1).get_u64(0, 0), 200);
}

#[test]
fn packed_round_trip_matches_flat_round_trip() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(2, 0).unwrap();
        root.set_u64(0, 0x0102_0304_0506_0708, 0);
        root.set_u64(8, 0, 0); // all-zero word, should pack to a single run byte
    }

    let mut packed = Vec::new();
    serialize_packed::write_packed_message(&mut packed, &builder).unwrap();

    let mut flat = Vec::new();
    serialize::write_message(&mut flat, &builder).unwrap();
    assert!(
        packed.len() < flat.len(),
        "packed encoding ({} bytes) should be smaller than flat ({} bytes)",
        packed.len(),
        flat.len()
    );

    let reader = serialize_packed::read_packed_message(&packed[..], ReaderOptions::default()).unwrap();
    let root = reader.get_root().unwrap();
    assert_eq!(root.get_u64(0, 0), 0x0102_0304_0506_0708);
    assert_eq!(root.get_u64(8, 0), 0);
}

#[test]
fn pack_into_vec_matches_known_sample() {
    let unpacked: [u8; 8] = [0x08, 0, 0, 0, 0x03, 0, 0x02, 0];
    let packed = serialize_packed::pack_into_vec(&unpacked).unwrap();
    assert_eq!(packed, vec![0x51, 0x08, 0x03, 0x02]);

    let round_tripped = serialize_packed::unpack_into_vec(&packed, 1024).unwrap();
    assert_eq!(round_tripped, unpacked);
}

#[test]
fn traversal_limit_is_enforced_on_a_long_list() {
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

    let tight_options = ReaderOptions {
        traversal_limit_in_words: Some(10),
        nesting_limit: 64,
    };
    let reader = serialize::read_message(&bytes[..], tight_options).unwrap();
    let root = reader.get_root().unwrap();
    let result = root.get_list(0, ElementSize::EightBytes);
    assert!(result.is_err(), "expected traversal limit to be exceeded");
}

#[test]
fn clearing_a_builder_resets_its_output_to_an_empty_root() {
    let mut builder = Builder::new_default();
    {
        let root = builder.init_root(1, 0).unwrap();
        root.set_u64(0, 777, 0);
    }
    builder.clear();
    let root = builder.init_root(1, 0).unwrap();
    assert_eq!(root.get_u64(0, 0), 0);
}

#[test]
fn pack_unpack_round_trips_over_arbitrary_word_aligned_input() {
    fn round_trip(mut words: Vec<u64>) -> bool {
        words.truncate(4096);
        let unpacked: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let packed = serialize_packed::pack_into_vec(&unpacked).unwrap();
        let restored = serialize_packed::unpack_into_vec(&packed, 1 << 20).unwrap();
        restored == unpacked
    }
    quickcheck::quickcheck(round_trip as fn(Vec<u64>) -> bool);
}
