use binary_fuse_filter::BinaryFuse8;

#[test]
fn no_false_negatives_over_a_thousand_multiples_of_seven() {
    let keys: Vec<u64> = (1..=1000u64).map(|i| 7 * i).collect();
    let filter = BinaryFuse8::try_new_with_seed(&keys, 42).expect("construction should converge");

    for &k in &keys {
        assert!(filter.contain(k), "expected {k} to be a member");
    }
}

#[test]
fn zero_is_very_likely_absent() {
    let keys: Vec<u64> = (1..=1000u64).map(|i| 7 * i).collect();
    let filter = BinaryFuse8::try_new_with_seed(&keys, 42).expect("construction should converge");
    assert!(!filter.contain(0));
}

#[test]
fn segment_len_is_a_power_of_two() {
    let keys: Vec<u64> = (0..100_000u64).collect();
    let filter = BinaryFuse8::try_new_with_seed(&keys, 7).expect("construction should converge");
    assert_eq!(filter.segment_len().count_ones(), 1);
}

#[test]
fn false_positive_rate_is_close_to_one_in_256() {
    let keys: Vec<u64> = (0..50_000u64).map(|i| i * 2 + 1).collect();
    let filter = BinaryFuse8::try_new_with_seed(&keys, 99).expect("construction should converge");

    let probes = 200_000u64;
    let mut false_positives = 0u64;
    for i in 0..probes {
        let candidate = i * 2; // disjoint from the odd key set
        if filter.contain(candidate) {
            false_positives += 1;
        }
    }
    let rate = false_positives as f64 / probes as f64;
    assert!(rate > 0.5 / 256.0 && rate < 1.5 / 256.0, "observed fpr {rate}");
}

#[test]
fn contain_batch_agrees_with_contain() {
    let keys: Vec<u64> = (1..=2000u64).collect();
    let filter = BinaryFuse8::try_new_with_seed(&keys, 5).expect("construction should converge");

    let probes: Vec<u64> = (0..4096u64).collect();
    let mut batch_results = vec![false; probes.len()];
    filter.contain_batch(&probes, &mut batch_results);

    for (i, &k) in probes.iter().enumerate() {
        assert_eq!(batch_results[i], filter.contain(k), "mismatch at key {k}");
    }
}

#[test]
fn duplicate_keys_fail_construction() {
    let mut keys = vec![1u64, 2, 3, 4, 5];
    keys.push(1); // duplicate
    let result = binary_fuse_filter::BinaryFuse8::try_new_with_seed(&keys, 1);
    assert!(result.is_err());
}
