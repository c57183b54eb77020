use funnel_hash_table::{FunnelTable, InsertResult};

#[test]
fn insert_and_get_round_trip() {
    let mut table: FunnelTable<u64, u64> = FunnelTable::with_capacity(16, 0.5).unwrap();
    for i in 0..300u64 {
        table.set(i, i * 100).unwrap();
    }
    for i in 0..300u64 {
        assert_eq!(table.get(&i), Some(&(i * 100)), "missing key {i}");
    }
    assert!(table.capacity() >= 32, "table should have grown past its initial capacity");
}

#[test]
fn set_replaces_existing_key() {
    let mut table: FunnelTable<&str, i32> = FunnelTable::with_capacity(8, 0.3).unwrap();
    assert_eq!(table.set("a", 1).unwrap(), InsertResult::Inserted);
    assert_eq!(table.set("a", 2).unwrap(), InsertResult::Replaced);
    assert_eq!(table.get(&"a"), Some(&2));
    assert_eq!(table.len(), 1);
}

#[test]
fn remove_then_reinsert_reuses_tombstone_slot() {
    let mut table: FunnelTable<u64, u64> = FunnelTable::with_capacity(8, 0.3).unwrap();
    for i in 0..6u64 {
        table.set(i, i).unwrap();
    }
    assert!(table.remove(&3));
    assert!(!table.contains_key(&3));
    assert_eq!(table.len(), 5);

    table.set(3, 999).unwrap();
    assert_eq!(table.get(&3), Some(&999));
    assert_eq!(table.len(), 6);
}

#[test]
fn remove_of_absent_key_returns_false() {
    let mut table: FunnelTable<u64, u64> = FunnelTable::with_capacity(8, 0.3).unwrap();
    table.set(1, 1).unwrap();
    assert!(!table.remove(&2));
}

#[test]
fn clear_empties_the_table_without_shrinking_capacity() {
    let mut table: FunnelTable<u64, u64> = FunnelTable::with_capacity(16, 0.3).unwrap();
    for i in 0..10u64 {
        table.set(i, i).unwrap();
    }
    let capacity_before = table.capacity();
    table.clear();
    assert_eq!(table.len(), 0);
    assert!(table.is_empty());
    assert_eq!(table.capacity(), capacity_before);
    for i in 0..10u64 {
        assert!(table.get(&i).is_none());
    }
}

#[test]
fn rejects_non_power_of_two_capacity() {
    let result: Result<FunnelTable<u64, u64>, _> = FunnelTable::with_capacity(10, 0.5);
    assert!(result.is_err());
}

#[test]
fn rejects_capacity_below_eight() {
    let result: Result<FunnelTable<u64, u64>, _> = FunnelTable::with_capacity(4, 0.5);
    assert!(result.is_err());
}

#[test]
fn string_keys_hash_by_content() {
    let mut table: FunnelTable<String, u32> = FunnelTable::with_capacity(16, 0.4).unwrap();
    table.set("hello".to_string(), 1).unwrap();
    table.set("world".to_string(), 2).unwrap();
    assert_eq!(table.get(&"hello".to_string()), Some(&1));
    assert_eq!(table.get(&"world".to_string()), Some(&2));
    assert_eq!(table.get(&"missing".to_string()), None);
}

#[test]
fn grows_past_initial_capacity_under_sustained_load() {
    let mut table: FunnelTable<u64, u64> = FunnelTable::with_capacity(8, 0.5).unwrap();
    for i in 0..5000u64 {
        table.set(i, i).unwrap();
    }
    for i in 0..5000u64 {
        assert_eq!(table.get(&i), Some(&i));
    }
    assert_eq!(table.len(), 5000);
}
