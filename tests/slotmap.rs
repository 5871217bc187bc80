use slotmap_rs::{DenseSlotMap, ErrorKind, SlotMapConfig, SparseSlotMap};

#[test]
fn dense_basic_add_remove_contains() {
    let mut map: DenseSlotMap<i32> = DenseSlotMap::with_config(SlotMapConfig::new(4, 2)).unwrap();
    let k1 = map.add(8).unwrap();
    let k2 = map.add(9).unwrap();
    let k3 = map.add(22).unwrap();
    assert!(map.remove(k2).unwrap());
    assert!(!map.contains(k2));
    assert!(map.contains(k3));
    assert_eq!(*map.get(k3).unwrap(), 22);
    let _ = k1;
}

#[test]
fn dense_replace_invalidates_old_key() {
    let mut map: DenseSlotMap<i32> = DenseSlotMap::new();
    let k1 = map.add(1).unwrap();
    let k_new = map.replace(k1, 53).unwrap();
    assert_eq!(*map.get(k_new).unwrap(), 53);
    let err = map.get(k1).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::StaleKey { .. }));
    assert!(map.try_get(k1).is_none());
}

#[test]
fn dense_recycling_honours_threshold() {
    let mut map: DenseSlotMap<i32> =
        DenseSlotMap::with_config(SlotMapConfig::new(8, 2)).unwrap();
    let keys: Vec<_> = (0..5).map(|i| map.add(i).unwrap()).collect();
    map.remove(keys[0]).unwrap();
    map.remove(keys[1]).unwrap();
    let next = map.add(100).unwrap();
    assert_eq!(next.index(), 5, "queue at the limit should not recycle yet");

    map.remove(keys[2]).unwrap();
    let recycled = map.add(200).unwrap();
    assert_eq!(recycled.index(), keys[0].index());
}

#[test]
fn dense_page_boundary() {
    let mut map: DenseSlotMap<i32> =
        DenseSlotMap::with_config(SlotMapConfig::new(4, 2)).unwrap();
    let keys: Vec<_> = (0..9).map(|i| map.add(i).unwrap()).collect();
    assert_eq!(map.page_count(), 3);
    assert_eq!(map.slot_count(), 9);
    for key in keys {
        map.remove(key).unwrap();
    }
    assert_eq!(map.page_count(), 3);
    assert_eq!(map.slot_count(), 0);
}

#[test]
fn sparse_swap_remove_preserves_packing_and_iteration_order() {
    let mut map: SparseSlotMap<char> =
        SparseSlotMap::with_config(SlotMapConfig::new(4, 2)).unwrap();
    let _a = map.add('A').unwrap();
    let b = map.add('B').unwrap();
    let _c = map.add('C').unwrap();
    let _d = map.add('D').unwrap();
    let _e = map.add('E').unwrap();

    map.remove(b).unwrap();

    let values: Vec<char> = map.iter().map(|(_, v)| *v).collect();
    assert_eq!(values, vec!['A', 'E', 'C', 'D']);
}

#[test_log::test]
fn sparse_enumerator_fails_fast_on_concurrent_mutation() {
    let mut map: SparseSlotMap<i32> = SparseSlotMap::new();
    map.add(1).unwrap();
    map.add(2).unwrap();
    map.add(3).unwrap();

    let mut en = map.enumerator();
    assert!(en.step().unwrap());
    let _ = en.current().unwrap();

    map.add(4).unwrap();

    let err = en.step().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::EnumerationInvalidated));
}

#[test]
fn round_trip_remove_all_leaves_every_key_stale() {
    let mut map: DenseSlotMap<u32> = DenseSlotMap::new();
    let keys: Vec<_> = (0..200).map(|i| map.add(i).unwrap()).collect();
    for &key in &keys {
        map.remove(key).unwrap();
    }
    assert_eq!(map.slot_count(), 0);
    for key in keys {
        assert!(map.try_get(key).is_none());
    }
}

#[test]
fn sparse_iteration_count_matches_live_slots() {
    let mut map: SparseSlotMap<i32> = SparseSlotMap::with_config(SlotMapConfig::new(4, 1)).unwrap();
    let keys: Vec<_> = (0..20).map(|i| map.add(i).unwrap()).collect();
    for &key in keys.iter().step_by(3) {
        map.remove(key).unwrap();
    }
    assert_eq!(map.iter().count() as u32, map.slot_count());
}

#[test]
fn rejects_non_power_of_two_page_size() {
    let result = DenseSlotMap::<i32>::with_config(SlotMapConfig::new(3, 1));
    assert!(result.is_err());
}
