use seqmap::{HashMap, Managed};

use std::hash::{BuildHasherDefault, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod common;
use common::with_map;

#[derive(Default)]
struct Zero;

impl Hasher for Zero {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _: &[u8]) {}
}

// Counts the number of times it was dropped.
struct Tracked {
    id: usize,
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    fn new(id: usize, drops: &Arc<AtomicUsize>) -> Managed<Tracked> {
        Managed::new(Tracked {
            id,
            drops: drops.clone(),
        })
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn extracted_value_outlives_removal() {
    with_map::<u64, Managed<String>>(|map| {
        let map = map();
        let guard = map.guard();

        map.emplace(1, Managed::new("one".to_owned()), &guard);
        let value = map.try_get_value(&1, &guard).unwrap();
        let removed = map.extract(&1, &guard).unwrap();

        // Both references are protected by `guard`.
        assert_eq!(value, "one");
        assert_eq!(removed, "one");
        assert!(std::ptr::eq(value, removed));
        assert!(map.try_get_value(&1, &guard).is_none());
    });
}

#[test]
fn rejected_value_is_dropped() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u32, Managed<Tracked>> = HashMap::new();

    {
        let map = map.pin();
        assert!(map.emplace(1, Tracked::new(1, &drops)));
        assert!(!map.emplace(1, Tracked::new(2, &drops)));

        // The rejected value was never published and is dropped right away.
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(map.try_get_value(&1).unwrap().id, 1);
    }

    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

#[test]
fn removed_values_are_reclaimed() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u32, Managed<Tracked>> = HashMap::new();

    for i in 0..100 {
        map.pin().emplace(i, Tracked::new(i as usize, &drops));
    }

    for i in 0..100 {
        let guard = map.guard();
        let removed = map.extract(&i, &guard).unwrap();
        assert_eq!(removed.id, i as usize);
        assert!(!map.erase(&i, &guard));
    }

    // Retired values are freed no later than the map itself.
    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 100);
}

#[test]
fn drop_releases_overflow_chains() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u32, Managed<Tracked>, BuildHasherDefault<Zero>> = HashMap::builder()
        .capacity(1)
        .hasher(BuildHasherDefault::default())
        .build();

    // Three inline items and a chain of five.
    for i in 0..8 {
        map.pin().emplace(i, Tracked::new(i as usize, &drops));
    }
    assert_eq!(map.pin().bucket_count(), 1);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 8);
}

#[test]
fn drop_after_growth() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u32, Managed<Tracked>> = HashMap::builder()
        .capacity(1)
        .extension_ratio(1)
        .extension_items(1)
        .build();

    for i in 0..1000 {
        map.pin().emplace(i, Tracked::new(i as usize, &drops));
    }
    assert!(map.pin().bucket_count() > 1);

    // Migration moves values without dropping them.
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    for i in 0..1000 {
        assert_eq!(map.pin().try_get_value(&i).unwrap().id, i as usize);
    }

    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 1000);
}

#[test]
fn iterator_erase_retires_value() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u32, Managed<Tracked>> = HashMap::new();

    for i in 0..64 {
        map.pin().emplace(i, Tracked::new(i as usize, &drops));
    }

    {
        let guard = map.guard();
        let mut iter = map.iter(&guard);
        let mut erased = Vec::new();
        while let Some((key, value)) = iter.get() {
            assert_eq!(value.id, key as usize);
            if key < 32 {
                erased.push(value);
                iter.erase();
            } else {
                iter.advance();
            }
        }
        drop(iter);

        // Erased values stay readable while the guard is held.
        assert_eq!(erased.len(), 32);
        for value in erased {
            assert!(value.id < 32);
        }
    }

    assert_eq!(map.len(), 32);
    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 64);
}

#[test]
fn accessor_equality() {
    let a: HashMap<u32, Managed<String>> = HashMap::new();
    let b: HashMap<u32, Managed<String>> = HashMap::new();

    a.pin().emplace(1, Managed::new("x".to_owned()));
    b.pin().emplace(1, Managed::new("x".to_owned()));
    assert_eq!(a, b);

    b.pin().erase(&1);
    b.pin().emplace(1, Managed::new("y".to_owned()));
    assert_ne!(a, b);
}
