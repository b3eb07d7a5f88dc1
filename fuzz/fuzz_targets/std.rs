#![no_main]

use libfuzzer_sys::fuzz_target;

use arbitrary::Arbitrary;
use seqmap::HashMap as SeqHashMap;
use std::collections::HashMap as StdHashMap;

#[derive(Debug, Arbitrary)]
enum Operation<K, V> {
    Emplace(K, V),
    Extract(K),
    Erase(K),
    Get(K),
    Contains(K),
    Len,
    IsEmpty,
    // Erase every item whose value is even through an iterator.
    EraseEven,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    // Small tables and pools exercise overflow chains and growth.
    capacity: u8,
    extension_items: u8,
    operations: Vec<Operation<u32, u32>>,
}

fn fuzz_hashmap(input: FuzzInput) {
    let mut std_map = StdHashMap::new();
    let seq_raw = SeqHashMap::builder()
        .capacity(input.capacity as usize)
        .extension_ratio(1 + input.capacity as usize / 4)
        .extension_items(1 + input.extension_items as usize % 16)
        .build();
    let seq_map = seq_raw.pin();

    for op in input.operations {
        match op {
            Operation::Emplace(k, v) => {
                let std_result = match std_map.entry(k) {
                    std::collections::hash_map::Entry::Occupied(_) => false,
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(v);
                        true
                    }
                };
                let seq_result = seq_map.emplace(k, v);
                assert_eq!(std_result, seq_result);
            }
            Operation::Extract(k) => {
                let std_result = std_map.remove(&k);
                let seq_result = seq_map.extract(&k);
                assert_eq!(std_result, seq_result);
            }
            Operation::Erase(k) => {
                let std_result = std_map.remove(&k).is_some();
                let seq_result = seq_map.erase(&k);
                assert_eq!(std_result, seq_result);
            }
            Operation::Get(k) => {
                let std_result = std_map.get(&k).copied();
                let seq_result = seq_map.try_get_value(&k);
                assert_eq!(std_result, seq_result);
            }
            Operation::Contains(k) => {
                let std_result = std_map.contains_key(&k);
                let seq_result = seq_map.contains(&k);
                assert_eq!(std_result, seq_result);
            }
            Operation::Len => {
                assert_eq!(std_map.len(), seq_map.len());
            }
            Operation::IsEmpty => {
                assert_eq!(std_map.is_empty(), seq_map.is_empty());
            }
            Operation::EraseEven => {
                std_map.retain(|_, v| *v % 2 == 1);

                let mut iter = seq_map.iter();
                while let Some((_, v)) = iter.get() {
                    if v % 2 == 0 {
                        iter.erase();
                    } else {
                        iter.advance();
                    }
                }
            }
        }
    }

    // Final consistency checks
    for (k, v) in std_map.iter() {
        assert_eq!(Some(*v), seq_map.try_get_value(k));
    }
    assert_eq!(std_map.len(), seq_map.len());
    assert_eq!(std_map.len(), seq_map.iter().count());
}

fuzz_target!(|data: FuzzInput| {
    fuzz_hashmap(data);
});
