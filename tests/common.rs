#![allow(dead_code)]

use seqmap::{HashMap, Value, Word};

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K: Word, V: Value>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>)) {
    // The default configuration.
    if !cfg!(seqmap_stress) {
        test(&(|| HashMap::new()));
    }

    // A single bucket with a single overflow item, forcing frequent resizes.
    test(
        &(|| {
            HashMap::builder()
                .capacity(1)
                .extension_ratio(1)
                .extension_items(1)
                .build()
        }),
    );

    // A small table sharing a small extension pool, to stress overflow chains.
    test(
        &(|| {
            HashMap::builder()
                .capacity(64)
                .extension_ratio(64)
                .extension_items(4)
                .build()
        }),
    );
}

// Prints a log message if `RUST_LOG=debug` is set.
#[macro_export]
macro_rules! debug {
    ($($x:tt)*) => {
        if std::env::var("RUST_LOG").as_deref() == Ok("debug") {
            println!($($x)*);
        }
    };
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}
