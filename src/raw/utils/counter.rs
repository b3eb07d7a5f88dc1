use std::sync::{
    atomic::{AtomicIsize, Ordering},
    OnceLock,
};

use super::CachePadded;

// A sharded atomic counter.
//
// Sharding the length counter of `HashMap` is important, as a single point of contention
// for insertions/deletions would undo the benefit of per-bucket locking.
pub struct Counter(Box<[CachePadded<AtomicIsize>]>);

impl Default for Counter {
    /// Create a new `Counter`.
    fn default() -> Counter {
        // available_parallelism is quite slow (microseconds).
        static CPUS: OnceLock<usize> = OnceLock::new();
        let num_cpus = *CPUS.get_or_init(|| {
            std::thread::available_parallelism()
                .map(Into::into)
                .unwrap_or(1)
        });

        // Round up to the next power-of-two for fast modulo.
        let shards = (0..num_cpus.next_power_of_two())
            .map(|_| Default::default())
            .collect();

        Counter(shards)
    }
}

impl Counter {
    // Return the shard for the given thread ID.
    #[inline]
    pub fn get(&self, guard: &impl seize::Guard) -> &AtomicIsize {
        // Guard thread IDs are densely allocated, which makes contention between
        // threads sharing a shard unlikely.
        let shard = guard.thread_id() & (self.0.len() - 1);

        &self.0[shard]
    }

    // Returns the sum of all counter shards.
    #[inline]
    pub fn sum(&self) -> usize {
        self.0
            .iter()
            .map(|x| x.load(Ordering::Relaxed))
            .sum::<isize>()
            .try_into()
            // Depending on the order of deletion/insertions this might be negative,
            // in which case we assume the map is empty.
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_across_shards() {
        let collector = seize::Collector::new();
        let counter = Counter::default();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let guard = collector.enter();
                    for _ in 0..100 {
                        counter.get(&guard).fetch_add(1, Ordering::Relaxed);
                    }
                    counter.get(&guard).fetch_sub(10, Ordering::Relaxed);
                });
            }
        });

        assert_eq!(counter.sum(), 360);
    }

    #[test]
    fn negative_sum_is_empty() {
        let collector = seize::Collector::new();
        let counter = Counter::default();
        counter
            .get(&collector.enter())
            .fetch_sub(1, Ordering::Relaxed);
        assert_eq!(counter.sum(), 0);
    }
}
