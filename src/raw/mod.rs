mod alloc;
mod bucket;
mod extension;
mod iter;
mod utils;

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use self::alloc::{RawTable, Table};
use self::bucket::{Scan, INLINE_ITEMS};
use self::utils::{trace, Counter};
use crate::backoff::Backoff;
use crate::map::GrowError;
use crate::value::{AssertWord, Bits, Value, Word};

pub use alloc::PoolConfig;
pub use iter::Iter;

/// A concurrent hash-table with lock-free reads and per-bucket locking for writes.
pub struct HashMap<K: Word, V: Value, S, B> {
    /// The current table generation.
    table: AtomicPtr<RawTable>,

    /// Collector for retired tables and managed values.
    collector: Collector,

    /// Hasher for keys.
    pub hasher: S,

    /// The number of items in the map.
    count: Counter,

    /// Set while a thread is growing the table.
    resizing: AtomicU32,

    pool: PoolConfig,
    _kv: PhantomData<(K, V, fn() -> B)>,
}

// Releases the resize flag and wakes any parked waiters.
struct ResizeGuard<'a>(&'a AtomicU32);

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
        atomic_wait::wake_all(self.0);
    }
}

impl<K: Word, V: Value, S, B> HashMap<K, V, S, B> {
    /// Creates new hash-table with the given options.
    pub fn new(capacity: usize, hasher: S, collector: Collector, pool: PoolConfig) -> HashMap<K, V, S, B> {
        let () = AssertWord::<K>::OK;

        assert!(pool.ratio > 0, "extension ratio must be non-zero");
        assert!(pool.items > 0, "extension group size must be non-zero");

        let len = capacity.max(1).next_power_of_two();
        let table = match Table::<K, V>::alloc(len, pool) {
            Ok(table) => table,
            Err(GrowError::AllocFailed { layout }) => std::alloc::handle_alloc_error(layout),
            Err(err) => panic!("{err}"),
        };

        HashMap {
            table: AtomicPtr::new(table.raw),
            collector,
            hasher,
            count: Counter::default(),
            resizing: AtomicU32::new(0),
            pool,
            _kv: PhantomData,
        }
    }

    /// Returns a guard for this collector.
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Returns an owned guard for this collector.
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.collector.enter_owned()
    }

    /// Verify a guard is valid to use with this map.
    #[inline]
    pub fn verify<G: Guard>(&self, guard: &G) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "Attempted to access map with incorrect guard"
        );
    }

    /// Returns the number of items in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.sum()
    }

    /// Returns the number of buckets in the current table.
    #[inline]
    pub fn bucket_count(&self, guard: &impl Guard) -> usize {
        self.root(guard).len()
    }

    // Returns the current table, protected by the guard.
    #[inline]
    fn root(&self, guard: &impl Guard) -> Table<K, V> {
        let raw = guard.protect(&self.table, Ordering::Acquire);

        // Safety: The root table is never null and stays allocated while the guard is held.
        unsafe { Table::from_raw(raw) }
    }
}

impl<K, V, S, B> HashMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    /// Returns the stored value for a key without acquiring any locks.
    #[inline]
    pub fn get<'g>(&self, key: &K, guard: &'g impl Guard) -> Option<V::Accessor<'g>> {
        let hash = self.hasher.hash_one(key);
        let mut backoff = B::default();

        loop {
            let table = self.root(guard);
            let bucket = table.bucket_for(hash);
            let state = bucket.snapshot();

            // A locked bucket is either being written to or was migrated to a new table,
            // in which case reloading the root will find the new table.
            if !state.is_locked() {
                match bucket.scan(key, state) {
                    Scan::Found(bits) if bucket.validate(state) => {
                        // Safety: The value was part of a consistent snapshot of the bucket,
                        // and is protected by the guard.
                        return Some(unsafe { V::access(bits) });
                    }
                    Scan::Missing if bucket.validate(state) => return None,
                    _ => {}
                }
            }

            backoff.backoff();
        }
    }

    /// Inserts a key-value pair if the key is not already present.
    ///
    /// Returns `Ok(false)` and drops the value if the key was present.
    pub fn insert(&self, key: K, value: V, guard: &impl Guard) -> Result<bool, GrowError> {
        let hash = self.hasher.hash_one(key);
        let bits = Value::into_bits(value);
        let mut backoff = B::default();

        loop {
            let table = self.root(guard);
            let bucket = table.bucket_for(hash);

            let state = match bucket.try_lock() {
                Ok(state) => state,
                Err(_) => {
                    backoff.backoff();
                    continue;
                }
            };

            if bucket.find(&key, state).is_some() {
                bucket.unlock(state);

                // Safety: The value was never published.
                unsafe { V::release(bits) };
                return Ok(false);
            }

            if state.item_count() < INLINE_ITEMS {
                bucket.unlock(bucket.push_inline(key, bits, state));
                self.count.get(guard).fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }

            match table.extensions().allocate::<B>(hash) {
                Some(item) => {
                    // Safety: The item was just allocated and is not reachable by other threads.
                    unsafe { (*item).write(key, bits) };
                    bucket.unlock(bucket.push_extension(item, state));
                    self.count.get(guard).fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }

                // The extension pool is exhausted, grow the table and retry.
                None => {
                    bucket.unlock(state);

                    if let Err(err) = self.grow(table, guard) {
                        // Safety: The value was never published.
                        unsafe { V::release(bits) };
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Removes a key from the map, returning the raw bits of its value.
    ///
    /// The caller is responsible for retiring the value.
    fn remove_bits(&self, key: &K, guard: &impl Guard) -> Option<Bits<V::Atom>> {
        let hash = self.hasher.hash_one(key);
        let mut backoff = B::default();

        loop {
            let table = self.root(guard);
            let bucket = table.bucket_for(hash);

            let state = match bucket.try_lock() {
                Ok(state) => state,
                Err(_) => {
                    backoff.backoff();
                    continue;
                }
            };

            let Some(slot) = bucket.find(key, state) else {
                bucket.unlock(state);
                return None;
            };

            let (bits, state, unlinked) = bucket.remove(slot, state);
            if let Some(item) = unlinked {
                table.extensions().release::<B>(item);
            }
            bucket.unlock(state);

            self.count.get(guard).fetch_sub(1, Ordering::Relaxed);
            return Some(bits);
        }
    }

    /// Removes a key from the map, returning its value.
    #[inline]
    pub fn remove<'g>(&self, key: &K, guard: &'g impl Guard) -> Option<V::Accessor<'g>> {
        let bits = self.remove_bits(key, guard)?;

        // Safety: The value is unreachable from the map, and retirement is deferred
        // until the guard is dropped.
        unsafe {
            V::retire(bits, guard);
            Some(V::access(bits))
        }
    }

    /// Removes a key from the map, discarding its value.
    #[inline]
    pub fn erase(&self, key: &K, guard: &impl Guard) -> bool {
        match self.remove_bits(key, guard) {
            // Safety: The value is unreachable from the map.
            Some(bits) => {
                unsafe { V::retire(bits, guard) };
                true
            }
            None => false,
        }
    }

    /// Returns an iterator positioned at the first item of the map.
    pub fn iter<'g, G: Guard>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, B, G> {
        let mut backoff = B::default();

        loop {
            let table = self.root(guard);

            // The first bucket stays locked once a resize has migrated it, reload the
            // root table until we find an unlocked one.
            match table.bucket(0).try_lock() {
                Ok(state) => return Iter::new(self, table, state, guard),
                Err(_) => backoff.backoff(),
            }
        }
    }

    /// Returns an exhausted iterator.
    pub fn end<'g, G: Guard>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, B, G> {
        Iter::end(self, self.root(guard), guard)
    }

    /// Grows the table, unless `observed` was already replaced.
    #[cold]
    #[inline(never)]
    fn grow(&self, observed: Table<K, V>, guard: &impl Guard) -> Result<(), GrowError> {
        let _resizing = loop {
            if self.table.load(Ordering::Acquire) != observed.raw {
                return Ok(());
            }

            match self
                .resizing
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break ResizeGuard(&self.resizing),
                Err(_) => self.wait_for_resize(),
            }
        };

        // Another thread may have completed a resize before we acquired the flag.
        if self.table.load(Ordering::Acquire) != observed.raw {
            return Ok(());
        }

        trace!("growing table with {} buckets", observed.len());

        // Lock every bucket to block writers. Readers observing a locked bucket retry.
        let mut backoff = B::default();
        for i in 0..observed.len() {
            observed.bucket(i).lock(&mut backoff);
        }

        let new = match self.migrate(observed) {
            Ok(new) => new,
            Err(err) => {
                trace!("failed to grow table: {err}");

                for i in 0..observed.len() {
                    let bucket = observed.bucket(i);
                    bucket.unlock(bucket.state());
                }

                return Err(err);
            }
        };

        // Publish the new table. The old buckets stay locked, forcing any stale accesses to
        // retry against the new root.
        self.table.store(new.raw, Ordering::Release);

        trace!("published table with {} buckets", new.len());

        // Safety: The old table is unreachable from the root pointer, and its contents were
        // moved to the new table.
        unsafe { guard.defer_retire(observed.raw, Table::<K, V>::reclaim) };

        Ok(())
    }

    // Wait for an in-progress resize to complete.
    #[cold]
    fn wait_for_resize(&self) {
        const SPIN_WAIT: usize = 32;

        let mut backoff = B::default();
        for _ in 0..SPIN_WAIT {
            if self.resizing.load(Ordering::Acquire) == 0 {
                return;
            }

            backoff.backoff();
        }

        while self.resizing.load(Ordering::Acquire) == 1 {
            atomic_wait::wait(&self.resizing, 1);
        }
    }

    // Copies all items of a locked table into a new table with at least twice the buckets.
    fn migrate(&self, old: Table<K, V>) -> Result<Table<K, V>, GrowError> {
        let mut len = old.len();

        loop {
            len = len.checked_mul(2).ok_or(GrowError::CapacityOverflow)?;
            let new = Table::alloc(len, self.pool)?;

            if self.copy_items(old, new) {
                return Ok(new);
            }

            // The extension pool of the new table overflowed, try a larger table.
            trace!("extension pool exhausted while migrating to {len} buckets");

            // Safety: The new table was never published. Values are still owned by the old table.
            unsafe { Table::dealloc(new) };
        }
    }

    // Copies all items into an unpublished table, returning `false` if its extension pool
    // was exhausted.
    fn copy_items(&self, old: Table<K, V>, new: Table<K, V>) -> bool {
        for i in 0..old.len() {
            let bucket = old.bucket(i);
            let state = bucket.state();

            for slot in 0..state.item_count() {
                if !self.copy_item(new, bucket.key(slot), bucket.value(slot)) {
                    return false;
                }
            }

            let mut item = bucket.head();
            while !item.is_null() {
                // Safety: Items in the chain of a locked bucket are live.
                let current = unsafe { &*item };
                if !self.copy_item(new, current.key(), current.value()) {
                    return false;
                }

                item = current.next_relaxed();
            }
        }

        true
    }

    #[inline]
    fn copy_item(&self, table: Table<K, V>, key: K, value: Bits<V::Atom>) -> bool {
        let hash = self.hasher.hash_one(key);
        let bucket = table.bucket_for(hash);
        let state = bucket.state();

        let state = if state.item_count() < INLINE_ITEMS {
            bucket.push_inline(key, value, state)
        } else {
            let Some(item) = table.extensions().allocate::<B>(hash) else {
                return false;
            };

            // Safety: The item was just allocated from an unpublished table.
            unsafe { (*item).write(key, value) };
            bucket.push_extension(item, state)
        };

        bucket.unlock(state);
        true
    }
}

impl<K: Word, V: Value, S, B> Drop for HashMap<K, V, S, B> {
    fn drop(&mut self) {
        // Make sure all retired tables and values are reclaimed before the collector is dropped.
        //
        // Safety: We have a unique reference to the map, no guards can be active.
        unsafe { self.collector.reclaim_all() };

        // Safety: The root table is never null.
        let table = unsafe { Table::<K, V>::from_raw(*self.table.get_mut()) };

        for i in 0..table.len() {
            let bucket = table.bucket(i);
            let count = bucket.state().item_count();

            for slot in 0..count {
                // Safety: We have unique access to the values, which are dropped exactly once.
                unsafe { V::release(bucket.value(slot)) };
            }

            let mut item = bucket.head();
            while !item.is_null() {
                // Safety: Items in the chain are live until the table is deallocated.
                let current = unsafe { &*item };
                unsafe { V::release(current.value()) };
                item = current.next_relaxed();
            }
        }

        // Safety: We have unique access to the table and do not access it after this call.
        unsafe { Table::dealloc(table) };
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::RandomState;

    use super::*;
    use crate::backoff::NoBackoff;

    type Map = HashMap<u64, u64, RandomState, NoBackoff>;

    fn map(capacity: usize, pool: PoolConfig) -> Map {
        HashMap::new(capacity, RandomState::new(), Collector::new(), pool)
    }

    fn states(map: &Map, guard: &impl Guard) -> Vec<bucket::BucketState> {
        let table = map.root(guard);
        (0..table.len()).map(|i| table.bucket(i).state()).collect()
    }

    #[test]
    fn reads_do_not_write() {
        let map = map(16, PoolConfig { ratio: 128, items: 10 });
        let guard = map.guard();

        for i in 0..40 {
            assert_eq!(map.insert(i, i + 1, &guard), Ok(true));
        }

        let before = states(&map, &guard);
        for i in 0..80 {
            assert_eq!(map.get(&i, &guard), (i < 40).then_some(i + 1));
        }
        assert_eq!(states(&map, &guard), before);
    }

    #[test]
    fn grow_when_pool_is_exhausted() {
        let map = map(1, PoolConfig { ratio: 1, items: 1 });
        let guard = map.guard();

        // One bucket holds 3 inline items and 1 overflow item.
        for i in 0..4 {
            map.insert(i, i, &guard).unwrap();
        }

        assert_eq!(map.bucket_count(&guard), 1);
        map.insert(4, 4, &guard).unwrap();
        assert!(map.bucket_count(&guard) > 1);

        for i in 0..5 {
            assert_eq!(map.get(&i, &guard), Some(i));
        }
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn remove_compacts_bucket() {
        let map = map(1, PoolConfig { ratio: 1, items: 8 });
        let guard = map.guard();

        for i in 0..6 {
            map.insert(i, i * 10, &guard).unwrap();
        }
        assert_eq!(map.bucket_count(&guard), 1);

        // Removing an inline item pulls the chain head into its slot.
        assert_eq!(map.remove(&0, &guard), Some(0));
        let table = map.root(&guard);
        assert_eq!(table.bucket(0).state().item_count(), 3);
        assert_eq!(table.extensions().free_items(), 6);

        for i in 1..6 {
            assert_eq!(map.get(&i, &guard), Some(i * 10));
        }

        for i in 1..6 {
            assert!(map.erase(&i, &guard));
        }
        assert_eq!(table.bucket(0).state().item_count(), 0);
        assert_eq!(table.extensions().free_items(), 8);
        assert!(map.root(&guard).bucket(0).head().is_null());
    }

    #[test]
    fn unchanged_bucket_keeps_version() {
        let map = map(1, PoolConfig { ratio: 128, items: 10 });
        let guard = map.guard();

        map.insert(1, 1, &guard).unwrap();
        let version = map.root(&guard).bucket(0).state().version();

        assert_eq!(map.insert(1, 2, &guard), Ok(false));
        assert!(!map.erase(&2, &guard));
        assert_eq!(map.root(&guard).bucket(0).state().version(), version);

        assert!(map.erase(&1, &guard));
        assert_eq!(map.root(&guard).bucket(0).state().version(), version + 1);
    }
}
