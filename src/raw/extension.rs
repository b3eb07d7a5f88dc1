use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::backoff::Backoff;
use crate::value::{Atom, Bits, Value, Word};

/// An overflow slot, linked into the chain of a bucket or the free list of its group.
#[repr(C)]
pub struct ExtensionItem<K: Word, V: Value> {
    key: K::Atom,
    value: V::Atom,
    next: AtomicPtr<ExtensionItem<K, V>>,
}

impl<K: Word, V: Value> ExtensionItem<K, V> {
    #[inline]
    pub fn key(&self) -> K {
        K::from_bits(self.key.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn value(&self) -> Bits<V::Atom> {
        self.value.load(Ordering::Relaxed)
    }

    /// Returns the next item in the chain, synchronizing with the writer that linked it.
    #[inline]
    pub fn next(&self) -> *mut ExtensionItem<K, V> {
        self.next.load(Ordering::Acquire)
    }

    /// Returns the next item in the chain. The bucket lock must be held.
    #[inline]
    pub fn next_relaxed(&self) -> *mut ExtensionItem<K, V> {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn next_link(&self) -> *const AtomicPtr<ExtensionItem<K, V>> {
        &self.next
    }

    #[inline]
    pub fn set_next(&self, next: *mut ExtensionItem<K, V>) {
        self.next.store(next, Ordering::Release);
    }

    /// Initializes a freshly allocated item.
    #[inline]
    pub fn write(&self, key: K, value: Bits<V::Atom>) {
        self.key.store(Word::into_bits(key), Ordering::Release);
        self.value.store(value, Ordering::Release);
    }
}

/// A group of extension items shared by `extension_ratio` consecutive buckets.
///
/// Items are only allocated and released by threads holding a bucket lock, but two
/// buckets may draw from the same group, so the free list has its own lock.
#[repr(C, align(64))]
pub struct ExtensionGroup<K: Word, V: Value> {
    lock: AtomicBool,
    free: AtomicPtr<ExtensionItem<K, V>>,
}

impl<K: Word, V: Value> ExtensionGroup<K, V> {
    #[inline]
    fn lock<B: Backoff>(&self) -> GroupLock<'_, K, V> {
        let mut backoff = B::default();
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.backoff();
        }

        GroupLock(self)
    }
}

// Releases the lock of a group when dropped.
struct GroupLock<'a, K: Word, V: Value>(&'a ExtensionGroup<K, V>);

impl<K: Word, V: Value> Drop for GroupLock<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        self.0.lock.store(false, Ordering::Release);
    }
}

/// The overflow item pool of a table.
pub struct ExtensionPool<'t, K: Word, V: Value> {
    pub(super) groups: &'t [ExtensionGroup<K, V>],
    pub(super) items: *mut ExtensionItem<K, V>,
    pub(super) group_items: usize,
}

impl<K: Word, V: Value> ExtensionPool<'_, K, V> {
    /// Threads every item into the free list of its group.
    ///
    /// Must only be called on a freshly allocated, unpublished table.
    pub fn init(&self) {
        for (g, group) in self.groups.iter().enumerate() {
            let first = g * self.group_items;
            for i in first..first + self.group_items {
                let next = if i + 1 < first + self.group_items {
                    self.item(i + 1)
                } else {
                    ptr::null_mut()
                };

                // Safety: `i` is in bounds of the item array.
                unsafe { (*self.item(i)).next.store(next, Ordering::Relaxed) };
            }

            group.free.store(self.item(first), Ordering::Relaxed);
        }
    }

    /// Allocates an item, starting with the group the hash maps to and probing every other
    /// group once. Returns `None` if the pool is exhausted.
    pub fn allocate<B: Backoff>(&self, hash: u64) -> Option<*mut ExtensionItem<K, V>> {
        let start = hash as usize % self.groups.len();

        for i in 0..self.groups.len() {
            let group = &self.groups[(start + i) % self.groups.len()];

            // Skip empty groups without taking the lock.
            if group.free.load(Ordering::Relaxed).is_null() {
                continue;
            }

            let _lock = group.lock::<B>();
            let item = group.free.load(Ordering::Relaxed);
            if !item.is_null() {
                // Safety: Items in the free list are owned by the group.
                let next = unsafe { (*item).next.load(Ordering::Relaxed) };
                group.free.store(next, Ordering::Relaxed);
                return Some(item);
            }
        }

        None
    }

    /// Returns an item to the free list of its group.
    ///
    /// The item must have been allocated from this pool and must be unlinked from its bucket.
    /// Readers may still be traversing it, so its contents are left intact.
    pub fn release<B: Backoff>(&self, item: *mut ExtensionItem<K, V>) {
        // Safety: The item was allocated from this pool's item array.
        let index = unsafe { item.offset_from(self.items) } as usize;
        let group = &self.groups[index / self.group_items];

        let _lock = group.lock::<B>();
        let free = group.free.load(Ordering::Relaxed);
        // Safety: The item is unlinked, we have exclusive ownership of its link.
        unsafe { (*item).next.store(free, Ordering::Release) };
        group.free.store(item, Ordering::Relaxed);
    }

    /// Returns the number of free items in the pool. Only exact when the pool is quiescent.
    #[cfg(test)]
    pub fn free_items(&self) -> usize {
        use crate::backoff::NoBackoff;

        self.groups
            .iter()
            .map(|group| {
                let _lock = group.lock::<NoBackoff>();
                let mut count = 0;
                let mut item = group.free.load(Ordering::Relaxed);
                while !item.is_null() {
                    count += 1;
                    // Safety: Items in the free list are owned by the group.
                    item = unsafe { (*item).next.load(Ordering::Relaxed) };
                }
                count
            })
            .sum()
    }

    /// The total number of items in the pool.
    pub fn capacity(&self) -> usize {
        self.groups.len() * self.group_items
    }

    #[inline]
    fn item(&self, i: usize) -> *mut ExtensionItem<K, V> {
        debug_assert!(i < self.capacity());
        // Safety: The caller guarantees `i` is in bounds.
        unsafe { self.items.add(i) }
    }
}
