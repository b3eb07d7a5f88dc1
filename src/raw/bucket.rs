use std::fmt;
use std::sync::atomic::{self, AtomicPtr, AtomicU64, Ordering};

use super::extension::ExtensionItem;
use crate::backoff::Backoff;
use crate::value::{Atom, Bits, Value, Word};

/// The number of items stored inline in every bucket.
pub const INLINE_ITEMS: usize = 3;

/// The packed state word of a bucket.
///
/// ```text
/// | version (59 bits) | delete marker (2 bits) | item count (2 bits) | lock (1 bit) |
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BucketState(u64);

impl BucketState {
    /// The bucket is locked for a structural mutation.
    const LOCK: u64 = 0b1;

    const COUNT_SHIFT: u32 = 1;
    const COUNT_MASK: u64 = 0b11 << BucketState::COUNT_SHIFT;

    /// The inline slot (plus one) being refilled by an in-progress removal. This is bookkeeping
    /// only: it is published while the lock is held and cleared on unlock, and readers never
    /// consult it since a locked or re-versioned state already forces a retry.
    const DELETE_SHIFT: u32 = 3;
    const DELETE_MASK: u64 = 0b11 << BucketState::DELETE_SHIFT;

    const VERSION_SHIFT: u32 = 5;
    const VERSION_INC: u64 = 1 << BucketState::VERSION_SHIFT;

    #[inline]
    pub fn is_locked(self) -> bool {
        self.0 & BucketState::LOCK != 0
    }

    #[inline]
    pub fn locked(self) -> BucketState {
        BucketState(self.0 | BucketState::LOCK)
    }

    #[inline]
    pub fn unlocked(self) -> BucketState {
        BucketState(self.0 & !BucketState::LOCK)
    }

    /// The number of occupied inline slots.
    #[inline]
    pub fn item_count(self) -> usize {
        ((self.0 & BucketState::COUNT_MASK) >> BucketState::COUNT_SHIFT) as usize
    }

    #[inline]
    pub fn with_item_count(self, count: usize) -> BucketState {
        debug_assert!(count <= INLINE_ITEMS);
        BucketState(
            (self.0 & !BucketState::COUNT_MASK) | ((count as u64) << BucketState::COUNT_SHIFT),
        )
    }

    /// Returns the inline slot currently being refilled, if any.
    #[inline]
    pub fn delete_marker(self) -> Option<usize> {
        match (self.0 & BucketState::DELETE_MASK) >> BucketState::DELETE_SHIFT {
            0 => None,
            marker => Some(marker as usize - 1),
        }
    }

    #[inline]
    pub fn with_delete_marker(self, slot: usize) -> BucketState {
        debug_assert!(slot < INLINE_ITEMS);
        BucketState(
            (self.0 & !BucketState::DELETE_MASK) | (((slot + 1) as u64) << BucketState::DELETE_SHIFT),
        )
    }

    #[inline]
    pub fn clear_delete_marker(self) -> BucketState {
        BucketState(self.0 & !BucketState::DELETE_MASK)
    }

    #[inline]
    pub fn version(self) -> u64 {
        self.0 >> BucketState::VERSION_SHIFT
    }

    /// Returns the state with the version incremented, marking a completed mutation.
    #[inline]
    pub fn next_version(self) -> BucketState {
        BucketState(self.0.wrapping_add(BucketState::VERSION_INC))
    }
}

impl fmt::Debug for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketState")
            .field("locked", &self.is_locked())
            .field("item_count", &self.item_count())
            .field("delete_marker", &self.delete_marker())
            .field("version", &self.version())
            .finish()
    }
}

/// A cache-line aligned bucket.
///
/// Keys and values are stored in separate arrays so that a lookup only touches the key
/// slots until it finds a match. Any item in the overflow chain implies that all inline slots
/// are occupied.
#[repr(C, align(64))]
pub struct Bucket<K: Word, V: Value> {
    state: AtomicU64,
    keys: [K::Atom; INLINE_ITEMS],
    values: [V::Atom; INLINE_ITEMS],
    head: AtomicPtr<ExtensionItem<K, V>>,
}

/// The position of an item within a locked bucket.
pub enum Slot<K: Word, V: Value> {
    /// An inline slot.
    Inline(usize),

    /// An item in the overflow chain, and the link pointing to it.
    Extension {
        prev: *const AtomicPtr<ExtensionItem<K, V>>,
        item: *mut ExtensionItem<K, V>,
    },
}

impl<K: Word, V: Value> Clone for Slot<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Word, V: Value> Copy for Slot<K, V> {}

/// The result of an unlocked scan.
pub enum Scan<B> {
    /// The key was found with the given value.
    Found(B),

    /// The key is not in the bucket.
    Missing,

    /// The bucket changed during the scan.
    Retry,
}

impl<K: Word, V: Value> Bucket<K, V> {
    /// Loads the current state, for the start of an optimistic read.
    #[inline]
    pub fn snapshot(&self) -> BucketState {
        BucketState(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if the bucket was not modified since `snapshot` was taken.
    ///
    /// Any relaxed loads of bucket contents performed before this call are ordered before
    /// the state is re-read.
    #[inline]
    pub fn validate(&self, snapshot: BucketState) -> bool {
        atomic::fence(Ordering::Acquire);
        BucketState(self.state.load(Ordering::Relaxed)) == snapshot
    }

    /// Attempts to acquire the bucket lock, returning the unlocked state on success.
    #[inline]
    pub fn try_lock(&self) -> Result<BucketState, BucketState> {
        let state = BucketState(self.state.load(Ordering::Relaxed));
        if state.is_locked() {
            return Err(state);
        }

        match self.state.compare_exchange(
            state.0,
            state.locked().0,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(state),
            Err(found) => Err(BucketState(found)),
        }
    }

    /// Acquires the bucket lock, waiting with the given backoff strategy.
    #[inline]
    pub fn lock(&self, backoff: &mut impl Backoff) -> BucketState {
        loop {
            match self.try_lock() {
                Ok(state) => return state,
                Err(_) => backoff.backoff(),
            }
        }
    }

    /// Releases the lock, publishing `state`.
    ///
    /// `state` must be derived from the state returned by `lock`, with the version incremented
    /// if the content of the bucket changed.
    #[inline]
    pub fn unlock(&self, state: BucketState) {
        let state = state.unlocked().clear_delete_marker();
        self.state.store(state.0, Ordering::Release);
    }

    /// Publishes an intermediate state while keeping the lock held.
    #[inline]
    fn publish_locked(&self, state: BucketState) {
        self.state.store(state.locked().0, Ordering::Relaxed);
    }

    /// Returns the key at the inline slot.
    #[inline]
    pub fn key(&self, slot: usize) -> K {
        K::from_bits(self.keys[slot].load(Ordering::Relaxed))
    }

    /// Returns the raw bits of the value at the inline slot.
    #[inline]
    pub fn value(&self, slot: usize) -> Bits<V::Atom> {
        self.values[slot].load(Ordering::Relaxed)
    }

    /// Returns the head of the overflow chain.
    #[inline]
    pub fn head(&self) -> *mut ExtensionItem<K, V> {
        self.head.load(Ordering::Acquire)
    }

    /// Returns the link to the head of the overflow chain.
    #[inline]
    pub fn head_link(&self) -> *const AtomicPtr<ExtensionItem<K, V>> {
        &self.head
    }

    /// Scans the bucket for a key without taking the lock.
    ///
    /// `snapshot` must be an unlocked state loaded with [`Bucket::snapshot`]. A `Found` or
    /// `Missing` result must still be confirmed with [`Bucket::validate`].
    #[inline]
    pub fn scan(&self, key: &K, snapshot: BucketState) -> Scan<Bits<V::Atom>>
    where
        K: Eq,
    {
        for i in 0..snapshot.item_count() {
            if self.key(i) == *key {
                return Scan::Found(self.value(i));
            }
        }

        let mut item = self.head();
        while !item.is_null() {
            // Safety: Extension items live as long as the table, which is protected
            // by the caller's guard.
            let current = unsafe { &*item };

            if current.key() == *key {
                return Scan::Found(current.value());
            }

            item = current.next();

            // The item may have been unlinked and reused by another bucket,
            // don't follow a chain that is no longer ours.
            if !self.validate(snapshot) {
                return Scan::Retry;
            }
        }

        Scan::Missing
    }

    /// Finds the slot holding a key. The lock must be held.
    #[inline]
    pub fn find(&self, key: &K, state: BucketState) -> Option<Slot<K, V>>
    where
        K: Eq,
    {
        for i in 0..state.item_count() {
            if self.key(i) == *key {
                return Some(Slot::Inline(i));
            }
        }

        let mut prev = self.head_link();
        loop {
            // Safety: `prev` is either the bucket head or the `next` link of a live item.
            let item = unsafe { (*prev).load(Ordering::Relaxed) };
            if item.is_null() {
                return None;
            }

            // Safety: Items in the chain of a locked bucket are live.
            let current = unsafe { &*item };
            if current.key() == *key {
                return Some(Slot::Extension { prev, item });
            }

            prev = current.next_link();
        }
    }

    /// Writes an item to the next free inline slot. The lock must be held, and the bucket must
    /// have a free inline slot.
    #[inline]
    pub fn push_inline(&self, key: K, value: Bits<V::Atom>, state: BucketState) -> BucketState {
        let count = state.item_count();
        debug_assert!(count < INLINE_ITEMS);

        self.keys[count].store(Word::into_bits(key), Ordering::Release);
        self.values[count].store(value, Ordering::Release);

        state.with_item_count(count + 1).next_version()
    }

    /// Links an initialized extension item at the head of the overflow chain. The lock must
    /// be held.
    #[inline]
    pub fn push_extension(&self, item: *mut ExtensionItem<K, V>, state: BucketState) -> BucketState {
        let head = self.head.load(Ordering::Relaxed);

        // Safety: The item was just allocated from the pool and is not yet reachable.
        unsafe { (*item).set_next(head) };
        self.head.store(item, Ordering::Release);

        state.next_version()
    }

    /// Removes the item at `slot`, returning the removed value and any extension item
    /// that was unlinked and must be returned to the pool. The lock must be held.
    ///
    /// If an inline item is removed while the overflow chain is non-empty, the head of the
    /// chain is moved into the freed slot.
    pub fn remove(
        &self,
        slot: Slot<K, V>,
        state: BucketState,
    ) -> (Bits<V::Atom>, BucketState, Option<*mut ExtensionItem<K, V>>) {
        match slot {
            Slot::Inline(i) => {
                let value = self.value(i);
                let count = state.item_count();
                let head = self.head.load(Ordering::Relaxed);

                // Record which slot is being refilled, unless the last item is simply dropped.
                if !head.is_null() || i != count - 1 {
                    self.publish_locked(state.with_delete_marker(i));
                }

                if !head.is_null() {
                    // Safety: The head of a locked bucket's chain is live.
                    let head = unsafe { &*head };
                    self.keys[i].store(Word::into_bits(head.key()), Ordering::Release);
                    self.values[i].store(head.value(), Ordering::Release);
                    self.head.store(head.next_relaxed(), Ordering::Release);

                    let unlinked = head as *const ExtensionItem<K, V> as *mut _;
                    return (value, state.next_version(), Some(unlinked));
                }

                if i != count - 1 {
                    let last_key = self.keys[count - 1].load(Ordering::Relaxed);
                    let last_value = self.values[count - 1].load(Ordering::Relaxed);
                    self.keys[i].store(last_key, Ordering::Release);
                    self.values[i].store(last_value, Ordering::Release);
                }

                (value, state.with_item_count(count - 1).next_version(), None)
            }

            Slot::Extension { prev, item } => {
                // Safety: `item` is live and linked from `prev` while the lock is held.
                let value = unsafe { (*item).value() };
                let next = unsafe { (*item).next_relaxed() };
                unsafe { (*prev).store(next, Ordering::Release) };

                (value, state.next_version(), Some(item))
            }
        }
    }

    /// Returns the current state without synchronizing with its writer.
    #[inline]
    pub fn state(&self) -> BucketState {
        BucketState(self.state.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_fields() {
        let state = BucketState(0);
        assert!(!state.is_locked());
        assert_eq!(state.item_count(), 0);
        assert_eq!(state.delete_marker(), None);
        assert_eq!(state.version(), 0);

        let state = state.locked().with_item_count(3).with_delete_marker(2);
        assert!(state.is_locked());
        assert_eq!(state.item_count(), 3);
        assert_eq!(state.delete_marker(), Some(2));

        let state = state.next_version();
        assert_eq!(state.version(), 1);
        assert_eq!(state.item_count(), 3);

        let state = state.unlocked().clear_delete_marker();
        assert!(!state.is_locked());
        assert_eq!(state.delete_marker(), None);
        assert_eq!(state.item_count(), 3);
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn version_wraps() {
        let state = BucketState(u64::MAX & !BucketState::LOCK).with_item_count(2);
        let next = state.next_version();
        assert_eq!(next.version(), 0);
        assert_eq!(next.item_count(), 2);
        assert!(!next.is_locked());
    }

    #[test]
    fn delete_marker_is_cleared_on_unlock() {
        use crate::backoff::NoBackoff;
        use crate::raw::alloc::{PoolConfig, Table};

        let table: Table<u64, u64> = Table::alloc(1, PoolConfig { ratio: 1, items: 2 }).unwrap();
        let bucket = table.bucket(0);

        let mut state = bucket.lock(&mut NoBackoff);
        for i in 0..3 {
            state = bucket.push_inline(i, i * 10, state);
        }
        bucket.unlock(state);

        // Removing the first item refills its slot with the last one.
        let state = bucket.lock(&mut NoBackoff);
        let (value, state, unlinked) = bucket.remove(Slot::Inline(0), state);
        assert_eq!(value, 0);
        assert!(unlinked.is_none());

        let published = bucket.state();
        assert!(published.is_locked());
        assert_eq!(published.delete_marker(), Some(0));
        assert_eq!(bucket.key(0), 2);

        bucket.unlock(state);
        assert!(!bucket.state().is_locked());
        assert_eq!(bucket.state().delete_marker(), None);
        assert_eq!(bucket.state().item_count(), 2);

        // Removing the last item needs no marker.
        let state = bucket.lock(&mut NoBackoff);
        let (value, state, _) = bucket.remove(Slot::Inline(1), state);
        assert_eq!(value, 10);
        assert_eq!(bucket.state().delete_marker(), None);
        bucket.unlock(state);
        assert_eq!(bucket.state().item_count(), 1);

        unsafe { Table::dealloc(table) }
    }

    #[test]
    fn bucket_is_a_cache_line() {
        assert_eq!(std::mem::size_of::<Bucket<u64, u64>>(), 64);
        assert_eq!(std::mem::align_of::<Bucket<u32, u32>>(), 64);
    }
}
