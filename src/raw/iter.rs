use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use seize::Guard;

use super::alloc::Table;
use super::bucket::{Bucket, BucketState, Slot};
use super::HashMap;
use crate::backoff::Backoff;
use crate::value::{Value, Word};

/// A cursor over the items of a map.
///
/// While positioned on an item, the cursor holds the lock of the item's bucket. Buckets are
/// visited in ascending order, locking the next bucket before releasing the current one.
pub struct Iter<'g, K: Word, V: Value, S, B, G> {
    map: &'g HashMap<K, V, S, B>,
    guard: &'g G,
    table: Table<K, V>,
    // The index of the locked bucket, or the table length once exhausted.
    index: usize,
    // The unlocked state of the held bucket, including any removals made through the cursor.
    state: BucketState,
    slot: Slot<K, V>,
    _b: PhantomData<fn() -> B>,
}

impl<'g, K, V, S, B, G> Iter<'g, K, V, S, B, G>
where
    K: Word,
    V: Value,
    B: Backoff,
    G: Guard,
{
    // Creates a cursor holding the lock of the first bucket.
    pub(super) fn new(
        map: &'g HashMap<K, V, S, B>,
        table: Table<K, V>,
        state: BucketState,
        guard: &'g G,
    ) -> Iter<'g, K, V, S, B, G> {
        let mut iter = Iter {
            map,
            guard,
            table,
            index: 0,
            state,
            slot: Slot::Inline(0),
            _b: PhantomData,
        };

        iter.settle();
        iter
    }

    // Creates an exhausted cursor.
    pub(super) fn end(
        map: &'g HashMap<K, V, S, B>,
        table: Table<K, V>,
        guard: &'g G,
    ) -> Iter<'g, K, V, S, B, G> {
        Iter {
            map,
            guard,
            table,
            index: table.len(),
            state: table.bucket(0).state(),
            slot: Slot::Inline(0),
            _b: PhantomData,
        }
    }

    /// Returns `true` if the cursor moved past the last item.
    #[inline]
    pub fn is_end(&self) -> bool {
        self.index == self.table.len()
    }

    /// Returns the item under the cursor.
    #[inline]
    pub fn get(&self) -> Option<(K, V::Accessor<'g>)> {
        if self.is_end() {
            return None;
        }

        let bucket = self.bucket();
        let (key, value) = match self.slot {
            Slot::Inline(i) => (bucket.key(i), bucket.value(i)),
            // Safety: The cursor only rests on live items of the locked bucket.
            Slot::Extension { item, .. } => unsafe { ((*item).key(), (*item).value()) },
        };

        // Safety: The bucket is locked, and the value is protected by the guard once it
        // is removed.
        Some((key, unsafe { V::access(value) }))
    }

    /// Moves the cursor to the next item.
    pub fn advance(&mut self) {
        if self.is_end() {
            return;
        }

        self.slot = match self.slot {
            Slot::Inline(i) => Slot::Inline(i + 1),
            Slot::Extension { item, .. } => {
                // Safety: The cursor only rests on live items of the locked bucket.
                let item = unsafe { &*item };
                Slot::Extension {
                    prev: item.next_link(),
                    item: item.next_relaxed(),
                }
            }
        };

        self.settle();
    }

    /// Removes the item under the cursor, moving the cursor to the following item.
    ///
    /// Returns `false` if the cursor is exhausted.
    pub fn erase(&mut self) -> bool {
        if self.is_end() {
            return false;
        }

        let bucket = self.bucket();
        let (value, state, unlinked) = bucket.remove(self.slot, self.state);

        // An inline slot is refilled with an item that was not yet visited, either the head
        // of the chain or the last inline item. An erased chain item is replaced by its
        // successor.
        if let Slot::Extension { prev, .. } = self.slot {
            self.slot = Slot::Extension {
                prev,
                // Safety: `prev` is the head link or the link of a live item.
                item: unsafe { (*prev).load(Ordering::Relaxed) },
            };
        }

        if let Some(item) = unlinked {
            self.table.extensions().release::<B>(item);
        }

        self.state = state;
        self.map.count.get(self.guard).fetch_sub(1, Ordering::Relaxed);

        // Safety: The value is unreachable from the map.
        unsafe { V::retire(value, self.guard) };

        self.settle();
        true
    }

    #[inline]
    fn bucket(&self) -> &Bucket<K, V> {
        self.table.bucket(self.index)
    }

    // Moves forward until the cursor rests on an item, or is exhausted.
    fn settle(&mut self) {
        loop {
            match self.slot {
                Slot::Inline(i) if i < self.state.item_count() => return,
                Slot::Inline(_) => {
                    let bucket = self.bucket();
                    self.slot = Slot::Extension {
                        prev: bucket.head_link(),
                        item: bucket.head(),
                    };
                }
                Slot::Extension { item, .. } if !item.is_null() => return,
                Slot::Extension { .. } => {
                    if !self.next_bucket() {
                        return;
                    }
                }
            }
        }
    }

    // Moves to the start of the next bucket, returning `false` if there are no more buckets.
    fn next_bucket(&mut self) -> bool {
        let current = self.bucket();

        if self.index + 1 == self.table.len() {
            current.unlock(self.state);
            self.index = self.table.len();
            return false;
        }

        // Lock the next bucket before releasing the current one. A resize locks buckets in
        // the same order, so it can never have migrated a bucket ahead of us.
        let mut backoff = B::default();
        let state = self.table.bucket(self.index + 1).lock(&mut backoff);
        current.unlock(self.state);

        self.index += 1;
        self.state = state;
        self.slot = Slot::Inline(0);
        true
    }
}

impl<'g, K, V, S, B, G> Iterator for Iter<'g, K, V, S, B, G>
where
    K: Word,
    V: Value,
    B: Backoff,
    G: Guard,
{
    type Item = (K, V::Accessor<'g>);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let item = self.get()?;
        self.advance();
        Some(item)
    }
}

impl<K: Word, V: Value, S, B, G> PartialEq for Iter<'_, K, V, S, B, G> {
    fn eq(&self, other: &Self) -> bool {
        let end = self.index == self.table.len();
        let other_end = other.index == other.table.len();

        if end || other_end {
            return end == other_end;
        }

        let same_slot = match (self.slot, other.slot) {
            (Slot::Inline(a), Slot::Inline(b)) => a == b,
            (Slot::Extension { item: a, .. }, Slot::Extension { item: b, .. }) => a == b,
            _ => false,
        };

        self.table.raw == other.table.raw && self.index == other.index && same_slot
    }
}

impl<K: Word, V: Value, S, B, G> Drop for Iter<'_, K, V, S, B, G> {
    fn drop(&mut self) {
        if self.index != self.table.len() {
            self.table.bucket(self.index).unlock(self.state);
        }
    }
}
