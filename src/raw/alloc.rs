use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::slice;

use seize::Collector;

use super::bucket::Bucket;
use super::extension::{ExtensionGroup, ExtensionItem, ExtensionPool};
use crate::map::GrowError;
use crate::value::{Value, Word};

// A table generation laid out in a single allocation.
#[repr(transparent)]
pub struct RawTable(u8);

// The header of a table allocation, followed by the bucket array, the extension groups,
// and the extension items.
#[repr(C)]
struct TableLayout {
    mask: usize,
    groups: usize,
    group_items: usize,
    groups_offset: usize,
    items_offset: usize,
    buckets_offset: usize,
    layout: Layout,
}

/// The sizing of the extension pool relative to the bucket array.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// The number of buckets sharing an extension group.
    pub ratio: usize,

    /// The number of items in every extension group.
    pub items: usize,
}

impl PoolConfig {
    // The number of extension groups for a table of the given length.
    fn groups(&self, len: usize) -> usize {
        (len / self.ratio).max(1)
    }
}

// Manages a table allocation.
pub struct Table<K: Word, V: Value> {
    // Mask for the table length.
    pub mask: usize,
    // The raw table pointer.
    pub raw: *mut RawTable,
    buckets: *mut Bucket<K, V>,
    groups: *mut ExtensionGroup<K, V>,
    items: *mut ExtensionItem<K, V>,
    group_count: usize,
    group_items: usize,
    _kv: PhantomData<(K, V)>,
}

impl<K: Word, V: Value> Copy for Table<K, V> {}

impl<K: Word, V: Value> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Word, V: Value> Table<K, V> {
    /// Allocate a table with the provided length.
    ///
    /// All buckets are empty and unlocked, and every extension item is on the free list of
    /// its group.
    pub fn alloc(len: usize, pool: PoolConfig) -> Result<Table<K, V>, GrowError> {
        assert!(len.is_power_of_two());

        let groups = pool.groups(len);
        let (layout, buckets_offset, groups_offset, items_offset) =
            Self::layout(len, groups, pool.items).ok_or(GrowError::CapacityOverflow)?;

        unsafe {
            // Allocate the table. All-zero is a valid state for buckets and groups.
            let ptr = alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(GrowError::AllocFailed { layout });
            }

            ptr.cast::<TableLayout>().write(TableLayout {
                mask: len - 1,
                groups,
                group_items: pool.items,
                groups_offset,
                items_offset,
                buckets_offset,
                layout,
            });

            let table = Table::from_raw(ptr.cast::<RawTable>());
            table.extensions().init();
            Ok(table)
        }
    }

    // Creates a `Table` from a raw pointer.
    #[inline]
    pub unsafe fn from_raw(raw: *mut RawTable) -> Table<K, V> {
        debug_assert!(!raw.is_null());

        let layout = unsafe { &*raw.cast::<TableLayout>() };
        let base = raw.cast::<u8>();

        unsafe {
            Table {
                raw,
                mask: layout.mask,
                buckets: base.add(layout.buckets_offset).cast(),
                groups: base.add(layout.groups_offset).cast(),
                items: base.add(layout.items_offset).cast(),
                group_count: layout.groups,
                group_items: layout.group_items,
                _kv: PhantomData,
            }
        }
    }

    /// Returns the bucket at the given index.
    #[inline]
    pub fn bucket(&self, i: usize) -> &Bucket<K, V> {
        assert!(i <= self.mask);
        // Safety: `i` is in bounds of the bucket array, which lives as long as the table.
        unsafe { &*self.buckets.add(i) }
    }

    /// Returns the bucket a hash maps to.
    #[inline]
    pub fn bucket_for(&self, hash: u64) -> &Bucket<K, V> {
        self.bucket(hash as usize & self.mask)
    }

    /// Returns the extension pool of this table.
    #[inline]
    pub fn extensions(&self) -> ExtensionPool<'_, K, V> {
        ExtensionPool {
            // Safety: The groups were initialized at allocation.
            groups: unsafe { slice::from_raw_parts(self.groups, self.group_count) },
            items: self.items,
            group_items: self.group_items,
        }
    }

    /// Returns the length of the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.mask + 1
    }

    // Deallocate the table.
    //
    // Any managed values still stored in the table are not released.
    pub unsafe fn dealloc(table: Table<K, V>) {
        let layout = unsafe { (*table.raw.cast::<TableLayout>()).layout };
        unsafe { alloc::dealloc(table.raw.cast::<u8>(), layout) }
    }

    // Reclaims a table that was retired after its contents were migrated.
    pub unsafe fn reclaim(raw: *mut RawTable, _collector: &Collector) {
        unsafe { Table::<K, V>::dealloc(Table::from_raw(raw)) }
    }

    // The layout used for allocation, along with the offsets of the buckets, groups, and items.
    fn layout(len: usize, groups: usize, group_items: usize) -> Option<(Layout, usize, usize, usize)> {
        let header = Layout::new::<TableLayout>();
        let (layout, buckets) = header.extend(Layout::array::<Bucket<K, V>>(len).ok()?).ok()?;
        let (layout, groups_offset) = layout
            .extend(Layout::array::<ExtensionGroup<K, V>>(groups).ok()?)
            .ok()?;
        let (layout, items) = layout
            .extend(Layout::array::<ExtensionItem<K, V>>(groups.checked_mul(group_items)?).ok()?)
            .ok()?;

        Some((layout.pad_to_align(), buckets, groups_offset, items))
    }
}
