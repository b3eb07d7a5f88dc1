use crate::backoff::{Backoff, NoBackoff};
use crate::raw::{self, Iter, PoolConfig};
use crate::value::{Value, Word};

use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use std::alloc::Layout;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

/// A concurrent hash table with lock-free reads.
///
/// Lookups never write to shared memory: they scan a bucket optimistically and validate the
/// scan against the bucket's version. Insertions and removals lock a single bucket.
///
/// Most hash table operations require a [`Guard`](crate::Guard), which can be acquired through
/// [`HashMap::guard`] or using the [`HashMap::pin`] API. See the [crate-level
/// documentation](crate) for more details.
pub struct HashMap<K: Word, V: Value, S = RandomState, B = NoBackoff> {
    raw: raw::HashMap<K, V, S, B>,
}

/// The error returned when the table could not be grown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrowError {
    /// The requested table size overflows `usize`.
    CapacityOverflow,

    /// The allocator failed to allocate the new table.
    AllocFailed {
        /// The layout of the allocation request that failed.
        layout: Layout,
    },
}

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowError::CapacityOverflow => f.write_str("capacity overflow"),
            GrowError::AllocFailed { layout } => {
                write!(f, "memory allocation of {} bytes failed", layout.size())
            }
        }
    }
}

impl std::error::Error for GrowError {}

// The initial number of buckets.
const DEFAULT_CAPACITY: usize = 128;

// The number of buckets sharing a group of extension items.
const DEFAULT_EXTENSION_RATIO: usize = 128;

// The number of items in a group of extension items.
const DEFAULT_EXTENSION_ITEMS: usize = 10;

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```rust
/// use seqmap::{ExponentialBackoff, HashMap};
/// use std::collections::hash_map::RandomState;
///
/// let map: HashMap<u64, u64, _, _> = HashMap::builder()
///     // Set the initial number of buckets.
///     .capacity(2048)
///     // Set the hasher.
///     .hasher(RandomState::new())
///     // Back off exponentially when a bucket is contended.
///     .backoff::<ExponentialBackoff>()
///     // Share a group of 8 overflow items between every 64 buckets.
///     .extension_ratio(64)
///     .extension_items(8)
///     // Construct the hash map.
///     .build();
///
/// assert_eq!(map.bucket_count(&map.guard()), 2048);
/// ```
pub struct HashMapBuilder<K, V, S = RandomState, B = NoBackoff> {
    hasher: S,
    capacity: usize,
    collector: Collector,
    extension_ratio: usize,
    extension_items: usize,
    _kv: PhantomData<(K, V, fn() -> B)>,
}

impl<K, V, B> HashMapBuilder<K, V, RandomState, B> {
    /// Set the hash builder used to hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to allow HashMaps
    /// to be resistant to attacks that cause many collisions and very poor performance.
    /// Setting it manually using this function can expose a DoS attack vector.
    ///
    /// The `hash_builder` passed should implement the [`BuildHasher`] trait for the HashMap to be
    /// useful, see its documentation for details.
    pub fn hasher<S>(self, hasher: S) -> HashMapBuilder<K, V, S, B> {
        HashMapBuilder {
            hasher,
            capacity: self.capacity,
            collector: self.collector,
            extension_ratio: self.extension_ratio,
            extension_items: self.extension_items,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S, B> HashMapBuilder<K, V, S, B> {
    /// Set the backoff strategy used when a bucket lock or an in-progress resize is contended.
    pub fn backoff<B2: Backoff>(self) -> HashMapBuilder<K, V, S, B2> {
        HashMapBuilder {
            hasher: self.hasher,
            capacity: self.capacity,
            collector: self.collector,
            extension_ratio: self.extension_ratio,
            extension_items: self.extension_items,
            _kv: PhantomData,
        }
    }

    /// Set the initial number of buckets, rounded up to the next power of two.
    pub fn capacity(self, capacity: usize) -> Self {
        HashMapBuilder { capacity, ..self }
    }

    /// Set the [`seize::Collector`] used for garbage collection.
    ///
    /// This method may be useful when you want more control over garbage collection.
    ///
    /// Note that all `Guard` references used to access the map must be produced by
    /// the provided `collector`.
    pub fn collector(self, collector: Collector) -> Self {
        HashMapBuilder { collector, ..self }
    }

    /// Set the number of buckets sharing a group of overflow items.
    ///
    /// The table grows once every overflow item is in use, so a smaller ratio delays growth for
    /// maps with many colliding keys.
    pub fn extension_ratio(self, extension_ratio: usize) -> Self {
        HashMapBuilder {
            extension_ratio,
            ..self
        }
    }

    /// Set the number of overflow items in each group.
    pub fn extension_items(self, extension_items: usize) -> Self {
        HashMapBuilder {
            extension_items,
            ..self
        }
    }

    /// Construct a [`HashMap`] from the builder, using the configured options.
    ///
    /// # Panics
    ///
    /// Panics if the extension ratio or the number of extension items is zero.
    pub fn build(self) -> HashMap<K, V, S, B>
    where
        K: Word,
        V: Value,
    {
        let pool = PoolConfig {
            ratio: self.extension_ratio,
            items: self.extension_items,
        };

        HashMap {
            raw: raw::HashMap::new(self.capacity, self.hasher, self.collector, pool),
        }
    }
}

impl<K, V, S, B> fmt::Debug for HashMapBuilder<K, V, S, B>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMapBuilder")
            .field("capacity", &self.capacity)
            .field("collector", &self.collector)
            .field("extension_ratio", &self.extension_ratio)
            .field("extension_items", &self.extension_items)
            .field("hasher", &self.hasher)
            .finish()
    }
}

impl<K: Word, V: Value> HashMap<K, V> {
    /// Creates an empty `HashMap`.
    ///
    /// The hash map is initially created with 128 buckets.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    /// let map: HashMap<u64, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(DEFAULT_CAPACITY, RandomState::new())
    }

    /// Creates an empty `HashMap` with the specified number of buckets.
    ///
    /// The bucket count is rounded up to the next power of two. Every bucket holds three items
    /// inline, and the table only grows once the shared overflow items are exhausted.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    /// let map: HashMap<u64, i32> = HashMap::with_capacity(10);
    /// assert_eq!(map.bucket_count(&map.guard()), 16);
    /// ```
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Returns a builder for a `HashMap`.
    ///
    /// The builder can be used for more complex configuration, such as using
    /// a custom [`Collector`], or a [`Backoff`] strategy.
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder {
            capacity: DEFAULT_CAPACITY,
            hasher: RandomState::default(),
            collector: Collector::new(),
            extension_ratio: DEFAULT_EXTENSION_RATIO,
            extension_items: DEFAULT_EXTENSION_ITEMS,
            _kv: PhantomData,
        }
    }
}

impl<K: Word, V: Value, S: Default> Default for HashMap<K, V, S> {
    fn default() -> Self {
        HashMap::with_hasher(S::default())
    }
}

impl<K: Word, V: Value, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` which will use the given hash builder to hash
    /// keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to
    /// allow HashMaps to be resistant to attacks that cause many collisions and
    /// very poor performance. Setting it manually using this function can expose
    /// a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = HashMap::with_hasher(s);
    /// map.pin().emplace(1, 2);
    /// ```
    pub fn with_hasher(hash_builder: S) -> HashMap<K, V, S> {
        HashMap::with_capacity_and_hasher(DEFAULT_CAPACITY, hash_builder)
    }

    /// Creates an empty `HashMap` with the specified number of buckets, using `hash_builder`
    /// to hash the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = HashMap::with_capacity_and_hasher(10, s);
    /// map.pin().emplace(1, 2);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> HashMap<K, V, S> {
        let pool = PoolConfig {
            ratio: DEFAULT_EXTENSION_RATIO,
            items: DEFAULT_EXTENSION_ITEMS,
        };

        HashMap {
            raw: raw::HashMap::new(capacity, hash_builder, Collector::new(), pool),
        }
    }
}

impl<K: Word, V: Value, S, B> HashMap<K, V, S, B> {
    /// Returns a pinned reference to the map.
    ///
    /// The returned reference manages a guard internally, preventing garbage collection
    /// for as long as it is held. See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn pin(&self) -> HashMapRef<'_, K, V, S, B, LocalGuard<'_>> {
        HashMapRef {
            guard: self.raw.guard(),
            map: self,
        }
    }

    /// Returns a pinned reference to the map.
    ///
    /// Unlike [`HashMap::pin`], the returned reference implements `Send` and `Sync`,
    /// allowing it to be held across `.await` points in work-stealing schedulers.
    /// This is especially useful for iterators.
    ///
    /// The returned reference manages a guard internally, preventing garbage collection
    /// for as long as it is held. See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn pin_owned(&self) -> HashMapRef<'_, K, V, S, B, OwnedGuard<'_>> {
        HashMapRef {
            guard: self.raw.owned_guard(),
            map: self,
        }
    }

    /// Returns a guard for use with this map.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    /// See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.guard()
    }

    /// Returns an owned guard for use with this map.
    ///
    /// Owned guards implement `Send` and `Sync`, allowing them to be held across
    /// `.await` points in work-stealing schedulers. This is especially useful
    /// for iterators.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    /// See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.owned_guard()
    }

    /// Returns the number of entries in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().emplace(1, 1);
    /// map.pin().emplace(2, 2);
    /// assert!(map.len() == 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert!(map.is_empty());
    /// map.pin().emplace(1u64, 1u64);
    /// assert!(!map.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current table.
    #[inline]
    pub fn bucket_count(&self, guard: &impl Guard) -> usize {
        self.raw.verify(guard);
        self.raw.bucket_count(guard)
    }
}

impl<K, V, S, B> HashMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// Lookups never acquire a lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().emplace(1, 'a');
    /// assert_eq!(map.pin().contains(&1), true);
    /// assert_eq!(map.pin().contains(&2), false);
    /// ```
    #[inline]
    pub fn contains(&self, key: &K, guard: &impl Guard) -> bool {
        self.try_get_value(key, guard).is_some()
    }

    /// Returns the value corresponding to the key.
    ///
    /// Word values are copied out of the map. Managed values are returned by reference, and stay
    /// valid for as long as the guard even if they are concurrently removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().emplace(1, 'a');
    /// assert_eq!(map.pin().try_get_value(&1), Some('a'));
    /// assert_eq!(map.pin().try_get_value(&2), None);
    /// ```
    #[inline]
    pub fn try_get_value<'g>(&self, key: &K, guard: &'g impl Guard) -> Option<V::Accessor<'g>> {
        self.raw.verify(guard);
        self.raw.get(key, guard)
    }

    /// Inserts a key-value pair into the map, unless the key is already present.
    ///
    /// Returns `true` if the pair was inserted. If the key was already present, the map is
    /// not modified and `value` is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the table needs to grow and the new table cannot be allocated.
    /// See [`HashMap::try_emplace`] for a fallible version.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().emplace(37, 1), true);
    /// assert_eq!(map.pin().emplace(37, 2), false);
    /// assert_eq!(map.pin().try_get_value(&37), Some(1));
    /// ```
    #[inline]
    pub fn emplace(&self, key: K, value: V, guard: &impl Guard) -> bool {
        match self.try_emplace(key, value, guard) {
            Ok(inserted) => inserted,
            Err(GrowError::AllocFailed { layout }) => std::alloc::handle_alloc_error(layout),
            Err(err) => panic!("{err}"),
        }
    }

    /// Inserts a key-value pair into the map, unless the key is already present.
    ///
    /// Returns an error if the table had to grow and the new table could not be allocated,
    /// in which case the map is left unchanged.
    #[inline]
    pub fn try_emplace(&self, key: K, value: V, guard: &impl Guard) -> Result<bool, GrowError> {
        self.raw.verify(guard);
        self.raw.insert(key, value, guard)
    }

    /// Removes a key from the map, returning its value if the key was present.
    ///
    /// Managed values are retired rather than dropped, and the returned reference stays valid
    /// until the guard is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().emplace(1, 10);
    /// assert_eq!(map.pin().extract(&1), Some(10));
    /// assert_eq!(map.pin().extract(&1), None);
    /// ```
    #[inline]
    pub fn extract<'g>(&self, key: &K, guard: &'g impl Guard) -> Option<V::Accessor<'g>> {
        self.raw.verify(guard);
        self.raw.remove(key, guard)
    }

    /// Removes a key from the map, returning `true` if the key was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().emplace(1, 10);
    /// assert!(map.pin().erase(&1));
    /// assert!(!map.pin().erase(&1));
    /// ```
    #[inline]
    pub fn erase(&self, key: &K, guard: &impl Guard) -> bool {
        self.raw.verify(guard);
        self.raw.erase(key, guard)
    }

    /// Returns an iterator positioned at the first item of the map.
    ///
    /// The iterator locks the bucket it is positioned on, so the thread holding it must not
    /// access the map except through the iterator. Other threads accessing the locked bucket
    /// wait until the iterator moves on.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().emplace(1, 10);
    /// map.pin().emplace(2, 20);
    ///
    /// let guard = map.guard();
    /// let mut items: Vec<_> = map.iter(&guard).collect();
    /// items.sort();
    /// assert_eq!(items, [(1, 10), (2, 20)]);
    /// ```
    #[inline]
    pub fn iter<'g, G: Guard>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, B, G> {
        self.raw.verify(guard);
        self.raw.iter(guard)
    }

    /// Returns an exhausted iterator, which compares equal to any iterator that moved past the
    /// last item.
    #[inline]
    pub fn end<'g, G: Guard>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, B, G> {
        self.raw.verify(guard);
        self.raw.end(guard)
    }
}

impl<K, V, S, B> PartialEq for HashMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    for<'g> V::Accessor<'g>: PartialEq,
    S: BuildHasher,
    B: Backoff,
{
    fn eq(&self, other: &Self) -> bool {
        // Reading from a map while iterating over it would wait on our own bucket locks.
        if std::ptr::eq(self, other) {
            return true;
        }

        if self.len() != other.len() {
            return false;
        }

        let (guard1, guard2) = (&self.guard(), &other.guard());

        let mut iter = self.iter(guard1);
        iter.all(|(key, value)| {
            other
                .try_get_value(&key, guard2)
                .map_or(false, |v| value == v)
        })
    }
}

impl<K, V, S, B> Eq for HashMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    for<'g> V::Accessor<'g>: Eq,
    S: BuildHasher,
    B: Backoff,
{
}

impl<K, V, S, B> fmt::Debug for HashMap<K, V, S, B>
where
    K: Word + Hash + Eq + fmt::Debug,
    V: Value,
    for<'g> V::Accessor<'g>: fmt::Debug,
    S: BuildHasher,
    B: Backoff,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S, B> Extend<(K, V)> for &HashMap<K, V, S, B>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = self.guard();

        for (key, value) in iter {
            self.emplace(key, value, &guard);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = HashMap::default();
        (&map).extend(iter);
        map
    }
}

/// A pinned reference to a [`HashMap`].
///
/// This type is created with [`HashMap::pin`] and can be used to easily access a [`HashMap`]
/// without explicitly managing a guard. See the [crate-level documentation](crate#usage) for details.
pub struct HashMapRef<'map, K: Word, V: Value, S, B, G> {
    guard: G,
    map: &'map HashMap<K, V, S, B>,
}

impl<'map, K, V, S, B, G> HashMapRef<'map, K, V, S, B, G>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
    G: Guard,
{
    /// Returns a reference to the inner [`HashMap`].
    #[inline]
    pub fn map(&self) -> &'map HashMap<K, V, S, B> {
        self.map
    }

    /// Returns the number of entries in the map.
    ///
    /// See [`HashMap::len`] for details.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.raw.len()
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// See [`HashMap::is_empty`] for details.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current table.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.map.raw.bucket_count(&self.guard)
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// See [`HashMap::contains`] for details.
    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.try_get_value(key).is_some()
    }

    /// Returns the value corresponding to the key.
    ///
    /// See [`HashMap::try_get_value`] for details.
    #[inline]
    pub fn try_get_value(&self, key: &K) -> Option<V::Accessor<'_>> {
        self.map.raw.get(key, &self.guard)
    }

    /// Inserts a key-value pair into the map, unless the key is already present.
    ///
    /// See [`HashMap::emplace`] for details.
    #[inline]
    pub fn emplace(&self, key: K, value: V) -> bool {
        self.map.emplace(key, value, &self.guard)
    }

    /// Inserts a key-value pair into the map, unless the key is already present.
    ///
    /// See [`HashMap::try_emplace`] for details.
    #[inline]
    pub fn try_emplace(&self, key: K, value: V) -> Result<bool, GrowError> {
        self.map.raw.insert(key, value, &self.guard)
    }

    /// Removes a key from the map, returning its value if the key was present.
    ///
    /// See [`HashMap::extract`] for details.
    #[inline]
    pub fn extract(&self, key: &K) -> Option<V::Accessor<'_>> {
        self.map.raw.remove(key, &self.guard)
    }

    /// Removes a key from the map, returning `true` if the key was present.
    ///
    /// See [`HashMap::erase`] for details.
    #[inline]
    pub fn erase(&self, key: &K) -> bool {
        self.map.raw.erase(key, &self.guard)
    }

    /// Returns an iterator positioned at the first item of the map.
    ///
    /// See [`HashMap::iter`] for details.
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V, S, B, G> {
        self.map.raw.iter(&self.guard)
    }

    /// Returns an exhausted iterator.
    ///
    /// See [`HashMap::end`] for details.
    #[inline]
    pub fn end(&self) -> Iter<'_, K, V, S, B, G> {
        self.map.raw.end(&self.guard)
    }
}

impl<K, V, S, B, G> fmt::Debug for HashMapRef<'_, K, V, S, B, G>
where
    K: Word + Hash + Eq + fmt::Debug,
    V: Value,
    for<'g> V::Accessor<'g>: fmt::Debug,
    S: BuildHasher,
    B: Backoff,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V, S, B, G> IntoIterator for &'a HashMapRef<'_, K, V, S, B, G>
where
    K: Word + Hash + Eq,
    V: Value,
    S: BuildHasher,
    B: Backoff,
    G: Guard,
{
    type Item = (K, V::Accessor<'a>);
    type IntoIter = Iter<'a, K, V, S, B, G>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
