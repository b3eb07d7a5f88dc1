//! Key and value representations.
//!
//! Buckets store keys and values inline as atomic words so that readers can scan them without
//! taking a lock. A type can be stored directly if it is a bit-copyable word of 4 or 8 bytes
//! (see [`Word`]). Larger values can be boxed into a [`Managed`] handle, whose lifetime is then
//! tied to the map's [`Collector`](seize::Collector).

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use seize::{reclaim, Guard};

/// An atomic cell holding the bit representation of a [`Word`].
pub trait Atom: Default + Send + Sync + 'static {
    /// The raw bits stored in the cell.
    type Bits: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn load(&self, ordering: Ordering) -> Self::Bits;
    fn store(&self, bits: Self::Bits, ordering: Ordering);
}

macro_rules! atom {
    ($($atomic:ty => $bits:ty),*) => {$(
        impl Atom for $atomic {
            type Bits = $bits;

            #[inline(always)]
            fn load(&self, ordering: Ordering) -> $bits {
                <$atomic>::load(self, ordering)
            }

            #[inline(always)]
            fn store(&self, bits: $bits, ordering: Ordering) {
                <$atomic>::store(self, bits, ordering)
            }
        }
    )*};
}

atom!(AtomicU32 => u32, AtomicU64 => u64, AtomicUsize => usize);

/// The raw bits of a word.
pub(crate) type Bits<A> = <A as Atom>::Bits;

/// A bit-copyable type of exactly 4 or 8 bytes.
///
/// # Safety
///
/// `from_bits(into_bits(x))` must return `x`, and `from_bits` must return a valid value for every
/// bit pattern produced by `into_bits` as well as for the all-zero pattern (the contents of a freshly
/// allocated slot). `Atom` must be exactly as large as `Self`.
pub unsafe trait Word: Copy + Send + Sync + 'static {
    /// The atomic cell used to store this type.
    type Atom: Atom;

    fn into_bits(self) -> Bits<Self::Atom>;
    fn from_bits(bits: Bits<Self::Atom>) -> Self;
}

macro_rules! word {
    ($($ty:ty => $atomic:ty, |$x:ident| $into:expr, |$b:ident| $from:expr;)*) => {$(
        unsafe impl Word for $ty {
            type Atom = $atomic;

            #[inline(always)]
            fn into_bits(self) -> Bits<$atomic> {
                let $x = self;
                $into
            }

            #[inline(always)]
            fn from_bits($b: Bits<$atomic>) -> Self {
                $from
            }
        }
    )*};
}

word! {
    u32 => AtomicU32, |x| x, |b| b;
    i32 => AtomicU32, |x| x as u32, |b| b as i32;
    f32 => AtomicU32, |x| x.to_bits(), |b| f32::from_bits(b);
    char => AtomicU32, |x| x as u32, |b| char::from_u32(b).unwrap_or('\0');
    u64 => AtomicU64, |x| x, |b| b;
    i64 => AtomicU64, |x| x as u64, |b| b as i64;
    f64 => AtomicU64, |x| x.to_bits(), |b| f64::from_bits(b);
    usize => AtomicUsize, |x| x, |b| b;
    isize => AtomicUsize, |x| x as usize, |b| b as isize;
}

// Fails to compile if a `Word` is not stored in a cell of its own size, or is not 4 or 8 bytes wide.
pub(crate) struct AssertWord<T>(PhantomData<T>);

impl<T: Word> AssertWord<T> {
    pub(crate) const OK: () = assert!(
        (mem::size_of::<T>() == 4 || mem::size_of::<T>() == 8)
            && mem::size_of::<T>() == mem::size_of::<<T as Word>::Atom>(),
        "keys and values must be 4 or 8 byte words"
    );
}

/// A type that can be stored as a value in a [`HashMap`](crate::HashMap).
///
/// Every [`Word`] is a value and is copied out on access. [`Managed`] values are stored as a
/// pointer and handed out by reference, protected by the guard used for the access.
///
/// # Safety
///
/// `access`, `retire` and `release` must only be passed bits produced by `into_bits`. The map
/// guarantees that each stored value is either retired or released exactly once.
pub unsafe trait Value: Send + Sync + Sized + 'static {
    /// The atomic cell used to store this type.
    type Atom: Atom;

    /// The handle returned by lookups and removals.
    type Accessor<'g>;

    /// Converts the value into its stored representation, transferring ownership into the bits.
    fn into_bits(self) -> Bits<Self::Atom>;

    /// Returns an accessor for a stored value.
    ///
    /// # Safety
    ///
    /// The bits must have been read from a validated snapshot while `'g` protects the table.
    unsafe fn access<'g>(bits: Bits<Self::Atom>) -> Self::Accessor<'g>;

    /// Retires a value that was removed from the map while readers may still observe it.
    ///
    /// # Safety
    ///
    /// The value must be unreachable from the map, and must not be retired or released again.
    unsafe fn retire(_bits: Bits<Self::Atom>, _guard: &impl Guard) {}

    /// Drops a value that no other thread can observe.
    ///
    /// # Safety
    ///
    /// The value must never have been published, or the map must be exclusively owned.
    unsafe fn release(_bits: Bits<Self::Atom>) {}
}

unsafe impl<T> Value for T
where
    T: Word,
{
    type Atom = <T as Word>::Atom;
    type Accessor<'g> = T;

    #[inline(always)]
    fn into_bits(self) -> Bits<<T as Word>::Atom> {
        let () = AssertWord::<T>::OK;
        Word::into_bits(self)
    }

    #[inline(always)]
    unsafe fn access<'g>(bits: Bits<<T as Word>::Atom>) -> Self::Accessor<'g> {
        T::from_bits(bits)
    }
}

/// A heap-allocated value whose lifetime is managed by the map's collector.
///
/// The map stores a pointer-sized handle to the allocation. Lookups return `&T` references that
/// stay valid for as long as the guard used for the lookup, even if the value is concurrently
/// removed; the allocation is only freed once no guard can observe it.
///
/// # Examples
///
/// ```
/// use seqmap::{HashMap, Managed};
///
/// let map: HashMap<u64, Managed<String>> = HashMap::new();
/// let guard = map.guard();
/// map.emplace(1, Managed::new("one".to_owned()), &guard);
///
/// let removed = map.extract(&1, &guard).unwrap();
/// // Still valid until `guard` is dropped.
/// assert_eq!(removed, "one");
/// ```
pub struct Managed<T>(Box<T>);

impl<T> Managed<T> {
    /// Allocates a new managed value.
    pub fn new(value: T) -> Managed<T> {
        Managed(Box::new(value))
    }

    /// Returns the inner value.
    pub fn into_inner(self) -> T {
        *self.0
    }
}

impl<T> Deref for Managed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Managed<T> {
    fn from(value: T) -> Managed<T> {
        Managed::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Managed").field(&self.0).finish()
    }
}

unsafe impl<T> Value for Managed<T>
where
    T: Send + Sync + 'static,
{
    type Atom = AtomicUsize;
    type Accessor<'g> = &'g T;

    #[inline]
    fn into_bits(self) -> usize {
        Box::into_raw(self.0) as usize
    }

    #[inline]
    unsafe fn access<'g>(bits: usize) -> &'g T {
        // Safety: The pointer came from `Box::into_raw` and is protected by the guard.
        unsafe { &*(bits as *const T) }
    }

    #[inline]
    unsafe fn retire(bits: usize, guard: &impl Guard) {
        // Safety: The value is unreachable and is retired exactly once.
        unsafe { guard.defer_retire(bits as *mut T, reclaim::boxed::<T>) }
    }

    #[inline]
    unsafe fn release(bits: usize) {
        // Safety: No other thread can observe the value.
        let _ = unsafe { Box::from_raw(bits as *mut T) };
    }
}
