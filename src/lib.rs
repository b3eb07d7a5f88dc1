#![doc = include_str!("../README.md")]
#![deny(unsafe_op_in_unsafe_fn)]

mod backoff;
mod map;
mod raw;
mod value;

#[cfg(feature = "serde")]
mod serde_impls;

pub use backoff::{Backoff, ExponentialBackoff, NoBackoff};
pub use map::{GrowError, HashMap, HashMapBuilder, HashMapRef};
pub use raw::Iter;
pub use seize::{Collector, Guard, LocalGuard, OwnedGuard};
pub use value::{Atom, Managed, Value, Word};
