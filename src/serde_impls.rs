use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt::{self, Formatter};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use crate::{Backoff, Guard, HashMap, HashMapRef, Managed, NoBackoff, Value, Word};

struct MapVisitor<K, V, S> {
    _marker: PhantomData<fn() -> (K, V, S)>,
}

impl<K, V, S, B, G> Serialize for HashMapRef<'_, K, V, S, B, G>
where
    K: Word + Serialize + Hash + Eq,
    V: Value,
    for<'g> V::Accessor<'g>: Serialize,
    G: Guard,
    S: BuildHasher,
    B: Backoff,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        serializer.collect_map(self)
    }
}

impl<K, V, S, B> Serialize for HashMap<K, V, S, B>
where
    K: Word + Serialize + Hash + Eq,
    V: Value,
    for<'g> V::Accessor<'g>: Serialize,
    S: BuildHasher,
    B: Backoff,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        self.pin().serialize(serializer)
    }
}

impl<'de, K, V, S> Deserialize<'de> for HashMap<K, V, S>
where
    K: Word + Deserialize<'de> + Hash + Eq,
    V: Value + Deserialize<'de>,
    S: Default + BuildHasher,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapVisitor::new())
    }
}

impl<K, V, S> MapVisitor<K, V, S> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<'de, K, V, S> Visitor<'de> for MapVisitor<K, V, S>
where
    K: Word + Deserialize<'de> + Hash + Eq,
    V: Value + Deserialize<'de>,
    S: Default + BuildHasher,
{
    type Value = HashMap<K, V, S, NoBackoff>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let values = match access.size_hint() {
            // Three items fit in every bucket.
            Some(size) => HashMap::with_capacity_and_hasher(size / 3, S::default()),
            None => HashMap::default(),
        };

        {
            let values = values.pin();
            while let Some((key, value)) = access.next_entry()? {
                values.emplace(key, value);
            }
        }

        Ok(values)
    }
}

impl<T: Serialize> Serialize for Managed<T> {
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        (**self).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Managed<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Managed::new)
    }
}
