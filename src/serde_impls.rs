//! Serde support, enabled by the `serde` feature.
//!
//! Serialization walks a weakly consistent snapshot: entries inserted or
//! removed while serializing may or may not appear.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, Serializer};

use crate::map::DriftMap;

impl<K, V, S> Serialize for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord + Serialize,
    V: Sync + Send + Serialize,
    S: BuildHasher,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let guard = self.guard();
        serializer.collect_map(self.iter(&guard))
    }
}

impl<'de, K, V, S> Deserialize<'de> for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord + Deserialize<'de>,
    V: Sync + Send + Deserialize<'de>,
    S: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapVisitor {
            _marker: PhantomData,
        })
    }
}

struct MapVisitor<K, V, S> {
    _marker: PhantomData<DriftMap<K, V, S>>,
}

impl<'de, K, V, S> Visitor<'de> for MapVisitor<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord + Deserialize<'de>,
    V: Sync + Send + Deserialize<'de>,
    S: BuildHasher + Default,
{
    type Value = DriftMap<K, V, S>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let map = DriftMap::with_capacity_and_hasher(
            access.size_hint().unwrap_or(0),
            S::default(),
        );
        let guard = map.guard();
        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value, &guard);
        }
        drop(guard);
        Ok(map)
    }
}
