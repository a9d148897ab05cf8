use super::{from_values, to_values};
use crate::container::{ContainerKind, ContainerValue};
use crate::error::{RememoryError, Result};
use crate::store::{ContainerStore, Handle};
use crate::value::{Element, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Shared key-value map
pub struct SharedMap<K, V> {
    handle: Handle,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: Element, V: Element> SharedMap<K, V> {
    /// Attach to `name`, creating an empty map if needed
    pub fn open(store: &ContainerStore, name: &str) -> Result<Self> {
        Self::from_handle(store.open(name, ContainerKind::Map.default_value())?)
    }

    /// Attach to `name`, creating it with `initial` entries if needed
    pub fn open_with(
        store: &ContainerStore,
        name: &str,
        initial: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self> {
        let map = to_entries(initial)?;
        Self::from_handle(store.open(name, ContainerValue::Map(map))?)
    }

    pub fn from_handle(handle: Handle) -> Result<Self> {
        if handle.kind() != ContainerKind::Map {
            return Err(RememoryError::KindMismatch {
                name: handle.name().to_string(),
                expected: ContainerKind::Map.to_string(),
                found: handle.kind().to_string(),
            });
        }
        Ok(Self {
            handle,
            _types: PhantomData,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Value for `key`; [`RememoryError::KeyNotFound`] if absent
    pub fn get(&self, key: K) -> Result<V> {
        V::from_value(self.handle.get(key.into_value()?)?)
    }

    /// Value for `key`, or `default` if absent
    pub fn get_or(&self, key: K, default: V) -> Result<V> {
        match self.get(key) {
            Err(RememoryError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.handle
            .set(key.into_value()?, value.into_value()?)?
            .map(V::from_value)
            .transpose()
    }

    /// Remove `key`; [`RememoryError::KeyNotFound`] if absent
    pub fn remove(&self, key: K) -> Result<V> {
        V::from_value(self.handle.delete(key.into_value()?)?)
    }

    /// Remove `key` if present
    pub fn pop(&self, key: K) -> Result<Option<V>> {
        let key = key.into_value()?;
        self.handle
            .modify(|v| Ok(v.as_map_mut()?.remove(&key)))?
            .map(V::from_value)
            .transpose()
    }

    pub fn contains_key(&self, key: K) -> Result<bool> {
        self.handle.contains(key.into_value()?)
    }

    pub fn len(&self) -> Result<usize> {
        self.handle.size()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.handle.clear()
    }

    /// Insert every entry in one locked cycle
    pub fn update(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        let entries = to_entries(entries)?;
        self.handle.modify(|v| {
            v.as_map_mut()?.extend(entries);
            Ok(())
        })
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        from_values(self.handle.snapshot_iter()?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        from_values(self.handle.items()?.into_iter().map(|(_, v)| v))
    }

    /// Snapshot of all entries in key order
    pub fn items(&self) -> Result<Vec<(K, V)>> {
        self.handle
            .items()?
            .into_iter()
            .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
            .collect()
    }

    pub fn close(self) {
        self.handle.close()
    }

    pub fn destroy(self) -> Result<()> {
        self.handle.destroy()
    }
}

fn to_entries<K: Element, V: Element>(
    entries: impl IntoIterator<Item = (K, V)>,
) -> Result<BTreeMap<Value, Value>> {
    let (keys, values): (Vec<K>, Vec<V>) = entries.into_iter().unzip();
    Ok(to_values(keys)?.into_iter().zip(to_values(values)?).collect())
}
