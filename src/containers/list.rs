use super::{from_values, to_values};
use crate::container::{ContainerKind, ContainerValue};
use crate::error::{RememoryError, Result};
use crate::store::{ContainerStore, Handle};
use crate::value::Element;
use std::marker::PhantomData;

/// Shared ordered sequence
pub struct SharedList<T> {
    handle: Handle,
    _types: PhantomData<fn() -> T>,
}

impl<T: Element> SharedList<T> {
    /// Attach to `name`, creating an empty list if needed
    pub fn open(store: &ContainerStore, name: &str) -> Result<Self> {
        Self::from_handle(store.open(name, ContainerKind::Sequence.default_value())?)
    }

    /// Attach to `name`, creating it with `initial` elements if needed
    pub fn open_with(
        store: &ContainerStore,
        name: &str,
        initial: impl IntoIterator<Item = T>,
    ) -> Result<Self> {
        let seq = to_values(initial)?;
        Self::from_handle(store.open(name, ContainerValue::Sequence(seq))?)
    }

    pub fn from_handle(handle: Handle) -> Result<Self> {
        if handle.kind() != ContainerKind::Sequence {
            return Err(RememoryError::KindMismatch {
                name: handle.name().to_string(),
                expected: ContainerKind::Sequence.to_string(),
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

    pub fn push(&self, value: T) -> Result<()> {
        self.handle.append(value.into_value()?)
    }

    /// Append every element in one locked cycle
    pub fn extend(&self, values: impl IntoIterator<Item = T>) -> Result<()> {
        let values = to_values(values)?;
        self.handle.modify(|v| {
            v.as_sequence_mut()?.extend(values);
            Ok(())
        })
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&self, index: usize, value: T) -> Result<()> {
        let value = value.into_value()?;
        self.handle.modify(|v| v.insert(index, value))
    }

    pub fn get(&self, index: usize) -> Result<T> {
        T::from_value(self.handle.index_get(index)?)
    }

    /// Overwrite the element at `index`; returns the old one
    pub fn set(&self, index: usize, value: T) -> Result<T> {
        T::from_value(self.handle.index_set(index, value.into_value()?)?)
    }

    /// Remove and return the last element
    pub fn pop(&self) -> Result<Option<T>> {
        self.handle
            .modify(|v| Ok(v.as_sequence_mut()?.pop()))?
            .map(T::from_value)
            .transpose()
    }

    /// Remove and return the element at `index`
    pub fn remove_at(&self, index: usize) -> Result<T> {
        let removed = self.handle.modify(|v| {
            let seq = v.as_sequence_mut()?;
            if index >= seq.len() {
                return Err(RememoryError::IndexOutOfRange {
                    index,
                    len: seq.len(),
                });
            }
            Ok(seq.remove(index))
        })?;
        T::from_value(removed)
    }

    /// Remove the first element equal to `value`
    pub fn remove(&self, value: T) -> Result<()> {
        self.handle.remove(value.into_value()?)
    }

    /// Position of the first element equal to `value`
    pub fn index_of(&self, value: T) -> Result<Option<usize>> {
        let value = value.into_value()?;
        self.handle
            .inspect(|v| Ok(v.as_sequence()?.iter().position(|e| *e == value)))
    }

    pub fn contains(&self, value: T) -> Result<bool> {
        self.handle.contains(value.into_value()?)
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

    /// Snapshot of every element in order
    pub fn to_vec(&self) -> Result<Vec<T>> {
        from_values(self.handle.snapshot_iter()?)
    }

    pub fn close(self) {
        self.handle.close()
    }

    pub fn destroy(self) -> Result<()> {
        self.handle.destroy()
    }
}
