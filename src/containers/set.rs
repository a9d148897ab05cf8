use super::{from_values, to_values};
use crate::container::{ContainerKind, ContainerValue};
use crate::error::{RememoryError, Result};
use crate::store::{ContainerStore, Handle};
use crate::value::{Element, Value};
use std::collections::BTreeSet;
use std::marker::PhantomData;

/// Shared set of unique elements
///
/// The `*_update` methods change the shared set in one locked cycle. The
/// algebra methods (`union`, `intersection`, ...) compute a new local set
/// from a snapshot and leave the shared one alone.
pub struct SharedSet<T> {
    handle: Handle,
    _types: PhantomData<fn() -> T>,
}

impl<T: Element + Ord> SharedSet<T> {
    /// Attach to `name`, creating an empty set if needed
    pub fn open(store: &ContainerStore, name: &str) -> Result<Self> {
        Self::from_handle(store.open(name, ContainerKind::Set.default_value())?)
    }

    /// Attach to `name`, creating it with `initial` members if needed
    pub fn open_with(
        store: &ContainerStore,
        name: &str,
        initial: impl IntoIterator<Item = T>,
    ) -> Result<Self> {
        let set = to_set(initial)?;
        Self::from_handle(store.open(name, ContainerValue::Set(set))?)
    }

    pub fn from_handle(handle: Handle) -> Result<Self> {
        if handle.kind() != ContainerKind::Set {
            return Err(RememoryError::KindMismatch {
                name: handle.name().to_string(),
                expected: ContainerKind::Set.to_string(),
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

    /// Returns whether `value` was newly added
    pub fn add(&self, value: T) -> Result<bool> {
        self.handle.add(value.into_value()?)
    }

    /// Remove `value`; [`RememoryError::ElementNotFound`] if absent
    pub fn remove(&self, value: T) -> Result<()> {
        self.handle.remove(value.into_value()?)
    }

    /// Remove `value` if present
    pub fn discard(&self, value: T) -> Result<bool> {
        self.handle.discard(value.into_value()?)
    }

    /// Remove and return the smallest member
    pub fn pop(&self) -> Result<T> {
        let popped = self.handle.modify(|v| {
            v.as_set_mut()?
                .pop_first()
                .ok_or_else(|| RememoryError::ElementNotFound("pop from empty set".into()))
        })?;
        T::from_value(popped)
    }

    pub fn clear(&self) -> Result<()> {
        self.handle.clear()
    }

    /// Add every element of `other`
    pub fn update(&self, other: impl IntoIterator<Item = T>) -> Result<()> {
        let other = to_set(other)?;
        self.handle.modify(|v| {
            v.as_set_mut()?.extend(other);
            Ok(())
        })
    }

    /// Keep only members also in `other`
    pub fn intersection_update(&self, other: impl IntoIterator<Item = T>) -> Result<()> {
        let other = to_set(other)?;
        self.handle.modify(|v| {
            v.as_set_mut()?.retain(|m| other.contains(m));
            Ok(())
        })
    }

    /// Drop members that are in `other`
    pub fn difference_update(&self, other: impl IntoIterator<Item = T>) -> Result<()> {
        let other = to_set(other)?;
        self.handle.modify(|v| {
            v.as_set_mut()?.retain(|m| !other.contains(m));
            Ok(())
        })
    }

    /// Keep members in exactly one of the two sets
    pub fn symmetric_difference_update(&self, other: impl IntoIterator<Item = T>) -> Result<()> {
        let other = to_set(other)?;
        self.handle.modify(|v| {
            let set = v.as_set_mut()?;
            for member in other {
                if !set.remove(&member) {
                    set.insert(member);
                }
            }
            Ok(())
        })
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

    /// Snapshot of the members
    pub fn to_set(&self) -> Result<BTreeSet<T>> {
        Ok(from_values::<T>(self.handle.snapshot_iter()?)?
            .into_iter()
            .collect())
    }

    pub fn is_disjoint(&self, other: impl IntoIterator<Item = T>) -> Result<bool> {
        let other = to_set(other)?;
        self.with_members(|set| Ok(set.is_disjoint(&other)))
    }

    pub fn is_subset(&self, other: impl IntoIterator<Item = T>) -> Result<bool> {
        let other = to_set(other)?;
        self.with_members(|set| Ok(set.is_subset(&other)))
    }

    pub fn is_superset(&self, other: impl IntoIterator<Item = T>) -> Result<bool> {
        let other = to_set(other)?;
        self.with_members(|set| Ok(set.is_superset(&other)))
    }

    pub fn union(&self, other: impl IntoIterator<Item = T>) -> Result<BTreeSet<T>> {
        let other = to_set(other)?;
        self.algebra(|set| set.union(&other).cloned().collect())
    }

    pub fn intersection(&self, other: impl IntoIterator<Item = T>) -> Result<BTreeSet<T>> {
        let other = to_set(other)?;
        self.algebra(|set| set.intersection(&other).cloned().collect())
    }

    pub fn difference(&self, other: impl IntoIterator<Item = T>) -> Result<BTreeSet<T>> {
        let other = to_set(other)?;
        self.algebra(|set| set.difference(&other).cloned().collect())
    }

    pub fn symmetric_difference(&self, other: impl IntoIterator<Item = T>) -> Result<BTreeSet<T>> {
        let other = to_set(other)?;
        self.algebra(|set| set.symmetric_difference(&other).cloned().collect())
    }

    /// Whether both shared sets hold the same members
    ///
    /// Each side is read in its own locked cycle, one after the other.
    pub fn same_members(&self, other: &SharedSet<T>) -> Result<bool> {
        let ours = self.handle.snapshot()?;
        let theirs = other.handle.snapshot()?;
        Ok(ours.as_set()? == theirs.as_set()?)
    }

    fn with_members<R>(&self, f: impl FnOnce(&BTreeSet<Value>) -> Result<R>) -> Result<R> {
        self.handle.inspect(|v| f(v.as_set()?))
    }

    fn algebra(&self, f: impl FnOnce(&BTreeSet<Value>) -> Vec<Value>) -> Result<BTreeSet<T>> {
        let values = self.with_members(|set| Ok(f(set)))?;
        Ok(from_values::<T>(values)?.into_iter().collect())
    }

    pub fn close(self) {
        self.handle.close()
    }

    pub fn destroy(self) -> Result<()> {
        self.handle.destroy()
    }
}

fn to_set<T: Element>(items: impl IntoIterator<Item = T>) -> Result<BTreeSet<Value>> {
    Ok(to_values(items)?.into_iter().collect())
}
