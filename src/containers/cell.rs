use crate::container::{CellValue, ContainerKind, ContainerValue, Scalar};
use crate::error::{RememoryError, Result};
use crate::store::{ContainerStore, Handle};
use std::marker::PhantomData;

/// Shared single-value cell
///
/// Integer cells wrap on overflow. Text and blob cells have a fixed byte
/// capacity chosen at creation.
pub struct SharedCell<T> {
    handle: Handle,
    _types: PhantomData<fn() -> T>,
}

impl<T: CellValue> SharedCell<T> {
    /// Attach to `name`, creating it holding `initial` if needed
    pub fn open(store: &ContainerStore, name: &str, initial: T) -> Result<Self> {
        Self::from_handle(store.open(name, ContainerValue::Scalar(initial.into_scalar()))?)
    }

    pub fn from_handle(handle: Handle) -> Result<Self> {
        if !matches!(handle.kind(), ContainerKind::Scalar(_)) {
            return Err(RememoryError::KindMismatch {
                name: handle.name().to_string(),
                expected: "scalar".to_string(),
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

    pub fn get(&self) -> Result<T> {
        T::from_scalar(self.handle.get_scalar()?)
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.handle.set_scalar(value.into_scalar())
    }

    /// Add `amount` and return the new value
    pub fn increment(&self, amount: T) -> Result<T> {
        T::from_scalar(self.handle.increment(amount.into_scalar())?)
    }

    /// Apply `f` to the current value in one locked cycle
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<T> {
        let scalar = self.handle.modify(|v| {
            let next = f(T::from_scalar(v.scalar()?)?).into_scalar();
            v.set_scalar(next)?;
            v.scalar()
        })?;
        T::from_scalar(scalar)
    }

    pub fn close(self) {
        self.handle.close()
    }

    pub fn destroy(self) -> Result<()> {
        self.handle.destroy()
    }
}

impl SharedCell<String> {
    /// Text cell holding at most `capacity` bytes
    pub fn open_text(
        store: &ContainerStore,
        name: &str,
        initial: &str,
        capacity: usize,
    ) -> Result<Self> {
        let scalar = Scalar::text(initial, capacity)?;
        Self::from_handle(store.open(name, ContainerValue::Scalar(scalar))?)
    }
}

impl SharedCell<Vec<u8>> {
    /// Blob cell holding at most `capacity` bytes
    pub fn open_blob(
        store: &ContainerStore,
        name: &str,
        initial: &[u8],
        capacity: usize,
    ) -> Result<Self> {
        let scalar = Scalar::blob(initial, capacity)?;
        Self::from_handle(store.open(name, ContainerValue::Scalar(scalar))?)
    }
}
