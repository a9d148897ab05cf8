//! Typed containers over [`Handle`](crate::Handle)
//!
//! Each wrapper converts its element types through [`Element`] or
//! [`CellValue`](crate::container::CellValue) and forwards to one locked
//! cycle per call. Inputs are converted before the lock is taken.

mod cell;
mod list;
mod map;
mod set;

pub use cell::SharedCell;
pub use list::SharedList;
pub use map::SharedMap;
pub use set::SharedSet;

use crate::error::Result;
use crate::value::{Element, Value};

fn to_values<T: Element>(items: impl IntoIterator<Item = T>) -> Result<Vec<Value>> {
    items.into_iter().map(Element::into_value).collect()
}

fn from_values<T: Element>(values: impl IntoIterator<Item = Value>) -> Result<Vec<T>> {
    values.into_iter().map(T::from_value).collect()
}
