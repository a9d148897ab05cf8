//! Rememory - cross-process shared containers
//!
//! Independent processes share maps, lists, sets and scalar cells through
//! named POSIX shared memory. Any process that opens the same name attaches
//! to the same data.
//!
//! # Architecture
//!
//! - **NamedLock**: `flock` on a named shared memory object, one per container
//! - **SharedSegment**: control block plus a data object that is replaced by
//!   a larger generation when it fills up
//! - **Envelope**: fixed header (magic, version, generation, length) in front
//!   of a `bincode` payload
//! - **ContainerStore / Handle**: lock, load, apply, grow, write, unlock
//!
//! # Example
//!
//! ```no_run
//! use rememory::{ContainerStore, SharedCell, SharedMap};
//!
//! let store = ContainerStore::default();
//! let jobs: SharedMap<String, i64> = SharedMap::open(&store, "jobs")?;
//! jobs.insert("build".into(), 3)?;
//!
//! let counter = SharedCell::open(&store, "visits", 0u64)?;
//! counter.increment(1)?;
//! # Ok::<(), rememory::RememoryError>(())
//! ```
//!
//! # Consistency
//!
//! Every call is one critical section over the whole container. Iteration
//! works on a snapshot taken in one critical section and is not re-validated
//! afterwards.

pub mod config;
pub mod container;
pub mod containers;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod naming;
pub mod segment;
pub mod shm;
pub mod store;
pub mod value;

pub use config::StoreConfig;
pub use container::{CellValue, ContainerKind, ContainerValue, Scalar, ScalarKind};
pub use containers::{SharedCell, SharedList, SharedMap, SharedSet};
pub use error::{RememoryError, Result};
pub use lock::NamedLock;
pub use segment::SharedSegment;
pub use store::{ContainerStore, Handle};
pub use value::{Bytes, Element, Record, Value};
