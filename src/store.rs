//! Container store: the locked read-modify-write engine
//!
//! Every operation on a [`Handle`] runs the same cycle:
//!
//! 1. acquire the container's [`NamedLock`]
//! 2. remap the segment if another process grew it, then parse the envelope
//! 3. decode the [`ContainerValue`] (or start from the kind's default)
//! 4. apply the operation to the in-memory copy
//! 5. for mutations, re-encode and grow the segment if the payload no
//!    longer fits
//! 6. write the envelope and release the lock
//!
//! An operation that fails before step 6 leaves the shared bytes untouched.

use crate::config::StoreConfig;
use crate::container::{ContainerKind, ContainerValue, Scalar};
use crate::envelope::{self, Envelope, HEADER_SIZE};
use crate::error::{RememoryError, Result};
use crate::lock::NamedLock;
use crate::naming::ObjectNames;
use crate::segment::{SegmentInfo, SharedSegment};
use crate::value::Value;
use parking_lot::Mutex;
use std::thread::{self, ThreadId};

/// Growth is rounded up to whole pages
const GROW_ALIGN: usize = 4096;

/// Opens and destroys named containers
#[derive(Debug, Clone, Default)]
pub struct ContainerStore {
    config: StoreConfig,
}

impl ContainerStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Attach to the container `name`, creating it with `default` if it
    /// does not exist yet
    ///
    /// An existing container keeps its contents; `default` then only fixes
    /// the kind the handle expects, and a container of another kind is
    /// reported as [`RememoryError::KindMismatch`].
    pub fn open(&self, name: &str, default: ContainerValue) -> Result<Handle> {
        let names = ObjectNames::new(name)?;
        let mut lock = self.open_lock(&names)?;
        let kind = default.kind();

        let segment = {
            let guard = lock.lock(self.config.lock_timeout)?;

            let payload = envelope::encode_payload(&default)?;
            let initial = self.config.initial_capacity.max(HEADER_SIZE + payload.len());
            let mut segment = SharedSegment::create_or_attach_names(names, initial)?;

            if segment.was_created() {
                store_payload(&mut segment, &payload)?;
            } else if let Some(stored) = load_current(&mut segment, self.config.max_attempts)? {
                check_kind(name, &kind, &stored)?;
            }

            guard.unlock()?;
            segment
        };

        tracing::debug!(name, %kind, generation = segment.generation(), "container opened");
        Ok(Handle::new(name, kind, self.config.clone(), segment, lock))
    }

    /// Attach to an existing container of `kind`
    ///
    /// Fails with [`RememoryError::SegmentNotFound`] if nothing exists under
    /// `name`; callers may fall back to [`open`](Self::open).
    pub fn attach(&self, name: &str, kind: ContainerKind) -> Result<Handle> {
        let names = ObjectNames::new(name)?;
        let mut lock = self.open_lock(&names)?;

        let segment = {
            let guard = lock.lock(self.config.lock_timeout)?;
            let mut segment = SharedSegment::attach_names(names)?;
            if let Some(stored) = load_current(&mut segment, self.config.max_attempts)? {
                check_kind(name, &kind, &stored)?;
            }
            guard.unlock()?;
            segment
        };

        Ok(Handle::new(name, kind, self.config.clone(), segment, lock))
    }

    /// Remove the container `name` and its lock from the system
    ///
    /// Handles opened before the destroy are orphaned: every later call on
    /// them fails with [`RememoryError::SegmentNotFound`], even once the name
    /// is reused. Returns `false` if no segment existed.
    pub fn destroy(&self, name: &str) -> Result<bool> {
        let names = ObjectNames::new(name)?;
        let mut lock = self.open_lock(&names)?;
        lock.acquire(self.config.lock_timeout)?;

        let existed = match SharedSegment::attach_names(names) {
            Ok(segment) => {
                segment.destroy()?;
                true
            }
            Err(RememoryError::SegmentNotFound(_)) => false,
            Err(e) => return Err(e),
        };

        lock.destroy()?;
        tracing::debug!(name, existed, "container destroyed");
        Ok(existed)
    }

    /// See [`NamedLock::force_clear_stale_lock`] for the safety caveat
    pub fn force_clear_stale_lock(&self, name: &str) -> Result<bool> {
        NamedLock::force_clear_stale_lock(name)
    }

    fn open_lock(&self, names: &ObjectNames) -> Result<NamedLock> {
        let mut lock = NamedLock::open_names(names)?;
        lock.set_max_backoff(self.config.lock_poll_interval);
        Ok(lock)
    }
}

struct Attachment {
    segment: SharedSegment,
    lock: NamedLock,
}

/// Process-local binding of a container name to its segment and lock
///
/// Attached from construction until [`close`](Self::close),
/// [`destroy`](Self::destroy) or drop. A handle may be shared between
/// threads; calls through one handle are serialized in-process before they
/// contend for the named lock.
pub struct Handle {
    name: String,
    kind: ContainerKind,
    config: StoreConfig,
    inner: Mutex<Attachment>,
    seen: Mutex<SegmentInfo>,
    /// Thread inside a cycle on this handle, for catching nested calls
    owner: Mutex<Option<ThreadId>>,
}

struct OwnerReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Handle {
    fn new(
        name: &str,
        kind: ContainerKind,
        config: StoreConfig,
        segment: SharedSegment,
        lock: NamedLock,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            config,
            seen: Mutex::new(segment.info()),
            inner: Mutex::new(Attachment { segment, lock }),
            owner: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Generation and capacity as last seen by this handle
    pub fn info(&self) -> SegmentInfo {
        self.seen.lock().clone()
    }

    /// Run `op` on the current value under the lock and write the result back
    ///
    /// If `op` fails nothing is written. Calling back into the same handle
    /// from inside `op` fails with [`RememoryError::LockAlreadyHeld`].
    pub fn modify<R>(&self, op: impl FnOnce(&mut ContainerValue) -> Result<R>) -> Result<R> {
        self.run(true, op)
    }

    /// Run `op` on the current value under the lock without writing
    pub fn inspect<R>(&self, op: impl FnOnce(&ContainerValue) -> Result<R>) -> Result<R> {
        self.run(false, |value| op(value))
    }

    fn run<R>(&self, mutate: bool, op: impl FnOnce(&mut ContainerValue) -> Result<R>) -> Result<R> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            return Err(RememoryError::LockAlreadyHeld(self.name.clone()));
        }

        let mut inner = self
            .inner
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| RememoryError::LockTimeout {
                name: self.name.clone(),
                timeout: self.config.lock_timeout,
            })?;
        *self.owner.lock() = Some(me);
        let _owner = OwnerReset(&self.owner);

        let Attachment { segment, lock } = &mut *inner;

        let guard = lock.lock(self.config.lock_timeout)?;
        let result = self.cycle(segment, mutate, op);
        *self.seen.lock() = segment.info();
        guard.unlock()?;
        result
    }

    fn cycle<R>(
        &self,
        segment: &mut SharedSegment,
        mutate: bool,
        op: impl FnOnce(&mut ContainerValue) -> Result<R>,
    ) -> Result<R> {
        let mut value = match load_current(segment, self.config.max_attempts)? {
            Some(value) => value,
            None => self.kind.default_value(),
        };
        check_kind(&self.name, &self.kind, &value)?;

        let out = op(&mut value)?;
        if mutate {
            store_payload(segment, &envelope::encode_payload(&value)?)?;
        }
        Ok(out)
    }

    /// Map lookup
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.inspect(|v| v.get(&key))
    }

    /// Map insert or update; returns the previous value
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.modify(|v| v.set(key, value))
    }

    /// Map removal of an existing key
    pub fn delete(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.modify(|v| v.delete(&key))
    }

    /// Sequence append
    pub fn append(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.modify(|v| v.append(value))
    }

    pub fn index_get(&self, index: usize) -> Result<Value> {
        self.inspect(|v| v.index_get(index))
    }

    /// Overwrite an existing sequence element; returns the old one
    pub fn index_set(&self, index: usize, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        self.modify(|v| v.index_set(index, value))
    }

    /// Set insertion; returns whether the element was new
    pub fn add(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.modify(|v| v.add(value))
    }

    /// Set removal that ignores absent members
    pub fn discard(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.modify(|v| v.discard(&value))
    }

    /// Removal that fails with [`RememoryError::ElementNotFound`] if absent
    pub fn remove(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.modify(|v| v.remove(&value))
    }

    /// Map key, sequence element or set member test
    pub fn contains(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.inspect(|v| v.contains(&value))
    }

    /// Add to a numeric scalar; returns the new value
    pub fn increment(&self, amount: Scalar) -> Result<Scalar> {
        self.modify(|v| v.increment(&amount))
    }

    pub fn get_scalar(&self) -> Result<Scalar> {
        self.inspect(|v| v.scalar())
    }

    pub fn set_scalar(&self, value: Scalar) -> Result<()> {
        self.modify(|v| v.set_scalar(value))
    }

    /// Number of entries, elements or members
    pub fn size(&self) -> Result<usize> {
        self.inspect(|v| v.len())
    }

    /// Empty the container, or zero a scalar
    pub fn clear(&self) -> Result<()> {
        self.modify(|v| {
            v.clear();
            Ok(())
        })
    }

    /// Copy of the whole value as of one locked read
    pub fn snapshot(&self) -> Result<ContainerValue> {
        self.inspect(|v| Ok(v.clone()))
    }

    /// Iterate a snapshot: map keys, sequence elements or set members
    ///
    /// The lock is released before iteration starts, so writes committed
    /// afterwards are not observed.
    pub fn snapshot_iter(&self) -> Result<std::vec::IntoIter<Value>> {
        Ok(self.snapshot()?.into_elements()?.into_iter())
    }

    /// Map entries of a snapshot in key order
    pub fn items(&self) -> Result<Vec<(Value, Value)>> {
        self.snapshot()?.into_items()
    }

    /// Detach from the container, leaving it in place for other processes
    pub fn close(self) {
        tracing::debug!(name = %self.name, "handle closed");
    }

    /// Remove the container and its lock from the system
    ///
    /// See [`ContainerStore::destroy`] for what happens to other handles.
    pub fn destroy(self) -> Result<()> {
        let Attachment {
            mut segment,
            mut lock,
        } = self.inner.into_inner();
        lock.acquire(self.config.lock_timeout)?;
        // Someone else destroyed it; the name may already belong to a new
        // container that must not be unlinked from here
        segment.ensure_linked()?;
        if !segment.is_current() {
            segment.reattach()?;
        }
        segment.destroy()?;
        lock.destroy()?;
        tracing::debug!(name = %self.name, "container destroyed");
        Ok(())
    }
}

fn check_kind(name: &str, expected: &ContainerKind, value: &ContainerValue) -> Result<()> {
    let found = value.kind();
    if expected.accepts(&found) {
        return Ok(());
    }
    Err(RememoryError::KindMismatch {
        name: name.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    })
}

/// Decode the value stored in `segment`, following grows by other processes
///
/// Returns `Ok(None)` for a segment nobody has written yet.
fn load_current(segment: &mut SharedSegment, max_attempts: u32) -> Result<Option<ContainerValue>> {
    let attempts = max_attempts.max(1);
    segment.ensure_linked()?;

    for attempt in 1..=attempts {
        if !segment.is_current() {
            segment.reattach()?;
        }

        let current = segment.generation();
        let stamped = match Envelope::parse(segment.read())? {
            None => return Ok(None),
            Some(envelope) if envelope.header.generation <= current => {
                if envelope.header.generation < current {
                    // A grow copied the bytes but its writer died before
                    // restamping them; the payload itself is intact
                    tracing::debug!(
                        name = segment.name(),
                        stamped = envelope.header.generation,
                        current,
                        "envelope carried over by grow"
                    );
                }
                return envelope.decode().map(Some);
            }
            Some(envelope) => envelope.header.generation,
        };

        tracing::debug!(
            name = segment.name(),
            stamped,
            current,
            attempt,
            "envelope is newer than the mapping, reattaching"
        );
        segment.reattach()?;
    }

    Err(RememoryError::Contention {
        name: segment.name().to_string(),
        attempts,
    })
}

/// Frame and write `payload`, growing the segment first if needed
fn store_payload(segment: &mut SharedSegment, payload: &[u8]) -> Result<()> {
    let needed = HEADER_SIZE + payload.len();
    if needed > segment.capacity() {
        segment.grow(grow_target(segment.capacity(), needed))?;
    }
    segment.write(&envelope::frame(segment.generation(), payload))
}

fn grow_target(capacity: usize, needed: usize) -> usize {
    let target = needed.max(capacity.saturating_mul(2));
    target.div_ceil(GROW_ALIGN) * GROW_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ScalarKind;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        format!("storetest_{}_{}", tag, std::process::id())
    }

    fn small_store() -> ContainerStore {
        ContainerStore::new(
            StoreConfig::default()
                .with_initial_capacity(128)
                .with_lock_timeout(Duration::from_secs(5)),
        )
    }

    #[test]
    fn test_grow_target() {
        assert_eq!(grow_target(128, 200), 4096);
        assert_eq!(grow_target(4096, 4097), 8192);
        assert_eq!(grow_target(4096, 20_000), 20_480);
    }

    #[test]
    fn test_map_visible_to_second_handle() {
        let store = small_store();
        let name = unique("map");
        let a = store.open(&name, ContainerValue::Map(BTreeMap::new())).unwrap();
        let b = store.open(&name, ContainerValue::Map(BTreeMap::new())).unwrap();

        a.set("x", 1).unwrap();
        assert_eq!(b.get("x").unwrap(), Value::Int(1));
        assert!(matches!(b.get("y"), Err(RememoryError::KeyNotFound(_))));

        b.close();
        a.destroy().unwrap();
    }

    #[test]
    fn test_default_only_applies_on_create() {
        let store = small_store();
        let name = unique("default");
        let mut seeded = BTreeMap::new();
        seeded.insert(Value::from("k"), Value::from("v"));

        let a = store.open(&name, ContainerValue::Map(seeded)).unwrap();
        let b = store.open(&name, ContainerValue::Map(BTreeMap::new())).unwrap();
        assert_eq!(b.get("k").unwrap(), Value::from("v"));
        assert_eq!(a.size().unwrap(), 1);

        drop(b);
        a.destroy().unwrap();
    }

    #[test]
    fn test_kind_mismatch_on_open() {
        let store = small_store();
        let name = unique("kind");
        let list = store.open(&name, ContainerValue::Sequence(Vec::new())).unwrap();

        let err = store.open(&name, ContainerValue::Set(BTreeSet::new())).unwrap_err();
        assert!(matches!(err, RememoryError::KindMismatch { .. }));

        list.destroy().unwrap();
    }

    #[test]
    fn test_attach_requires_existing() {
        let store = small_store();
        let name = unique("attach");
        let err = store.attach(&name, ContainerKind::Set).unwrap_err();
        assert!(matches!(err, RememoryError::SegmentNotFound(_)));
        assert!(err.is_recoverable());

        let set = store.open(&name, ContainerKind::Set.default_value()).unwrap();
        set.add("x").unwrap();
        let attached = store.attach(&name, ContainerKind::Set).unwrap();
        assert!(attached.contains("x").unwrap());

        drop(attached);
        assert!(store.destroy(&name).unwrap());
        drop(set);
        assert!(!store.destroy(&name).unwrap());
    }

    #[test]
    fn test_growth_followed_by_other_handle() {
        let store = small_store();
        let name = unique("grow");
        let writer = store.open(&name, ContainerKind::Sequence.default_value()).unwrap();
        let reader = store.attach(&name, ContainerKind::Sequence).unwrap();

        for i in 0..500 {
            writer.append(format!("item-{}", i)).unwrap();
        }
        assert!(writer.info().generation > 0);

        assert_eq!(reader.size().unwrap(), 500);
        assert_eq!(reader.info().generation, writer.info().generation);
        assert_eq!(reader.index_get(0).unwrap(), Value::from("item-0"));
        assert_eq!(reader.index_get(499).unwrap(), Value::from("item-499"));

        // The reader can grow it further and the writer follows
        for i in 500..1000 {
            reader.append(format!("item-{}", i)).unwrap();
        }
        let all: Vec<Value> = writer.snapshot_iter().unwrap().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(all[750], Value::from("item-750"));

        drop(reader);
        writer.destroy().unwrap();
    }

    #[test]
    fn test_failed_operation_commits_nothing() {
        let store = small_store();
        let name = unique("atomic");
        let map = store.open(&name, ContainerKind::Map.default_value()).unwrap();
        map.set("a", 1).unwrap();

        let err = map
            .modify(|v| {
                v.set("b".into(), 2.into())?;
                v.delete(&"missing".into())
            })
            .unwrap_err();
        assert!(matches!(err, RememoryError::KeyNotFound(_)));
        assert!(!map.contains("b").unwrap());

        map.destroy().unwrap();
    }

    #[test]
    fn test_scalar_cell() {
        let store = small_store();
        let name = unique("cell");
        let cell = store
            .open(&name, ContainerKind::Scalar(ScalarKind::I32).default_value())
            .unwrap();

        assert_eq!(cell.increment(Scalar::I32(5)).unwrap(), Scalar::I32(5));
        assert_eq!(cell.increment(Scalar::I32(-2)).unwrap(), Scalar::I32(3));
        cell.set_scalar(Scalar::I32(40)).unwrap();
        assert_eq!(cell.get_scalar().unwrap(), Scalar::I32(40));
        assert!(cell.size().is_err());

        cell.destroy().unwrap();
    }

    #[test]
    fn test_lock_timeout_when_held_elsewhere() {
        let store = ContainerStore::new(
            StoreConfig::default().with_lock_timeout(Duration::from_millis(30)),
        );
        let name = unique("timeout");
        let map = store.open(&name, ContainerKind::Map.default_value()).unwrap();

        let mut holder = NamedLock::open(&name).unwrap();
        holder.acquire(Duration::from_secs(1)).unwrap();

        let err = map.set("x", 1).unwrap_err();
        assert!(matches!(err, RememoryError::LockTimeout { .. }));

        holder.release().unwrap();
        map.set("x", 1).unwrap();
        map.destroy().unwrap();
    }

    #[test]
    fn test_nested_call_on_same_handle_fails_fast() {
        let store = ContainerStore::new(
            StoreConfig::default().with_lock_timeout(Duration::from_millis(200)),
        );
        let name = unique("nested");
        let map = Arc::new(store.open(&name, ContainerKind::Map.default_value()).unwrap());

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&map);
        let worker = thread::spawn(move || {
            let result = inner.modify(|_| inner.size());
            let _ = tx.send(result);
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("nested call did not return");
        worker.join().unwrap();
        assert!(matches!(result, Err(RememoryError::LockAlreadyHeld(_))));

        // Neither the handle nor its info are left locked
        let info = map.modify(|v| v.set("x".into(), 1.into()).map(|_| map.info())).unwrap();
        assert_eq!(info.generation, 0);
        assert_eq!(map.get("x").unwrap(), Value::Int(1));

        Arc::try_unwrap(map).unwrap().destroy().unwrap();
    }

    #[test]
    fn test_orphaned_handle_refuses_writes() {
        let store = small_store();
        let name = unique("orphan");
        let old = store.open(&name, ContainerKind::Map.default_value()).unwrap();
        assert!(store.destroy(&name).unwrap());
        let fresh = store.open(&name, ContainerKind::Map.default_value()).unwrap();

        assert!(matches!(old.set("x", 1), Err(RememoryError::SegmentNotFound(_))));
        assert!(matches!(fresh.get("x"), Err(RememoryError::KeyNotFound(_))));

        // Destroying through the orphan leaves the new container alone
        assert!(matches!(old.destroy(), Err(RememoryError::SegmentNotFound(_))));
        fresh.set("y", 2).unwrap();
        assert_eq!(fresh.get("y").unwrap(), Value::Int(2));
        fresh.destroy().unwrap();
    }

    #[test]
    fn test_envelope_carried_over_by_interrupted_grow() {
        let store = small_store();
        let name = unique("carried");
        let map = store.open(&name, ContainerKind::Map.default_value()).unwrap();
        map.set("x", 1).unwrap();

        // Grow without restamping, as if the writer died right after
        let mut segment = SharedSegment::attach(&name).unwrap();
        segment.grow(8192).unwrap();
        drop(segment);

        assert_eq!(map.get("x").unwrap(), Value::Int(1));
        assert_eq!(map.info().generation, 1);

        map.set("y", 2).unwrap();
        let segment = SharedSegment::attach(&name).unwrap();
        let (header, value) = envelope::decode::<ContainerValue>(segment.read())
            .unwrap()
            .unwrap();
        assert_eq!(header.generation, 1);
        assert_eq!(value.len().unwrap(), 2);

        drop(segment);
        map.destroy().unwrap();
    }

    #[test]
    fn test_envelope_from_newer_generation_is_contention() {
        let store = ContainerStore::new(
            StoreConfig::default()
                .with_initial_capacity(128)
                .with_max_attempts(2),
        );
        let name = unique("newer");
        let map = store.open(&name, ContainerKind::Map.default_value()).unwrap();

        let mut segment = SharedSegment::attach(&name).unwrap();
        let stamped = envelope::encode(5, &ContainerKind::Map.default_value()).unwrap();
        segment.write(&stamped).unwrap();

        assert!(matches!(
            map.size(),
            Err(RememoryError::Contention { attempts: 2, .. })
        ));

        drop(segment);
        map.destroy().unwrap();
    }

    #[test]
    fn test_clobbered_magic_is_corruption() {
        let store = small_store();
        let name = unique("clobber");
        let map = store.open(&name, ContainerKind::Map.default_value()).unwrap();
        map.set("x", 1).unwrap();

        let mut segment = SharedSegment::attach(&name).unwrap();
        segment.write(b"JUNK").unwrap();

        assert!(matches!(
            map.get("x"),
            Err(RememoryError::CorruptedEnvelope { .. })
        ));
        assert!(matches!(
            store.attach(&name, ContainerKind::Map),
            Err(RememoryError::CorruptedEnvelope { .. })
        ));
        assert!(map.set("x", 2).is_err());

        drop(segment);
        map.destroy().unwrap();
    }
}
