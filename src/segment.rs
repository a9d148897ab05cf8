//! Named, growable shared memory segment
//!
//! A segment is two shared memory objects: a fixed 64 byte control block
//! that records the current generation and capacity, and the data object
//! for that generation. POSIX objects cannot be resized while other
//! processes have them mapped, so growing creates the next generation's
//! object, copies the bytes over, bumps the control block and unlinks the
//! old object. Other handles notice the new generation through
//! [`SharedSegment::is_current`] and [`SharedSegment::reattach`].
//!
//! All methods assume the caller holds the container's named lock.

use crate::error::{RememoryError, Result};
use crate::naming::ObjectNames;
use crate::shm::ShmRegion;

const CONTROL_MAGIC: u32 = 0x524D_4354; // "RMCT"
const CONTROL_VERSION: u32 = 1;

/// Size of the control object in bytes
pub const CONTROL_SIZE: usize = 64;

/// Smallest data object the segment will create
pub const MIN_CAPACITY: usize = 64;

/// Control block stored at the start of the `.ctl` object
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ControlBlock {
    magic: u32,
    version: u32,
    generation: u64,
    capacity: u64,
    _pad: [u8; CONTROL_SIZE - 24],
}

impl ControlBlock {
    fn new(generation: u64, capacity: usize) -> Self {
        Self {
            magic: CONTROL_MAGIC,
            version: CONTROL_VERSION,
            generation,
            capacity: capacity as u64,
            _pad: [0; CONTROL_SIZE - 24],
        }
    }

    fn load(region: &ShmRegion) -> Self {
        debug_assert!(region.size() >= CONTROL_SIZE);
        // SAFETY: the control object is at least CONTROL_SIZE bytes and the
        // named lock keeps writers out while we read
        unsafe { std::ptr::read_unaligned(region.as_slice().as_ptr().cast::<ControlBlock>()) }
    }

    fn store(&self, region: &mut ShmRegion) {
        debug_assert!(region.size() >= CONTROL_SIZE);
        unsafe {
            std::ptr::write_unaligned(region.as_mut_slice().as_mut_ptr().cast::<ControlBlock>(), *self)
        }
    }

    fn is_blank(&self) -> bool {
        self.magic == 0 && self.version == 0 && self.generation == 0 && self.capacity == 0
    }
}

/// Snapshot of a segment's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub generation: u64,
    pub capacity: usize,
}

/// Handle to a named shared memory segment
pub struct SharedSegment {
    names: ObjectNames,
    control: ShmRegion,
    data: ShmRegion,
    generation: u64,
    created: bool,
}

impl SharedSegment {
    /// Attach to the segment called `name`, creating it with `initial_size`
    /// zeroed bytes if it does not exist
    ///
    /// An existing segment is attached as-is, whatever its size.
    pub fn create_or_attach(name: &str, initial_size: usize) -> Result<Self> {
        Self::create_or_attach_names(ObjectNames::new(name)?, initial_size)
    }

    /// Attach to an existing segment without creating one
    pub fn attach(name: &str) -> Result<Self> {
        Self::attach_names(ObjectNames::new(name)?)
    }

    pub(crate) fn create_or_attach_names(names: ObjectNames, initial_size: usize) -> Result<Self> {
        let size = initial_size.max(MIN_CAPACITY);

        match ShmRegion::create(&names.control(), CONTROL_SIZE)? {
            Some(mut control) => {
                let data = create_data(&names, 0, size)?;
                ControlBlock::new(0, size).store(&mut control);
                tracing::debug!(name = names.name(), capacity = size, "segment created");
                Ok(Self {
                    names,
                    control,
                    data,
                    generation: 0,
                    created: true,
                })
            }
            None => Self::attach_control(names, Some(size)),
        }
    }

    pub(crate) fn attach_names(names: ObjectNames) -> Result<Self> {
        Self::attach_control(names, None)
    }

    fn attach_control(names: ObjectNames, repair_size: Option<usize>) -> Result<Self> {
        let mut control = ShmRegion::open(&names.control())?
            .ok_or_else(|| RememoryError::SegmentNotFound(names.name().to_string()))?;
        let mut block = ControlBlock::load(&control);
        let mut created = false;

        if block.is_blank() {
            // The creator died between creating the control object and
            // initializing it
            let Some(size) = repair_size else {
                return Err(RememoryError::SegmentNotFound(names.name().to_string()));
            };
            tracing::warn!(name = names.name(), "reinitializing blank control block");
            block = ControlBlock::new(0, size);
            let data = create_data(&names, 0, size)?;
            block.store(&mut control);
            return Ok(Self {
                names,
                control,
                data,
                generation: 0,
                created: true,
            });
        }

        if block.magic != CONTROL_MAGIC {
            return Err(RememoryError::corrupted(format!(
                "control block magic 0x{:08X}, expected 0x{:08X}",
                block.magic, CONTROL_MAGIC
            )));
        }
        if block.version != CONTROL_VERSION {
            return Err(RememoryError::corrupted(format!(
                "control block version {}, expected {}",
                block.version, CONTROL_VERSION
            )));
        }

        let data = match ShmRegion::open(&names.segment(block.generation))? {
            Some(data) => data,
            None => {
                tracing::warn!(
                    name = names.name(),
                    generation = block.generation,
                    "data object missing, recreating"
                );
                created = true;
                create_data(&names, block.generation, block.capacity as usize)?
            }
        };

        tracing::debug!(
            name = names.name(),
            generation = block.generation,
            capacity = data.size(),
            "segment attached"
        );
        Ok(Self {
            names,
            control,
            data,
            generation: block.generation,
            created,
        })
    }

    /// Logical container name
    #[inline]
    pub fn name(&self) -> &str {
        self.names.name()
    }

    /// Generation this handle is mapped to
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes available in the mapped data object
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.size()
    }

    /// Whether this handle created the data object it is mapped to
    #[inline]
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            name: self.name().to_string(),
            generation: self.generation,
            capacity: self.capacity(),
        }
    }

    /// Whether the segment was destroyed under this handle
    ///
    /// A destroyed segment's control object has no name anymore, so a later
    /// `create_or_attach` of the same name builds an unrelated segment.
    pub fn is_orphaned(&self) -> Result<bool> {
        self.control.is_unlinked()
    }

    /// Fail with [`RememoryError::SegmentNotFound`] once orphaned
    pub fn ensure_linked(&self) -> Result<()> {
        if self.is_orphaned()? {
            tracing::debug!(name = self.name(), "segment was destroyed under this handle");
            return Err(RememoryError::SegmentNotFound(self.name().to_string()));
        }
        Ok(())
    }

    /// Whether the control block still points at our generation
    pub fn is_current(&self) -> bool {
        ControlBlock::load(&self.control).generation == self.generation
    }

    /// Remap whatever generation the control block names
    pub fn reattach(&mut self) -> Result<()> {
        let block = ControlBlock::load(&self.control);
        let data = ShmRegion::open(&self.names.segment(block.generation))?
            .ok_or_else(|| RememoryError::SegmentNotFound(self.name().to_string()))?;

        tracing::debug!(
            name = self.name(),
            from = self.generation,
            to = block.generation,
            "segment reattached"
        );
        self.data = data;
        self.generation = block.generation;
        self.created = false;
        Ok(())
    }

    /// The full data object, `capacity()` bytes long
    #[inline]
    pub fn read(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Copy `bytes` to the start of the data object
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let capacity = self.capacity();
        if bytes.len() > capacity {
            return Err(RememoryError::BufferOverflow {
                max: capacity,
                got: bytes.len(),
            });
        }
        self.data.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Replace the data object with a larger one of the next generation
    ///
    /// The current bytes are copied to the front of the new object. Growing
    /// to a capacity not larger than the current one does nothing.
    pub fn grow(&mut self, new_capacity: usize) -> Result<()> {
        let old_capacity = self.capacity();
        if new_capacity <= old_capacity {
            return Ok(());
        }

        let next = self.generation + 1;
        let mut fresh = create_data(&self.names, next, new_capacity)?;
        fresh.as_mut_slice()[..old_capacity].copy_from_slice(self.data.as_slice());

        ControlBlock::new(next, new_capacity).store(&mut self.control);

        let old = std::mem::replace(&mut self.data, fresh);
        self.generation = next;
        if let Err(err) = ShmRegion::unlink(old.os_name()) {
            tracing::warn!("unlinking superseded segment failed: {}", err);
        }

        tracing::debug!(
            name = self.name(),
            from = old_capacity,
            to = new_capacity,
            generation = next,
            "segment grown"
        );
        Ok(())
    }

    /// Unlink the data and control objects
    ///
    /// Existing mappings in other processes stay readable but are orphaned.
    pub fn destroy(self) -> Result<()> {
        ShmRegion::unlink(self.data.os_name())?;
        ShmRegion::unlink(self.control.os_name())?;
        tracing::debug!(name = self.name(), "segment destroyed");
        Ok(())
    }
}

fn create_data(names: &ObjectNames, generation: u64, size: usize) -> Result<ShmRegion> {
    let os_name = names.segment(generation);
    if let Some(region) = ShmRegion::create(&os_name, size)? {
        return Ok(region);
    }

    // Left behind by a grow that died before updating the control block
    tracing::warn!(name = names.name(), generation, "replacing leftover data object");
    ShmRegion::unlink(&os_name)?;
    ShmRegion::create(&os_name, size)?.ok_or_else(|| RememoryError::ShmCreate {
        name: os_name,
        source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("segtest_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_then_attach() {
        let name = unique("attach");
        let mut a = SharedSegment::create_or_attach(&name, 128).unwrap();
        assert!(a.was_created());
        assert_eq!(a.capacity(), 128);
        assert!(a.read().iter().all(|&b| b == 0));

        a.write(b"hello").unwrap();

        // Initial size is ignored when attaching
        let b = SharedSegment::create_or_attach(&name, 4096).unwrap();
        assert!(!b.was_created());
        assert_eq!(b.capacity(), 128);
        assert_eq!(&b.read()[..5], b"hello");

        a.destroy().unwrap();
    }

    #[test]
    fn test_attach_missing() {
        let err = SharedSegment::attach(&unique("missing")).err().unwrap();
        assert!(matches!(err, RememoryError::SegmentNotFound(_)));
    }

    #[test]
    fn test_write_past_capacity() {
        let name = unique("overflow");
        let mut seg = SharedSegment::create_or_attach(&name, 64).unwrap();
        let err = seg.write(&[1u8; 65]).unwrap_err();
        assert!(matches!(err, RememoryError::BufferOverflow { max: 64, got: 65 }));
        seg.destroy().unwrap();
    }

    #[test]
    fn test_blank_control_block_is_repaired() {
        let name = unique("blank");
        let names = ObjectNames::new(&name).unwrap();
        // A creator that died right after creating the control object
        let _control = ShmRegion::create(&names.control(), CONTROL_SIZE)
            .unwrap()
            .unwrap();

        let err = SharedSegment::attach(&name).err().unwrap();
        assert!(matches!(err, RememoryError::SegmentNotFound(_)));

        let seg = SharedSegment::create_or_attach(&name, 256).unwrap();
        assert!(seg.was_created());
        assert_eq!(seg.generation(), 0);
        assert_eq!(seg.capacity(), 256);

        let again = SharedSegment::attach(&name).unwrap();
        assert!(!again.was_created());
        assert_eq!(again.capacity(), 256);
        seg.destroy().unwrap();
    }

    #[test]
    fn test_missing_data_object_is_recreated() {
        let name = unique("nodata");
        let names = ObjectNames::new(&name).unwrap();
        let mut a = SharedSegment::create_or_attach(&name, 128).unwrap();
        a.write(b"lost").unwrap();
        assert!(ShmRegion::unlink(&names.segment(0)).unwrap());

        let b = SharedSegment::attach(&name).unwrap();
        assert!(b.was_created());
        assert_eq!(b.generation(), 0);
        assert_eq!(b.capacity(), 128);
        assert!(b.read().iter().all(|&x| x == 0));

        drop(a);
        b.destroy().unwrap();
    }

    #[test]
    fn test_grow_replaces_leftover_next_generation() {
        let name = unique("leftover");
        let names = ObjectNames::new(&name).unwrap();
        let mut a = SharedSegment::create_or_attach(&name, 64).unwrap();
        a.write(b"keep").unwrap();

        // A grow that died before updating the control block
        let mut leftover = ShmRegion::create(&names.segment(1), 64).unwrap().unwrap();
        leftover.as_mut_slice().fill(0xAB);

        a.grow(4096).unwrap();
        assert_eq!(a.generation(), 1);
        assert_eq!(a.capacity(), 4096);
        assert_eq!(&a.read()[..4], b"keep");
        assert!(a.read()[64..].iter().all(|&x| x == 0));

        drop(leftover);
        a.destroy().unwrap();
    }

    #[test]
    fn test_destroy_orphans_other_handles() {
        let name = unique("orphan");
        let a = SharedSegment::create_or_attach(&name, 64).unwrap();
        let b = SharedSegment::attach(&name).unwrap();
        assert!(!b.is_orphaned().unwrap());
        b.ensure_linked().unwrap();

        a.destroy().unwrap();
        assert!(b.is_orphaned().unwrap());
        assert!(matches!(
            b.ensure_linked(),
            Err(RememoryError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_grow_keeps_bytes_and_bumps_generation() {
        let name = unique("grow");
        let mut a = SharedSegment::create_or_attach(&name, 64).unwrap();
        let mut b = SharedSegment::attach(&name).unwrap();
        a.write(b"before grow").unwrap();

        a.grow(4096).unwrap();
        assert_eq!(a.generation(), 1);
        assert_eq!(a.capacity(), 4096);
        assert_eq!(&a.read()[..11], b"before grow");

        assert!(!b.is_current());
        b.reattach().unwrap();
        assert!(b.is_current());
        assert_eq!(b.capacity(), 4096);
        assert_eq!(&b.read()[..11], b"before grow");

        // The old generation is gone
        assert!(ShmRegion::open(&format!("/rememory_{}.g0", name))
            .unwrap()
            .is_none());

        a.grow(1024).unwrap();
        assert_eq!(a.generation(), 1);

        a.destroy().unwrap();
    }
}
