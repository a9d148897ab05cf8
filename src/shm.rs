//! Low-level POSIX shared memory operations

use crate::error::{RememoryError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;

/// Permissions for every object the crate creates
pub(crate) fn shm_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP
}

/// One mapped POSIX shared memory object
pub struct ShmRegion {
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    os_name: String,
}

// SAFETY: the mapping stays valid for the lifetime of the region and every
// access to its bytes goes through `&self`/`&mut self`
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new shared memory object exclusively
    ///
    /// Returns `Ok(None)` if an object with that name already exists.
    pub fn create(os_name: &str, size: usize) -> Result<Option<Self>> {
        let fd = match shm_open(
            os_name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            shm_mode(),
        ) {
            Ok(fd) => fd,
            Err(Errno::EXIST) => return Ok(None),
            Err(e) => {
                return Err(RememoryError::ShmCreate {
                    name: os_name.to_string(),
                    source: e.into(),
                })
            }
        };

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(os_name);
            return Err(RememoryError::Truncate(e.into()));
        }

        let region = match Self::map(fd, size, os_name) {
            Ok(region) => region,
            Err(e) => {
                let _ = shm_unlink(os_name);
                return Err(e);
            }
        };

        // A fresh object reads as a blank envelope
        unsafe {
            std::ptr::write_bytes(region.addr.as_ptr(), 0, size);
        }

        Ok(Some(region))
    }

    /// Open an existing shared memory object at its current size
    ///
    /// Returns `Ok(None)` if no object with that name exists.
    pub fn open(os_name: &str) -> Result<Option<Self>> {
        let fd = match shm_open(os_name, ShmOFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => return Ok(None),
            Err(e) => {
                return Err(RememoryError::ShmOpen {
                    name: os_name.to_string(),
                    source: e.into(),
                })
            }
        };

        // Map whatever size the creator chose
        let stat = rustix::fs::fstat(&fd).map_err(|e| RememoryError::ShmOpen {
            name: os_name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;

        Self::map(fd, size, os_name).map(Some)
    }

    /// Remove the object name; existing mappings stay valid
    ///
    /// Returns `false` if the object was already gone.
    pub fn unlink(os_name: &str) -> Result<bool> {
        match shm_unlink(os_name) {
            Ok(()) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(RememoryError::Unlink {
                name: os_name.to_string(),
                source: e.into(),
            }),
        }
    }

    fn map(fd: OwnedFd, size: usize, os_name: &str) -> Result<Self> {
        if size == 0 {
            return Err(RememoryError::ShmOpen {
                name: os_name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "object has zero size"),
            });
        }

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| RememoryError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            RememoryError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })?;

        Ok(Self {
            fd,
            addr,
            size,
            os_name: os_name.to_string(),
        })
    }

    /// View the mapped bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.size) }
    }

    /// Mutable view of the mapped bytes
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.size) }
    }

    /// Mapped length in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the object's name has been removed since it was mapped
    pub fn is_unlinked(&self) -> Result<bool> {
        let stat = rustix::fs::fstat(&self.fd).map_err(|e| RememoryError::ShmOpen {
            name: self.os_name.clone(),
            source: e.into(),
        })?;
        Ok(stat.st_nlink == 0)
    }

    /// Name the object was opened under
    #[inline(always)]
    pub fn os_name(&self) -> &str {
        &self.os_name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap only; unlinking is always explicit
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/rememory_test_shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create");
        let size = 4096;

        let mut shm1 = ShmRegion::create(&name, size).unwrap().unwrap();
        assert_eq!(shm1.size(), size);
        assert!(shm1.as_slice().iter().all(|&b| b == 0));

        shm1.as_mut_slice()[0] = 42;

        // A second mapping of the same object
        let shm2 = ShmRegion::open(&name).unwrap().unwrap();
        assert_eq!(shm2.size(), size);
        assert_eq!(shm2.as_slice()[0], 42);

        // A second exclusive create reports the existing object
        assert!(ShmRegion::create(&name, size).unwrap().is_none());

        assert!(!shm2.is_unlinked().unwrap());
        assert!(ShmRegion::unlink(&name).unwrap());
        assert!(!ShmRegion::unlink(&name).unwrap());
        assert!(shm2.is_unlinked().unwrap());

        // Mappings outlive the name
        assert_eq!(shm2.as_slice()[0], 42);
    }

    #[test]
    fn test_open_missing() {
        assert!(ShmRegion::open(&unique("missing")).unwrap().is_none());
    }
}
