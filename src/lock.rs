//! Cross-process named lock
//!
//! The lock object is a zero-length POSIX shared memory object named
//! `/rememory_<name>.lock`. Exclusion is an exclusive `flock` on its
//! descriptor, so any process that opens the same name contends for the
//! same lock.
//!
//! The kernel drops a `flock` when the last descriptor of the holder's open
//! file description closes, so a holder that crashes releases the lock. A
//! holder that hangs, or that leaked the descriptor into a long-lived child,
//! does not. [`NamedLock::force_clear_stale_lock`] is the escape hatch for
//! that case.

use crate::error::{RememoryError, Result};
use crate::naming::ObjectNames;
use crate::shm::shm_mode;
use rustix::fd::OwnedFd;
use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;
use rustix::shm::{shm_open, shm_unlink, ShmOFlags};
use std::time::{Duration, Instant};

/// First sleep between failed lock attempts
const INITIAL_BACKOFF: Duration = Duration::from_micros(20);

/// Named mutual exclusion across independent processes
///
/// Not reentrant: acquiring twice without a release is reported as
/// [`RememoryError::LockAlreadyHeld`].
pub struct NamedLock {
    name: String,
    os_name: String,
    fd: OwnedFd,
    held: bool,
    max_backoff: Duration,
}

impl NamedLock {
    /// Create or open the lock for a container name
    ///
    /// Creation is a single `O_CREAT` open, so racing creators all end up on
    /// the same object.
    pub fn open(name: &str) -> Result<Self> {
        let names = ObjectNames::new(name)?;
        Self::open_names(&names)
    }

    pub(crate) fn open_names(names: &ObjectNames) -> Result<Self> {
        let os_name = names.lock();
        let fd = shm_open(
            os_name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::RDWR,
            shm_mode(),
        )
        .map_err(|e| RememoryError::ShmCreate {
            name: os_name.clone(),
            source: e.into(),
        })?;

        Ok(Self {
            name: names.name().to_string(),
            os_name,
            fd,
            held: false,
            max_backoff: Duration::from_millis(1),
        })
    }

    /// Cap the sleep between polls while waiting
    pub fn set_max_backoff(&mut self, max_backoff: Duration) {
        self.max_backoff = max_backoff.max(INITIAL_BACKOFF);
    }

    /// Container name this lock guards
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Acquire the lock, waiting at most `timeout`
    ///
    /// On timeout nothing is held and [`RememoryError::LockTimeout`] is
    /// returned.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        if self.held {
            return Err(RememoryError::LockAlreadyHeld(self.name.clone()));
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match flock(&self.fd, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => {
                    self.held = true;
                    return Ok(());
                }
                Err(Errno::WOULDBLOCK) => {}
                Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(RememoryError::Lock {
                        name: self.name.clone(),
                        source: e.into(),
                    })
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(name = %self.name, ?timeout, "lock acquire timed out");
                return Err(RememoryError::LockTimeout {
                    name: self.name.clone(),
                    timeout,
                });
            }

            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Acquire and return a guard that releases on drop
    pub fn lock(&mut self, timeout: Duration) -> Result<LockGuard<'_>> {
        self.acquire(timeout)?;
        Ok(LockGuard { lock: self })
    }

    /// Release a lock taken with [`acquire`](Self::acquire)
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(RememoryError::LockNotHeld(self.name.clone()));
        }

        flock(&self.fd, FlockOperation::Unlock).map_err(|e| RememoryError::Lock {
            name: self.name.clone(),
            source: e.into(),
        })?;
        self.held = false;
        Ok(())
    }

    /// Remove the OS-visible lock object
    ///
    /// Only call this once no process needs the lock anymore; later openers
    /// would create a fresh, unrelated lock. If held, the name is removed
    /// before the lock is released, so a waiter on the old object never runs
    /// alongside a holder of a new one that it could not see.
    pub fn destroy(mut self) -> Result<()> {
        let unlinked = unlink_lock(&self.os_name);
        if self.held {
            self.release()?;
        }
        unlinked?;
        tracing::debug!(name = %self.name, "lock destroyed");
        Ok(())
    }

    /// Unlink the lock object of `name` regardless of who holds it
    ///
    /// Processes that open the name afterwards get a fresh, unlocked object.
    ///
    /// # Safety caveat
    /// A process that still holds the old object keeps running its critical
    /// section and may write concurrently with a new holder. Use this only
    /// when the holder is known to be gone or wedged for good.
    pub fn force_clear_stale_lock(name: &str) -> Result<bool> {
        let names = ObjectNames::new(name)?;
        let removed = unlink_lock(&names.lock())?;
        if removed {
            tracing::warn!(name, "stale lock forcibly cleared");
        }
        Ok(removed)
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = self.release() {
                tracing::warn!("lock release on drop failed: {}", err);
            }
        }
    }
}

fn unlink_lock(os_name: &str) -> Result<bool> {
    match shm_unlink(os_name) {
        Ok(()) => Ok(true),
        Err(Errno::NOENT) => Ok(false),
        Err(e) => Err(RememoryError::Unlink {
            name: os_name.to_string(),
            source: e.into(),
        }),
    }
}

/// Releases the lock when dropped
pub struct LockGuard<'a> {
    lock: &'a mut NamedLock,
}

impl LockGuard<'_> {
    /// Release now and surface any error
    pub fn unlock(self) -> Result<()> {
        let mut this = std::mem::ManuallyDrop::new(self);
        this.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::warn!("lock release failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn unique(tag: &str) -> String {
        format!("locktest_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_exclusion_between_handles() {
        let name = unique("excl");
        let mut a = NamedLock::open(&name).unwrap();
        let mut b = NamedLock::open(&name).unwrap();

        a.acquire(Duration::from_secs(1)).unwrap();
        let err = b.acquire(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, RememoryError::LockTimeout { .. }));
        assert!(!b.is_held());

        a.release().unwrap();
        b.acquire(Duration::from_secs(1)).unwrap();
        b.release().unwrap();

        a.destroy().unwrap();
        drop(b);
    }

    #[test]
    fn test_not_reentrant() {
        let name = unique("reentrant");
        let mut lock = NamedLock::open(&name).unwrap();
        lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            lock.acquire(Duration::from_secs(1)),
            Err(RememoryError::LockAlreadyHeld(_))
        ));
        lock.release().unwrap();
        assert!(matches!(lock.release(), Err(RememoryError::LockNotHeld(_))));
        lock.destroy().unwrap();
    }

    #[test]
    fn test_destroy_unlinks_before_release() {
        let name = unique("destroy");
        let mut holder = NamedLock::open(&name).unwrap();
        let mut waiter = NamedLock::open(&name).unwrap();
        holder.acquire(Duration::from_secs(1)).unwrap();

        let names = ObjectNames::new(&name).unwrap();
        let worker = std::thread::spawn(move || {
            waiter.acquire(Duration::from_secs(5)).unwrap();
            // By the time the old lock is free its name is already gone
            let gone = shm_open(names.lock().as_str(), ShmOFlags::RDWR, shm_mode()).is_err();
            waiter.release().unwrap();
            gone
        });

        std::thread::sleep(Duration::from_millis(50));
        holder.destroy().unwrap();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let name = unique("guard");
        let mut a = NamedLock::open(&name).unwrap();
        let mut b = NamedLock::open(&name).unwrap();
        {
            let _guard = a.lock(Duration::from_secs(1)).unwrap();
            assert!(b.acquire(Duration::from_millis(10)).is_err());
        }
        b.acquire(Duration::from_millis(100)).unwrap();
        b.release().unwrap();
        a.destroy().unwrap();
    }

    #[test]
    fn test_threads_with_separate_handles() {
        let name = unique("threads");
        let inside = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let mut lock = NamedLock::open(&name).unwrap();
                    for _ in 0..50 {
                        let guard = lock.lock(Duration::from_secs(5)).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.unlock().unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(NamedLock::force_clear_stale_lock(&name).unwrap());
    }
}
