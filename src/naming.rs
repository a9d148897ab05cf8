//! Mapping from container names to OS object names
//!
//! Every container name owns three kinds of shared-memory objects:
//!
//! - `/rememory_<name>.ctl`: control block with the current generation
//! - `/rememory_<name>.lock`: object the named lock is taken on
//! - `/rememory_<name>.g<N>`: data segment for generation `N`
//!
//! Names may only contain `[A-Za-z0-9_-]`, so the `.` suffixes can never
//! collide with another container's objects.

use crate::error::{RememoryError, Result};

const SHM_PREFIX: &str = "/rememory_";

/// Longest accepted container name. Leaves room for the prefix and the
/// longest generation suffix inside the 255 byte POSIX limit.
pub const MAX_NAME_LEN: usize = 200;

/// Check that `name` is usable as a container name.
pub fn validate(name: &str) -> Result<()> {
    let invalid = |reason| RememoryError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 200 bytes"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(invalid("only ASCII letters, digits, '_' and '-' are allowed"));
    }
    Ok(())
}

/// OS object names derived from one container name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    name: String,
    base: String,
}

impl ObjectNames {
    pub fn new(name: &str) -> Result<Self> {
        validate(name)?;
        Ok(Self {
            name: name.to_string(),
            base: format!("{}{}", SHM_PREFIX, name),
        })
    }

    /// The logical container name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> String {
        format!("{}.ctl", self.base)
    }

    pub fn lock(&self) -> String {
        format!("{}.lock", self.base)
    }

    pub fn segment(&self, generation: u64) -> String {
        format!("{}.g{}", self.base, generation)
    }
}
