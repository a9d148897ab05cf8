//! Store configuration

use std::time::Duration;

/// Default size of a newly created data segment (64KB)
const DEFAULT_INITIAL_CAPACITY: usize = 64 * 1024;

/// Default time to wait for a container lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of load attempts before reporting contention
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default cap on the sleep between lock polls
const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration shared by every handle a store opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Size in bytes of the data segment created for a new container
    pub initial_capacity: usize,
    /// How long an operation waits for the container lock
    pub lock_timeout: Duration,
    /// Attempts at loading a consistent generation before giving up
    pub max_attempts: u32,
    /// Longest sleep between two lock polls
    pub lock_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `REMEMORY_INITIAL_CAPACITY`,
    /// `REMEMORY_LOCK_TIMEOUT_MS` and `REMEMORY_MAX_ATTEMPTS`
    ///
    /// Unset, unparsable or out-of-range variables keep their default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(capacity) = env_number("REMEMORY_INITIAL_CAPACITY") {
            match usize::try_from(capacity) {
                Ok(capacity) => config.initial_capacity = capacity,
                Err(_) => tracing::warn!(capacity, "REMEMORY_INITIAL_CAPACITY out of range, ignored"),
            }
        }
        if let Some(ms) = env_number("REMEMORY_LOCK_TIMEOUT_MS") {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_number("REMEMORY_MAX_ATTEMPTS") {
            match u32::try_from(attempts) {
                Ok(attempts) => config.max_attempts = attempts.max(1),
                Err(_) => tracing::warn!(attempts, "REMEMORY_MAX_ATTEMPTS out of range, ignored"),
            }
        }

        config
    }

    /// Set the initial data segment size
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the number of load attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the maximum sleep between lock polls
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var_os(key)?;
    match raw.to_str().and_then(|s| s.trim().parse().ok()) {
        Some(value) => Some(value),
        None => {
            tracing::warn!(key, "ignoring unparsable environment override");
            None
        }
    }
}
