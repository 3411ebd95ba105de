//! Per-container advisory lock.
//!
//! Lifecycle operations on one container must not interleave (create racing
//! destroy, two destroys racing each other), but operations on different
//! containers must not wait on each other. The lock table maps container ID
//! to an independent mutex, created lazily on first use and kept for the
//! controller's lifetime.
//!
//! Acquisition is try-with-retry rather than blocking: a stuck peer
//! operation (wedged shim call) holds its lock indefinitely, and queueing
//! behind it would wedge every later caller too. After the retry budget the
//! caller gets a lock-contention failure and surfaces it, leaving the stuck
//! operation to its own timeout.
//!
//! Release is by RAII: dropping the returned guard unlocks on every exit
//! path, including panics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Guard holding one container's lock; dropping it releases the lock.
pub type ContainerGuard = OwnedMutexGuard<()>;

/// Table of per-container advisory locks.
pub struct ContainerLock {
    entries: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl ContainerLock {
    /// Creates a lock table with the given acquisition budget and poll
    /// interval.
    pub fn new(acquire_timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            acquire_timeout,
            retry_interval,
        }
    }

    /// Tries to acquire the lock for `id`, polling until the retry budget
    /// is exhausted.
    ///
    /// Returns `None` on contention rather than an error value; the caller
    /// decides how to surface it. The first attempt always runs even with a
    /// zero budget.
    pub async fn try_lock_with_retry(&self, id: &str) -> Option<ContainerGuard> {
        let entry = self.entry(id);
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            match entry.clone().try_lock_owned() {
                Ok(guard) => return Some(guard),
                Err(_) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    fn entry(&self, id: &str) -> Arc<Mutex<()>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            // The map is only touched inside this function; a panic cannot
            // leave an entry half-inserted, so poisoning is recoverable.
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
