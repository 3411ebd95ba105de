//! Client configuration.
//!
//! Every policy value the lifecycle controller applies, from retry budgets
//! and escalation timeouts to well-known paths, lives here so embedding
//! daemons can tune them per instance. Defaults come from
//! [`crate::constants`] and match the values the escalation and recovery
//! ladders were designed around; change them deliberately.

use crate::constants;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::client::Client`].
///
/// Construct with [`ClientConfig::default`] and override individual values
/// with the `with_*` builders:
///
/// ```rust,ignore
/// let config = ClientConfig::default()
///     .with_force_stop_path("/opt/engine/bin/force-stop")
///     .with_reconnect_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total budget for acquiring the per-container lock before the
    /// operation fails with a lock-contention error.
    pub lock_acquire_timeout: Duration,
    /// Poll interval between lock acquisition attempts.
    pub lock_retry_interval: Duration,
    /// Number of task re-attachment attempts during recovery.
    pub recover_attempts: u32,
    /// Per-attempt timeout when re-attaching to a task's shim.
    pub reconnect_timeout: Duration,
    /// Timeout for the external force-stop command.
    pub force_stop_timeout: Duration,
    /// Executable invoked (with the container ID) when signal escalation
    /// fails to bring a task down.
    pub force_stop_path: PathBuf,
    /// Timeout for best-effort cleanup of half-created containers/tasks.
    pub cleanup_timeout: Duration,
    /// Directory under which per-process FIFO directories are created.
    pub fifo_root: PathBuf,
    /// Snapshotter name passed on container creation.
    pub snapshotter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: constants::LOCK_ACQUIRE_TIMEOUT,
            lock_retry_interval: constants::LOCK_RETRY_INTERVAL,
            recover_attempts: constants::RECOVER_ATTEMPTS,
            reconnect_timeout: constants::RECONNECT_TIMEOUT,
            force_stop_timeout: constants::FORCE_STOP_TIMEOUT,
            force_stop_path: PathBuf::from(constants::DEFAULT_FORCE_STOP_PATH),
            cleanup_timeout: constants::CLEANUP_TIMEOUT,
            fifo_root: PathBuf::from(constants::DEFAULT_FIFO_ROOT),
            snapshotter: constants::DEFAULT_SNAPSHOTTER.to_string(),
        }
    }
}

impl ClientConfig {
    /// Sets the per-container lock acquisition budget.
    #[must_use]
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    /// Sets the poll interval between lock acquisition attempts.
    #[must_use]
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Sets the number of task re-attachment attempts during recovery.
    #[must_use]
    pub fn with_recover_attempts(mut self, attempts: u32) -> Self {
        self.recover_attempts = attempts;
        self
    }

    /// Sets the per-attempt shim re-attachment timeout.
    #[must_use]
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Sets the external force-stop command timeout.
    #[must_use]
    pub fn with_force_stop_timeout(mut self, timeout: Duration) -> Self {
        self.force_stop_timeout = timeout;
        self
    }

    /// Sets the external force-stop executable path.
    #[must_use]
    pub fn with_force_stop_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.force_stop_path = path.into();
        self
    }

    /// Sets the best-effort cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Sets the FIFO root directory.
    #[must_use]
    pub fn with_fifo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.fifo_root = root.into();
        self
    }

    /// Sets the snapshotter name used on container creation.
    #[must_use]
    pub fn with_snapshotter(mut self, snapshotter: impl Into<String>) -> Self {
        self.snapshotter = snapshotter.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.recover_attempts, constants::RECOVER_ATTEMPTS);
        assert_eq!(config.reconnect_timeout, constants::RECONNECT_TIMEOUT);
        assert_eq!(config.force_stop_timeout, constants::FORCE_STOP_TIMEOUT);
        assert_eq!(config.cleanup_timeout, constants::CLEANUP_TIMEOUT);
        assert_eq!(config.snapshotter, constants::DEFAULT_SNAPSHOTTER);
    }

    #[test]
    fn test_builders_override_defaults() {
        let config = ClientConfig::default()
            .with_recover_attempts(5)
            .with_reconnect_timeout(Duration::from_secs(1))
            .with_force_stop_path("/opt/engine/bin/force-stop")
            .with_fifo_root("/tmp/fifos");

        assert_eq!(config.recover_attempts, 5);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(1));
        assert_eq!(
            config.force_stop_path,
            PathBuf::from("/opt/engine/bin/force-stop")
        );
        assert_eq!(config.fifo_root, PathBuf::from("/tmp/fifos"));
    }
}
