//! # Task Lifecycle Constants
//!
//! Defines the policy timeouts, retry budgets, and well-known names for the
//! task lifecycle layer. These constants are the **single source of truth**
//! for the default values carried by [`crate::config::ClientConfig`].
//!
//! ## Modification Guidelines
//!
//! Every timeout here bounds an interaction with a remote shim that can hang
//! indefinitely. Before modifying any constant:
//! 1. Consider the interaction with its neighbours (e.g. a recover attempt is
//!    `RECOVER_ATTEMPTS × RECONNECT_TIMEOUT` in the worst case)
//! 2. Update dependent tests and documentation
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Exposes these defaults as per-client configuration
//! - [`crate::client`]: Applies them to destroy/recover/cleanup paths
//! - [`crate::stdio`]: Uses FIFO names and identifier validation

use std::time::Duration;

// =============================================================================
// Retry Budgets & Timeouts
// =============================================================================
//
// All remote shim interactions MUST be bounded. A shim that stops answering
// keeps its container alive; these budgets decide how long the controller
// argues with it before escalating.
// =============================================================================

/// Number of task re-attachment attempts during recovery.
///
/// **Rationale**: Re-attaching to a healthy shim completes well under a
/// second. Three attempts absorb a shim that is briefly busy after a daemon
/// restart without stalling recovery of the remaining containers.
pub const RECOVER_ATTEMPTS: u32 = 3;

/// Per-attempt timeout when re-attaching to a task's shim (3 seconds).
///
/// **Rationale**: Each recovery attempt runs as an independent cancellable
/// unit bounded by this value, so a wedged shim costs at most
/// `RECOVER_ATTEMPTS × RECONNECT_TIMEOUT` before the container is declared
/// unrecoverable.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the external force-stop command (60 seconds).
///
/// **Rationale**: The force-stop path is the last rung of the escalation
/// ladder; by the time it runs, both terminate and kill signals have failed.
/// Sixty seconds covers a loaded host tearing down a large process group.
pub const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for best-effort cleanup of half-created containers and tasks
/// (100 seconds).
///
/// **Rationale**: Rollback deletes run after a create already failed; they
/// must not hang the create path forever, but aborting them early leaks
/// remote metadata. 100s is deliberately generous.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(100);

/// Total budget for acquiring the per-container lock (10 seconds).
///
/// **Rationale**: Lock acquisition retries rather than blocks so a stuck
/// peer operation cannot wedge every subsequent caller; after this window
/// the operation fails with a lock-contention error instead of queueing.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval between lock acquisition attempts (10 milliseconds).
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Well-Known Paths
// =============================================================================

/// Default executable invoked when signal escalation fails.
///
/// Receives the container ID as its single argument and must guarantee the
/// underlying process group is gone before exiting zero.
pub const DEFAULT_FORCE_STOP_PATH: &str = "/usr/libexec/magiktask/force-stop";

/// Default directory under which per-process FIFO directories are created.
pub const DEFAULT_FIFO_ROOT: &str = "/run/magiktask/fifo";

/// Base directory for each runtime's state.
pub const RUNTIME_ROOT: &str = "/run";

/// Default snapshotter name passed on container creation.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

// =============================================================================
// Runtime Kinds
// =============================================================================
//
// Shim names understood by the backend. The kind travels opaquely through
// this crate; these constants exist so callers and tests spell them once.
// =============================================================================

/// Runtime kind for the legacy shim v1 interface.
pub const RUNTIME_TYPE_V1: &str = "io.containerd.runtime.v1.linux";

/// Runtime kind for the runc shim implementing the shim v2 API.
pub const RUNTIME_TYPE_RUNC_V1: &str = "io.containerd.runc.v1";

/// Runtime kind for the gVisor shim implementing the shim v2 API.
pub const RUNTIME_TYPE_RUNSC_V1: &str = "io.containerd.runsc.v1";

/// Runtime kind for the kata shim implementing the shim v2 API.
pub const RUNTIME_TYPE_KATA_V2: &str = "io.containerd.kata.v2";

// =============================================================================
// FIFO Names
// =============================================================================

/// File name of the stdin FIFO inside a process's FIFO directory.
pub const STDIN_FIFO: &str = "stdin";

/// File name of the stdout FIFO inside a process's FIFO directory.
pub const STDOUT_FIFO: &str = "stdout";

/// File name of the stderr FIFO inside a process's FIFO directory.
///
/// Not created when the process owns a terminal (stderr is merged into the
/// terminal stream).
pub const STDERR_FIFO: &str = "stderr";

// =============================================================================
// Identifier Validation
// =============================================================================

/// Valid characters for container and exec identifiers.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when identifiers are used in FIFO directory paths.
pub const IDENTIFIER_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container/exec identifier length.
///
/// **Rationale**: 128 characters accommodates UUIDs and descriptive names
/// while keeping FIFO paths well under `PATH_MAX`.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validates a container or exec identifier for safety.
///
/// # Security
///
/// Identifiers end up in filesystem paths (FIFO directories) and in the
/// arguments of the external force-stop command, so they must be:
/// - Non-empty
/// - No longer than `MAX_IDENTIFIER_LEN`
/// - Composed only of characters from `IDENTIFIER_VALID_CHARS`
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before the identifier is used in a path"]
pub fn validate_identifier(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("identifier cannot be empty");
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err("identifier exceeds maximum length");
    }
    if !id.chars().all(|c| IDENTIFIER_VALID_CHARS.contains(c)) {
        return Err("identifier contains invalid characters");
    }
    Ok(())
}
