//! Remote runtime backend traits.
//!
//! The lifecycle controller never talks RPC itself; it drives a family of
//! handle traits that mirror the backend's object model:
//!
//! ```text
//! TaskBackend ──session()──► BackendSession
//!                                │ create_container / load_container
//!                                ▼
//!                          RemoteContainer ──new_task / attach_task──► RemoteTask
//!                                                                        │ exec
//!                                                                        ▼
//!                                                                  RemoteProcess
//! ```
//!
//! Transport, dialing and reconnection live behind [`TaskBackend`]; the
//! controller only ever asks for "the current session". Every async method
//! is a cancellable future; callers bound the blocking ones with
//! `tokio::time::timeout`.
//!
//! # Not-Found Contract
//!
//! Any call may fail because the entity is already gone. Implementations
//! MUST report that condition as [`crate::Error::NotFound`] (and nothing
//! else), because the escalation and cleanup paths branch on
//! [`crate::Error::is_not_found`] to tell "already exited" apart from
//! "backend is broken".

use crate::error::Result;
use crate::stdio::FifoSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

// =============================================================================
// Exit Status
// =============================================================================

/// Raw terminal state of a task or process, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Process exit code.
    pub code: u32,
    /// When the process exited.
    pub exited_at: DateTime<Utc>,
}

impl ExitStatus {
    /// Creates an exit status stamped with the current time.
    pub fn new(code: u32) -> Self {
        Self {
            code,
            exited_at: Utc::now(),
        }
    }
}

/// One-shot source of a task's or process's terminal status.
///
/// The backend resolves it exactly once when the process ends. A dropped
/// sender (connection torn down before the exit was observed) surfaces to
/// the exit monitor as a backend failure, not as a clean exit.
pub type ExitSource = oneshot::Receiver<ExitStatus>;

// =============================================================================
// Task State
// =============================================================================

/// Backend-reported task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// State could not be determined.
    Unknown,
    /// Task has been created but not started.
    Created,
    /// Task is running.
    Running,
    /// Task has stopped.
    Stopped,
    /// Task is paused.
    Paused,
    /// Task is in the middle of pausing.
    Pausing,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Pausing => write!(f, "pausing"),
        }
    }
}

/// Full status response for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Current state.
    pub state: TaskState,
    /// Exit code, meaningful once `state` is [`TaskState::Stopped`].
    pub exit_status: u32,
    /// Exit timestamp, if the task has exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// Status for a task in the given state with no exit information.
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            exit_status: 0,
            exited_at: None,
        }
    }
}

// =============================================================================
// Metrics / PIDs
// =============================================================================

/// One stats sample for a task.
///
/// `data` is the backend's native metrics payload, passed through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Container the sample belongs to.
    pub id: String,
    /// Backend-native metrics document.
    pub data: serde_json::Value,
}

/// One process inside a task, as reported by the pids query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// OS process ID.
    pub pid: u32,
    /// Backend-specific details (command line, exec ID, ...), opaque here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

// =============================================================================
// Resources
// =============================================================================

/// Cgroup resource settings for the update operation.
///
/// Unset fields leave the corresponding backend value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU shares (relative weight).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    /// CPU CFS quota in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    /// CPU CFS period in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_period: Option<u64>,
    /// CPUs the task may run on, list syntax (`0-3,7`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,
    /// Memory nodes the task may use, list syntax.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_mems: Option<String>,
    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<i64>,
    /// Memory+swap limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<i64>,
    /// Maximum number of PIDs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to deliver to a task or exec process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Hup => 1,
            Self::Int => 2,
            Self::Usr1 => 10,
            Self::Usr2 => 12,
        }
    }

    /// Parses from a signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Create / Exec Options
// =============================================================================

/// Runtime shim selection for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Shim name, e.g. [`crate::constants::RUNTIME_TYPE_RUNC_V1`].
    pub kind: String,
    /// Shim-specific options, passed through opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Where a new container's root filesystem comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RootFs {
    /// A prepared snapshot, referenced by ID.
    Snapshot(String),
    /// A caller-managed directory (container taken over, not created, by
    /// this engine).
    Provided(PathBuf),
}

/// Assembled options for creating a remote container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Container ID.
    pub id: String,
    /// Labels stored on the container record.
    pub labels: HashMap<String, String>,
    /// Shim selection.
    pub runtime: RuntimeSpec,
    /// Snapshotter handling the rootfs snapshot.
    pub snapshotter: String,
    /// Root filesystem source.
    pub rootfs: RootFs,
    /// OCI runtime spec document, opaque to this crate.
    pub spec: serde_json::Value,
}

/// Options for creating a task inside an existing container record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Restore the task from this checkpoint directory instead of starting
    /// fresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

/// Spec for an exec'd process, mirroring the OCI process document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    /// Command and arguments.
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Allocate a terminal for the process.
    #[serde(default)]
    pub terminal: bool,
}

/// Options for checkpointing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOptions {
    /// Directory the checkpoint image is written to.
    pub checkpoint_dir: PathBuf,
    /// Stop the task once the checkpoint is written.
    pub exit: bool,
}

// =============================================================================
// Backend Traits
// =============================================================================

/// Source of connected backend sessions.
///
/// One session corresponds to one live connection to the runtime backend.
/// Implementations own dialing, health checking and reconnection; callers
/// must not cache sessions across operations that can outlive a connection.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Returns the current connected session, establishing one if needed.
    async fn session(&self) -> Result<Arc<dyn BackendSession>>;
}

/// One live connection to the runtime backend.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Monotonic identity of this connection epoch. Packs record it so
    /// recovery can tell which connection a handle belongs to.
    fn id(&self) -> u64;

    /// Creates a remote container record.
    async fn create_container(&self, opts: &CreateOptions) -> Result<Arc<dyn RemoteContainer>>;

    /// Loads an existing container record by ID.
    async fn load_container(&self, id: &str) -> Result<Arc<dyn RemoteContainer>>;
}

/// Handle to a remote container record.
#[async_trait]
pub trait RemoteContainer: Send + Sync {
    /// Container ID.
    fn id(&self) -> &str;

    /// Creates the container's task with the given stdio FIFO set.
    ///
    /// The task is created but not started.
    async fn new_task(&self, io: &FifoSet, opts: TaskOptions) -> Result<Arc<dyn RemoteTask>>;

    /// Loads the container's existing task together with the FIFO-set
    /// reference persisted when the task was created, if the backend still
    /// has one. Used by recovery to re-attach stdio.
    async fn attach_task(&self) -> Result<(Arc<dyn RemoteTask>, Option<FifoSet>)>;

    /// Deletes the container record. The task must already be gone.
    async fn delete(&self) -> Result<()>;
}

/// Handle to a running (or runnable) task.
#[async_trait]
pub trait RemoteTask: Send + Sync {
    /// OS PID of the task's init process.
    fn pid(&self) -> u32;

    /// Starts the created task.
    async fn start(&self) -> Result<()>;

    /// Pauses the task.
    async fn pause(&self) -> Result<()>;

    /// Resumes a paused task.
    async fn resume(&self) -> Result<()>;

    /// Delivers a signal; with `all` set, to every process in the task.
    async fn kill(&self, signal: Signal, all: bool) -> Result<()>;

    /// Resizes the init process's terminal.
    async fn resize(&self, width: u32, height: u32) -> Result<()>;

    /// Applies new resource limits to the running task.
    async fn update(&self, resources: &Resources) -> Result<()>;

    /// Writes a checkpoint of the task.
    async fn checkpoint(&self, opts: &CheckpointOptions) -> Result<()>;

    /// Subscribes to the task's terminal status.
    ///
    /// Must be called before `start` so an instant exit cannot be missed.
    async fn wait(&self) -> Result<ExitSource>;

    /// Takes one stats sample.
    async fn metrics(&self) -> Result<TaskMetrics>;

    /// Lists the processes running inside the task.
    async fn pids(&self) -> Result<Vec<ProcessInfo>>;

    /// Reports the task's current state.
    async fn status(&self) -> Result<TaskStatus>;

    /// Creates an exec process inside the running task.
    async fn exec(
        &self,
        exec_id: &str,
        spec: &ExecSpec,
        io: &FifoSet,
    ) -> Result<Arc<dyn RemoteProcess>>;

    /// Loads an existing exec process by ID.
    async fn load_process(&self, exec_id: &str) -> Result<Arc<dyn RemoteProcess>>;

    /// Deletes the task, reaping its resources; with `force` set, kills the
    /// process group first.
    async fn delete(&self, force: bool) -> Result<ExitStatus>;
}

/// Handle to an exec'd process inside a task.
#[async_trait]
pub trait RemoteProcess: Send + Sync {
    /// Exec ID.
    fn id(&self) -> &str;

    /// OS PID, once started.
    fn pid(&self) -> u32;

    /// Starts the created exec process.
    async fn start(&self) -> Result<()>;

    /// Delivers a signal to the process.
    async fn kill(&self, signal: Signal) -> Result<()>;

    /// Resizes the process's terminal.
    async fn resize(&self, width: u32, height: u32) -> Result<()>;

    /// Subscribes to the process's terminal status. Call before `start`.
    async fn wait(&self) -> Result<ExitSource>;

    /// Closes the write side of the process's stdin on the backend side.
    ///
    /// Closing the local pipe handle is not enough to signal end-of-input;
    /// the backend holds its own descriptors and must be told explicitly.
    async fn close_stdin(&self) -> Result<()>;

    /// Deletes the exec process record, reaping its resources.
    async fn delete(&self) -> Result<ExitStatus>;
}
