//! Live registry of running containers.
//!
//! One [`Pack`] per live container bundles the remote handles with the exit
//! plumbing: the mailbox readers probe, and the raw exit-status source the
//! backend resolves when the task dies. Registering a pack spawns its exit
//! monitor, a background task that consumes the source exactly once and
//! deposits the terminal [`ExitMessage`] for replay.
//!
//! The registry has its own synchronization, independent of the
//! per-container lock: recovery and the exit monitors touch it outside any
//! caller-held lock, and probe paths must stay responsive while a lifecycle
//! operation holds a container's lock.

use crate::backend::{BackendSession, ExitSource, RemoteContainer, RemoteTask};
use crate::error::{Error, Result};
use crate::message::{ExitMessage, Mailbox};
use crate::stdio::FifoSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

// =============================================================================
// Pack
// =============================================================================

/// In-core bundle tracking one live container.
///
/// Owned by the [`Watcher`]; lifecycle operations borrow it via
/// [`Watcher::get`]. At most one live pack exists per container ID.
pub struct Pack {
    id: String,
    container: Arc<dyn RemoteContainer>,
    task: Arc<dyn RemoteTask>,
    mailbox: Mailbox,
    exit_source: StdMutex<Option<ExitSource>>,
    session: Arc<dyn BackendSession>,
    fifos: Option<FifoSet>,
}

impl std::fmt::Debug for Pack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pack")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Pack {
    /// Builds a pack for a freshly created or recovered task.
    ///
    /// `exit_source` is the subscription obtained from the task before it
    /// was started; the registry's exit monitor consumes it on `add`.
    /// `fifos` are the task's stdio pipes, removed once the task is reaped.
    pub fn new(
        id: impl Into<String>,
        container: Arc<dyn RemoteContainer>,
        task: Arc<dyn RemoteTask>,
        session: Arc<dyn BackendSession>,
        exit_source: ExitSource,
        fifos: Option<FifoSet>,
    ) -> Self {
        Self {
            id: id.into(),
            container,
            task,
            mailbox: Mailbox::new(),
            exit_source: StdMutex::new(Some(exit_source)),
            session,
            fifos,
        }
    }

    /// Container ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote container handle.
    pub fn container(&self) -> Arc<dyn RemoteContainer> {
        self.container.clone()
    }

    /// Remote task handle.
    pub fn task(&self) -> Arc<dyn RemoteTask> {
        self.task.clone()
    }

    /// The pack's exit mailbox.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// The backend session that created the handles.
    pub fn session(&self) -> Arc<dyn BackendSession> {
        self.session.clone()
    }

    /// The FIFO set backing the task's stdio, if this controller knows it.
    pub fn fifos(&self) -> Option<&FifoSet> {
        self.fifos.as_ref()
    }

    fn take_exit_source(&self) -> Option<ExitSource> {
        match self.exit_source.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

// =============================================================================
// Watcher
// =============================================================================

/// Registry of live packs, keyed by container ID.
pub struct Watcher {
    packs: RwLock<HashMap<String, Arc<Pack>>>,
}

impl Watcher {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            packs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a pack and spawns its exit monitor.
    ///
    /// Fails with [`Error::AlreadyExists`] if a live pack for the same ID is
    /// already registered. Must run inside a tokio runtime (the monitor is
    /// spawned onto it).
    pub fn add(&self, pack: Pack) -> Result<Arc<Pack>> {
        let source = pack.take_exit_source().ok_or_else(|| {
            Error::Internal(format!(
                "exit source for container '{}' already consumed",
                pack.id()
            ))
        })?;

        let pack = Arc::new(pack);
        {
            let mut packs = self.packs_write();
            if packs.contains_key(pack.id()) {
                return Err(Error::AlreadyExists(pack.id().to_string()));
            }
            packs.insert(pack.id().to_string(), pack.clone());
        }

        spawn_exit_monitor(pack.id().to_string(), pack.mailbox(), source);
        Ok(pack)
    }

    /// Looks up the live pack for `id`.
    ///
    /// Not-found is the standard signal that the container never started,
    /// already exited and was reaped, or belongs to another controller.
    pub fn get(&self, id: &str) -> Result<Arc<Pack>> {
        self.packs_read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container '{id}'")))
    }

    /// Removes and returns the pack for `id`, if one is registered.
    pub fn remove(&self, id: &str) -> Option<Arc<Pack>> {
        self.packs_write().remove(id)
    }

    /// Returns the exit mailbox for `id`.
    ///
    /// Unknown IDs get a detached mailbox pre-loaded with a not-found
    /// message, so probes resolve immediately instead of hanging on a
    /// container that will never exit into this registry.
    pub fn notify(&self, id: &str) -> Mailbox {
        match self.packs_read().get(id) {
            Some(pack) => pack.mailbox(),
            None => Mailbox::with_message(ExitMessage::from_error(Error::NotFound(format!(
                "container '{id}'"
            )))),
        }
    }

    /// Number of live packs.
    pub fn len(&self) -> usize {
        self.packs_read().len()
    }

    /// True if no packs are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Map mutations are single statements; a panic cannot leave the map
    // inconsistent, so poisoning is recoverable.
    fn packs_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Pack>>> {
        match self.packs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn packs_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Pack>>> {
        match self.packs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Exit Monitor
// =============================================================================

/// Consumes a pack's exit source once and publishes the terminal message.
fn spawn_exit_monitor(id: String, mailbox: Mailbox, source: ExitSource) {
    tokio::spawn(async move {
        let msg = match source.await {
            Ok(status) => {
                debug!(container = %id, exit_code = status.code, "task exited");
                ExitMessage::from_status(status)
            }
            Err(_) => {
                warn!(container = %id, "exit channel closed before an exit was observed");
                ExitMessage::from_error(Error::Backend {
                    operation: format!("wait for container '{id}'"),
                    reason: "exit channel closed by backend".to_string(),
                })
            }
        };
        mailbox.deposit(msg);
    });
}
