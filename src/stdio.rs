//! Stdio attachment protocol.
//!
//! Binds a container/process identity to OS-level byte streams. The shim
//! side of the backend opens FIFOs by path; this module creates them, opens
//! the engine's ends, and hands the assembled [`DirectIo`] to a
//! caller-supplied initializer that wraps it into the engine's own stream
//! abstraction.
//!
//! # Stdin Close Protocol
//!
//! Closing the engine's write end of the stdin pipe does not deliver EOF:
//! the remote side holds its own descriptors, so the process keeps reading
//! until an explicit close-write-side call reaches the backend. The
//! [`StdinWriter`] therefore closes in two phases. The first local close
//! (run-once, however many callers race it) drops the pipe handle, then a
//! background worker waits for the attach gate to release and issues the
//! remote [`StdinCloser::close_stdin`] call. The gate exists because the
//! close can race task creation: the worker must not fire until the create
//! call has returned and the backend knows the process.
//!
//! Re-attachment (recovery) rebuilds [`DirectIo`] from a persisted FIFO-set
//! reference without creating pipes and without the remote-close machinery.

use crate::constants::{STDERR_FIFO, STDIN_FIFO, STDOUT_FIFO};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

// =============================================================================
// FIFO Set
// =============================================================================

/// The named pipes backing one process's stdio.
///
/// `stderr` is absent when the process owns a terminal (stderr merges into
/// the terminal stream); `stdin` is absent unless the caller wired it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FifoSet {
    /// Directory holding the pipes; removed by [`FifoSet::cleanup`].
    pub dir: PathBuf,
    /// Stdin pipe path, if stdin is wired.
    pub stdin: Option<PathBuf>,
    /// Stdout pipe path.
    pub stdout: Option<PathBuf>,
    /// Stderr pipe path, absent for terminal processes.
    pub stderr: Option<PathBuf>,
    /// Whether the process owns a terminal.
    pub terminal: bool,
}

impl FifoSet {
    /// Creates the FIFO directory and pipes for a new process.
    ///
    /// The directory is `<root>/<process_id>-<random>` so a reused exec ID
    /// can never collide with a stale directory from a previous life.
    pub fn create(root: &Path, process_id: &str, with_stdin: bool, terminal: bool) -> Result<Self> {
        let dir = root.join(format!("{process_id}-{}", Uuid::new_v4().simple()));
        make_private_dir(&dir)?;

        let stdin = with_stdin.then(|| dir.join(STDIN_FIFO));
        let stdout = Some(dir.join(STDOUT_FIFO));
        let stderr = (!terminal).then(|| dir.join(STDERR_FIFO));

        for path in [stdin.as_deref(), stdout.as_deref(), stderr.as_deref()]
            .into_iter()
            .flatten()
        {
            make_fifo(path)?;
        }

        Ok(Self {
            dir,
            stdin,
            stdout,
            stderr,
            terminal,
        })
    }

    /// Best-effort removal of the pipes and their directory.
    pub fn cleanup(&self) {
        for path in [self.stdin.as_deref(), self.stdout.as_deref(), self.stderr.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %err, "failed to remove fifo");
            }
        }
        if let Err(err) = std::fs::remove_dir(&self.dir) {
            debug!(dir = %self.dir.display(), error = %err, "failed to remove fifo directory");
        }
    }
}

#[cfg(unix)]
fn make_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)).map_err(|err| {
        Error::Stream(format!("failed to create fifo {}: {err}", path.display()))
    })?;
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> Result<()> {
    Err(Error::Stream(
        "FIFO-backed stdio requires a unix platform".to_string(),
    ))
}

/// Opens one end of a FIFO without blocking on the peer.
///
/// Read+write mode: a FIFO opened O_RDWR neither blocks in `open` waiting
/// for the shim nor observes EOF before the shim attaches its end.
fn open_pipe(path: &Path) -> Result<tokio::fs::File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    Ok(tokio::fs::File::from_std(file))
}

// =============================================================================
// Stream Initializer Seam
// =============================================================================

/// The engine-side stream wrapper produced by a [`StreamInitializer`].
///
/// The controller only touches it on unwind paths: `cancel` aborts pumping
/// without waiting for in-flight data, `close` releases the streams.
pub trait ContainerIo: Send + Sync {
    /// Aborts stream pumping.
    fn cancel(&self);

    /// Releases the streams.
    fn close(&self);
}

/// Wraps an assembled [`DirectIo`] into the engine's stream abstraction.
///
/// Invoked exactly once per successful attach; recovery may call it once
/// per re-attachment attempt.
pub type StreamInitializer = Arc<dyn Fn(DirectIo) -> Result<Box<dyn ContainerIo>> + Send + Sync>;

/// Caller-provided description of how a process's stdio gets wired.
#[derive(Clone)]
pub struct IoAttachment {
    /// Wire a stdin pipe for the process.
    pub stdin: bool,
    init: StreamInitializer,
}

impl IoAttachment {
    /// Builds an attachment from a stdin flag and an initializer closure.
    pub fn new<F>(stdin: bool, init: F) -> Self
    where
        F: Fn(DirectIo) -> Result<Box<dyn ContainerIo>> + Send + Sync + 'static,
    {
        Self {
            stdin,
            init: Arc::new(init),
        }
    }

    /// Attachment that drops the streams on the floor (logs only).
    ///
    /// Useful for callers that only care about exit status.
    pub fn discard() -> Self {
        Self::new(false, |_dio| Ok(Box::new(NullIo)))
    }

    pub(crate) fn init(&self, dio: DirectIo) -> Result<Box<dyn ContainerIo>> {
        (self.init)(dio)
    }
}

impl std::fmt::Debug for IoAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoAttachment")
            .field("stdin", &self.stdin)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn ContainerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerIo").finish_non_exhaustive()
    }
}

struct NullIo;

impl ContainerIo for NullIo {
    fn cancel(&self) {}
    fn close(&self) {}
}

// =============================================================================
// Remote Stdin Close Seam
// =============================================================================

/// Issues the backend call that closes the write side of a process's stdin.
///
/// Implemented by the lifecycle controller with a fresh session and load
/// chain: the pack cache may not hold the process yet when the close
/// worker fires (the pack is registered only after start).
#[async_trait]
pub trait StdinCloser: Send + Sync {
    /// Closes the remote write side of stdin. Not-found means the process
    /// already exited and is not an error for callers of this seam.
    async fn close_stdin(&self, container_id: &str, process_id: &str) -> Result<()>;
}

pub(crate) struct RemoteStdinClose {
    pub(crate) container_id: String,
    pub(crate) process_id: String,
    pub(crate) gate: oneshot::Receiver<()>,
    pub(crate) closer: Arc<dyn StdinCloser>,
}

// =============================================================================
// Stdin Writer
// =============================================================================

/// Write end of a process's stdin pipe with two-phase close semantics.
///
/// Cloning yields another handle to the same pipe; close is run-once
/// across every clone and every racing caller.
#[derive(Clone)]
pub struct StdinWriter {
    inner: Arc<StdinInner>,
}

struct StdinInner {
    file: Mutex<Option<tokio::fs::File>>,
    closed: AtomicBool,
    remote: StdMutex<Option<RemoteStdinClose>>,
}

impl StdinWriter {
    fn new(file: tokio::fs::File, remote: Option<RemoteStdinClose>) -> Self {
        Self {
            inner: Arc::new(StdinInner {
                file: Mutex::new(Some(file)),
                closed: AtomicBool::new(false),
                remote: StdMutex::new(remote),
            }),
        }
    }

    /// Writes the whole buffer to the process's stdin.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut slot = self.inner.file.lock().await;
        match slot.as_mut() {
            Some(file) => {
                file.write_all(buf).await?;
                file.flush().await?;
                Ok(())
            }
            None => Err(Error::Stream("stdin already closed".to_string())),
        }
    }

    /// Closes stdin.
    ///
    /// The first call closes the local pipe handle and schedules the remote
    /// close-write-side call for once the attach gate releases; every later
    /// or concurrent call is a no-op. The remote call tolerates not-found
    /// because the process may exit before the worker runs.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Local phase: drop the pipe handle.
        self.inner.file.lock().await.take();

        // Remote phase, if this writer was built with the close machinery
        // (fresh attach) rather than without it (recovery re-attach).
        let remote = match self.inner.remote.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(remote) = remote {
            tokio::spawn(async move {
                // Released (or dropped) by the controller once the backend
                // knows the process.
                let _ = remote.gate.await;
                match remote
                    .closer
                    .close_stdin(&remote.container_id, &remote.process_id)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!(
                            container = %remote.container_id,
                            process = %remote.process_id,
                            "process already gone when closing remote stdin"
                        );
                    }
                    Err(err) => {
                        warn!(
                            container = %remote.container_id,
                            process = %remote.process_id,
                            error = %err,
                            "failed to close remote stdin"
                        );
                    }
                }
            });
        }
    }

    /// True once close has been triggered.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Direct IO
// =============================================================================

/// Opened pipe ends for one process, ready for the engine to pump.
pub struct DirectIo {
    /// Stdin writer, if stdin was wired.
    pub stdin: Option<StdinWriter>,
    /// Stdout read end.
    pub stdout: Option<tokio::fs::File>,
    /// Stderr read end, absent for terminal processes.
    pub stderr: Option<tokio::fs::File>,
    fifos: FifoSet,
}

impl DirectIo {
    fn open(fifos: &FifoSet, remote: Option<RemoteStdinClose>) -> Result<Self> {
        let stdin = match &fifos.stdin {
            Some(path) => Some(StdinWriter::new(open_pipe(path)?, remote)),
            None => None,
        };
        let stdout = fifos.stdout.as_deref().map(open_pipe).transpose()?;
        let stderr = fifos.stderr.as_deref().map(open_pipe).transpose()?;
        Ok(Self {
            stdin,
            stdout,
            stderr,
            fifos: fifos.clone(),
        })
    }

    /// The FIFO paths behind these streams.
    pub fn fifo_set(&self) -> &FifoSet {
        &self.fifos
    }
}

// =============================================================================
// Attach Entry Points
// =============================================================================

/// Opens freshly created FIFOs, wires the stdin close protocol, and hands
/// the streams to the caller's initializer.
pub(crate) fn create_io(
    fifos: &FifoSet,
    container_id: &str,
    process_id: &str,
    gate: oneshot::Receiver<()>,
    closer: Arc<dyn StdinCloser>,
    attachment: &IoAttachment,
) -> Result<Box<dyn ContainerIo>> {
    let remote = fifos.stdin.is_some().then(|| RemoteStdinClose {
        container_id: container_id.to_string(),
        process_id: process_id.to_string(),
        gate,
        closer,
    });
    let dio = DirectIo::open(fifos, remote)?;
    attachment.init(dio)
}

/// Rebuilds streams over an existing FIFO set (recovery re-attachment).
///
/// No pipes are created and the stdin close protocol is not wired; there is
/// no in-flight create call to gate against.
pub(crate) fn attach_io(
    fifos: Option<&FifoSet>,
    attachment: &IoAttachment,
) -> Result<Box<dyn ContainerIo>> {
    let fifos = fifos.ok_or_else(|| Error::Stream("no fifo set to attach to".to_string()))?;
    let dio = DirectIo::open(fifos, None)?;
    attachment.init(dio)
}
