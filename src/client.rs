//! Container task lifecycle controller.
//!
//! The [`Client`] drives a remote runtime backend through the full task
//! lifecycle: create, exec, pause/resume, resize, stats, checkpoint,
//! recover and destroy. Its registry and the backend's task state can
//! disagree at any point, so every destructive path is written to make
//! progress even when the backend stops answering.
//!
//! # Operation Shape
//!
//! Lifecycle operations serialize per container through an advisory lock
//! acquired with a bounded retry budget; lock contention fails the
//! operation instead of queueing behind a stuck peer. Exit observation
//! bypasses the lock entirely: [`Client::probe_container`] reads the
//! replayable exit mailbox and stays responsive while a destroy is in
//! flight.
//!
//! # Destroy Escalation
//!
//! ```text
//! terminate (bounded) ──not-found──────────────► gone, reap, return
//!      │ other failure
//!      ▼
//!    kill (bounded) ────not-found──────────────► gone, reap, return
//!      │ other failure
//!      ▼
//!  force-stop script ──────────────────────────► guaranteed gone
//!
//!  then: wait(timeout) ──timeout──► kill ──► wait(unbounded)
//! ```
//!
//! A kill signal cannot soft-fail the way a polite terminate can, so the
//! post-kill wait is unbounded.

use crate::backend::{
    BackendSession, CheckpointOptions, CreateOptions, ExecSpec, ExitStatus, ProcessInfo,
    RemoteContainer, RemoteProcess, RemoteTask, Resources, RootFs, RuntimeSpec, Signal,
    TaskBackend, TaskMetrics, TaskOptions, TaskStatus,
};
use crate::config::ClientConfig;
use crate::constants;
use crate::error::{Error, Result};
use crate::lock::ContainerLock;
use crate::message::ExitMessage;
use crate::stdio::{attach_io, create_io, ContainerIo, FifoSet, IoAttachment, StdinCloser};
use crate::watch::{Pack, Watcher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

// =============================================================================
// Operation Inputs / Outputs
// =============================================================================

/// Create-time description of a container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container ID.
    pub id: String,
    /// Labels stored on the backend's container record.
    pub labels: HashMap<String, String>,
    /// Runtime shim selection.
    pub runtime: RuntimeSpec,
    /// Root filesystem source.
    pub rootfs: RootFs,
    /// OCI runtime spec document, opaque to this crate.
    pub spec: serde_json::Value,
    /// Whether the init process owns a terminal.
    pub terminal: bool,
    /// Stdio wiring for the init process.
    pub io: IoAttachment,
}

/// Description of an exec'd process.
#[derive(Debug, Clone)]
pub struct ExecProcess {
    /// Container the process runs in.
    pub container_id: String,
    /// Exec ID, unique within the container.
    pub exec_id: String,
    /// Process spec.
    pub spec: ExecSpec,
    /// Stdio wiring for the process.
    pub io: IoAttachment,
    /// Fire-and-forget: return once started, reap in the background.
    pub detach: bool,
}

/// Terminal size for resize operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeOptions {
    /// Width in character cells.
    pub width: u32,
    /// Height in character cells.
    pub height: u32,
}

/// Result body of [`Client::wait_container`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOutcome {
    /// Exit code of the container's init process.
    pub status_code: i64,
    /// Wait failure text, empty on a clean exit.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Callback invoked when an exec'd process exits.
///
/// Receives the exec ID and the final exit message. Hooks run in
/// registration order; the first failing hook stops the rest (logged, never
/// fatal to the exec flow).
pub type ExitHook = Arc<dyn Fn(&str, &ExitMessage) -> Result<()> + Send + Sync>;

// =============================================================================
// Client
// =============================================================================

/// The lifecycle controller.
///
/// One instance per engine daemon; all operations take `&self` and can run
/// concurrently, serialized per container by the internal lock table.
pub struct Client {
    backend: Arc<dyn TaskBackend>,
    config: ClientConfig,
    lock: ContainerLock,
    watch: Watcher,
    hooks: Vec<ExitHook>,
}

impl Client {
    /// Creates a controller over the given backend.
    pub fn new(backend: Arc<dyn TaskBackend>, config: ClientConfig) -> Self {
        let lock = ContainerLock::new(config.lock_acquire_timeout, config.lock_retry_interval);
        Self {
            backend,
            config,
            lock,
            watch: Watcher::new(),
            hooks: Vec::new(),
        }
    }

    /// Registers an exit hook for exec'd processes.
    #[must_use]
    pub fn with_exit_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &ExitMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// The controller's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container and starts its init task.
    ///
    /// `checkpoint_dir` restores the task from a checkpoint image instead of
    /// starting fresh. Every step's failure unwinds the side effects of the
    /// steps before it: a half-created container never lingers as an orphan.
    pub async fn create_container(
        &self,
        container: &ContainerConfig,
        checkpoint_dir: Option<PathBuf>,
    ) -> Result<()> {
        let id = &container.id;
        validate_id(id)?;

        let _guard = self.lock_container(id).await?;
        let session = self.backend.session().await?;

        let opts = CreateOptions {
            id: id.clone(),
            labels: container.labels.clone(),
            runtime: container.runtime.clone(),
            snapshotter: self.config.snapshotter.clone(),
            rootfs: container.rootfs.clone(),
            spec: container.spec.clone(),
        };

        let remote = session
            .create_container(&opts)
            .await
            .map_err(|err| err.with_operation(&format!("create container '{id}'")))?;
        debug!(container = %id, "remote container record created");

        match self
            .create_task(&session, container, checkpoint_dir, remote.clone())
            .await
        {
            Ok(()) => {
                info!(container = %id, "container created");
                Ok(())
            }
            Err(err) => {
                self.cleanup_container(id, &remote).await;
                Err(err)
            }
        }
    }

    /// Creates, wires and starts the init task, then registers the pack.
    async fn create_task(
        &self,
        session: &Arc<dyn BackendSession>,
        config: &ContainerConfig,
        checkpoint_dir: Option<PathBuf>,
        container: Arc<dyn RemoteContainer>,
    ) -> Result<()> {
        let id = &config.id;

        debug!(
            container = %id,
            stdin = config.io.stdin,
            terminal = config.terminal,
            "creating stdio streams"
        );
        let fifos = FifoSet::create(&self.config.fifo_root, id, config.io.stdin, config.terminal)?;

        // The gate holds any stdin-close worker back until the create call
        // has returned and the backend knows the process.
        let (gate_tx, gate_rx) = oneshot::channel();
        let io = match create_io(&fifos, id, id, gate_rx, self.stdin_closer(), &config.io) {
            Ok(io) => io,
            Err(err) => {
                fifos.cleanup();
                return Err(err.with_operation(&format!("create stdio for container '{id}'")));
            }
        };

        let task = match container.new_task(&fifos, TaskOptions { checkpoint_dir }).await {
            Ok(task) => {
                drop(gate_tx);
                task
            }
            Err(err) => {
                drop(gate_tx);
                io.close();
                fifos.cleanup();
                return Err(err.with_operation(&format!("create task for container '{id}'")));
            }
        };

        // Subscribe before start so an instant exit cannot be missed.
        let exit_source = match task.wait().await {
            Ok(source) => source,
            Err(err) => {
                self.cleanup_task(id, &task).await;
                io.close();
                fifos.cleanup();
                return Err(err.with_operation(&format!("wait task in container '{id}'")));
            }
        };
        debug!(container = %id, pid = task.pid(), "task created");

        if let Err(err) = task.start().await {
            self.cleanup_task(id, &task).await;
            io.close();
            fifos.cleanup();
            return Err(err.with_operation(&format!("start task in container '{id}'")));
        }
        info!(container = %id, pid = task.pid(), "task started");

        let pack = Pack::new(
            id.clone(),
            container,
            task.clone(),
            session.clone(),
            exit_source,
            Some(fifos.clone()),
        );
        if let Err(err) = self.watch.add(pack) {
            self.cleanup_task(id, &task).await;
            io.close();
            fifos.cleanup();
            return Err(err);
        }
        Ok(())
    }

    // =========================================================================
    // Exec
    // =========================================================================

    /// Runs a process inside a running container.
    ///
    /// Detached: returns `Ok(None)` once the process has started; exit
    /// hooks and reaping happen in the background. Attached: blocks until
    /// the process exits or `timeout` expires, runs the exit hooks, reaps
    /// the process, and returns the exit message. On timeout the process is
    /// signalled down (terminate, then kill) and the operation fails with a
    /// timeout error after the exit was observed.
    pub async fn exec_container(
        &self,
        process: &ExecProcess,
        timeout: Option<Duration>,
    ) -> Result<Option<ExitMessage>> {
        let container_id = &process.container_id;
        let exec_id = &process.exec_id;
        validate_id(container_id)?;
        validate_id(exec_id)?;

        let pack = self.watch.get(container_id)?;

        debug!(
            container = %container_id,
            process = %exec_id,
            stdin = process.io.stdin,
            terminal = process.spec.terminal,
            "creating exec stdio streams"
        );
        let fifos = FifoSet::create(
            &self.config.fifo_root,
            exec_id,
            process.io.stdin,
            process.spec.terminal,
        )?;

        let (gate_tx, gate_rx) = oneshot::channel();
        let io = match create_io(
            &fifos,
            container_id,
            exec_id,
            gate_rx,
            self.stdin_closer(),
            &process.io,
        ) {
            Ok(io) => io,
            Err(err) => {
                fifos.cleanup();
                return Err(err.with_operation(&format!(
                    "create stdio for exec process '{exec_id}' in container '{container_id}'"
                )));
            }
        };

        let exec_process = match pack.task().exec(exec_id, &process.spec, &fifos).await {
            Ok(exec_process) => exec_process,
            Err(err) => {
                drop(gate_tx);
                io.close();
                fifos.cleanup();
                return Err(err.with_operation(&format!(
                    "exec process '{exec_id}' in container '{container_id}'"
                )));
            }
        };

        // Subscribe before start so an instant exit cannot be missed.
        let mut exit_source = match exec_process.wait().await {
            Ok(source) => source,
            Err(err) => {
                drop(gate_tx);
                reap_process(&exec_process, exec_id).await;
                io.close();
                fifos.cleanup();
                return Err(err.with_operation(&format!(
                    "wait exec process '{exec_id}' in container '{container_id}'"
                )));
            }
        };

        if let Err(err) = exec_process.start().await {
            drop(gate_tx);
            reap_process(&exec_process, exec_id).await;
            io.close();
            fifos.cleanup();
            return Err(err.with_operation(&format!(
                "start exec process '{exec_id}' in container '{container_id}'"
            )));
        }
        // The backend knows the process now; let any pending stdin close
        // through.
        drop(gate_tx);
        debug!(container = %container_id, process = %exec_id, "exec process started");

        if process.detach {
            let hooks = self.hooks.clone();
            let exec_id = exec_id.clone();
            tokio::spawn(async move {
                let msg = exec_exit_message(exit_source.await, &exec_id);
                match msg.err() {
                    Some(err) => {
                        warn!(process = %exec_id, error = %err, "detached exec process failed")
                    }
                    None => debug!(
                        process = %exec_id,
                        exit_code = msg.exit_code(),
                        "detached exec process exited"
                    ),
                }
                finish_exec(&hooks, &exec_process, &exec_id, &msg, &fifos).await;
            });
            return Ok(None);
        }

        let msg = match timeout {
            None => exec_exit_message(exit_source.await, exec_id),
            Some(t) => match tokio::time::timeout(t, &mut exit_source).await {
                Ok(res) => exec_exit_message(res, exec_id),
                Err(_) => {
                    warn!(
                        container = %container_id,
                        process = %exec_id,
                        timeout = ?t,
                        "exec process outlived its timeout, signalling it down"
                    );
                    self.kill_exec_process(&exec_process, exec_id).await?;

                    match exit_source.await {
                        Ok(status) => ExitMessage::new(
                            Some(Error::Timeout {
                                operation: format!(
                                    "exec process '{exec_id}' in container '{container_id}'"
                                ),
                                duration: t,
                            }),
                            status.code,
                            Some(status.exited_at),
                        ),
                        // The exit was never observed; report the channel
                        // loss rather than a phantom code-0 exit behind the
                        // timeout error.
                        Err(err) => exec_exit_message(Err(err), exec_id),
                    }
                }
            },
        };

        finish_exec(&self.hooks, &exec_process, exec_id, &msg, &fifos).await;

        match msg.err() {
            Some(err) if err.is_timeout() => Err(err.clone()),
            _ => Ok(Some(msg)),
        }
    }

    /// Signals a timed-out exec process down: terminate first, kill if that
    /// fails. Not-found means the process exited between the timeout firing
    /// and the signal landing, which is the outcome we wanted.
    async fn kill_exec_process(
        &self,
        process: &Arc<dyn RemoteProcess>,
        exec_id: &str,
    ) -> Result<()> {
        match process.kill(Signal::Term).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                warn!(process = %exec_id, error = %err, "terminate failed, sending kill");
                match process.kill(Signal::Kill).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => {
                        Err(err.with_operation(&format!("kill exec process '{exec_id}'")))
                    }
                }
            }
        }
    }

    // =========================================================================
    // Pause / Resume
    // =========================================================================

    /// Pauses a running container's task.
    ///
    /// A backend not-found is tolerated: the task exited on its own first.
    pub async fn pause_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;

        if let Err(err) = pack.task().pause().await {
            if !err.is_not_found() {
                return Err(err.with_operation(&format!("pause container '{id}'")));
            }
        }
        info!(container = %id, "container paused");
        Ok(())
    }

    /// Resumes a paused container's task.
    ///
    /// A backend not-found is tolerated: the task exited on its own first.
    pub async fn unpause_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;

        if let Err(err) = pack.task().resume().await {
            if !err.is_not_found() {
                return Err(err.with_operation(&format!("unpause container '{id}'")));
            }
        }
        info!(container = %id, "container resumed");
        Ok(())
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Resizes the terminal of the container's init process.
    pub async fn resize_container(&self, id: &str, opts: ResizeOptions) -> Result<()> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        pack.task().resize(opts.width, opts.height).await
    }

    /// Resizes the terminal of an exec'd process.
    pub async fn resize_exec(&self, id: &str, exec_id: &str, opts: ResizeOptions) -> Result<()> {
        let pack = self.watch.get(id)?;
        let process = pack.task().load_process(exec_id).await?;
        process.resize(opts.width, opts.height).await
    }

    // =========================================================================
    // Read-Only Queries
    // =========================================================================

    /// Takes one stats sample from the container's task.
    pub async fn container_stats(&self, id: &str) -> Result<TaskMetrics> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        pack.task()
            .metrics()
            .await
            .map_err(|err| err.with_operation(&format!("get stats of container '{id}'")))
    }

    /// OS PID of the container's init process.
    pub async fn container_pid(&self, id: &str) -> Result<u32> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        Ok(pack.task().pid())
    }

    /// Lists the processes running inside the container.
    pub async fn container_pids(&self, id: &str) -> Result<Vec<ProcessInfo>> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        pack.task()
            .pids()
            .await
            .map_err(|err| err.with_operation(&format!("get pids of container '{id}'")))
    }

    /// Reports the current state of the container's task.
    pub async fn container_status(&self, id: &str) -> Result<TaskStatus> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        pack.task()
            .status()
            .await
            .map_err(|err| err.with_operation(&format!("get status of container '{id}'")))
    }

    // =========================================================================
    // Exit Observation
    // =========================================================================

    /// Reads the container's terminal exit message.
    ///
    /// Replayable: any number of callers, before or after the exit, observe
    /// the same message. `timeout = None` blocks until the exit; a concrete
    /// timeout yields a message carrying a timeout error on expiry. Unknown
    /// containers resolve immediately to a not-found message. Never takes
    /// the per-container lock, so probes stay responsive during a destroy.
    pub async fn probe_container(&self, id: &str, timeout: Option<Duration>) -> ExitMessage {
        let mailbox = self.watch.notify(id);
        match timeout {
            None => mailbox.read().await,
            Some(t) => match tokio::time::timeout(t, mailbox.read()).await {
                Ok(msg) => msg,
                Err(_) => ExitMessage::from_error(Error::Timeout {
                    operation: format!("probe container '{id}'"),
                    duration: t,
                }),
            },
        }
    }

    /// Blocks until the container's task exits and packages the outcome.
    pub async fn wait_container(&self, id: &str) -> Result<WaitOutcome> {
        let msg = self.probe_container(id, None).await;

        match msg.err() {
            Some(err) if err.is_timeout() => Err(err.clone()),
            Some(err) => Ok(WaitOutcome {
                status_code: i64::from(msg.exit_code()),
                error_message: err.to_string(),
            }),
            None => Ok(WaitOutcome {
                status_code: i64::from(msg.exit_code()),
                error_message: String::new(),
            }),
        }
    }

    // =========================================================================
    // Update / Checkpoint
    // =========================================================================

    /// Applies new resource limits to the container's task.
    pub async fn update_resources(&self, id: &str, resources: &Resources) -> Result<()> {
        let _guard = self.lock_container(id).await?;
        let pack = self.watch.get(id)?;
        pack.task().update(resources).await
    }

    /// Writes a checkpoint of the container's task.
    ///
    /// With `exit` set, the task stops once the image is written.
    pub async fn create_checkpoint(
        &self,
        id: &str,
        checkpoint_dir: impl Into<PathBuf>,
        exit: bool,
    ) -> Result<()> {
        let pack = self.watch.get(id)?;
        let opts = CheckpointOptions {
            checkpoint_dir: checkpoint_dir.into(),
            exit,
        };
        pack.task()
            .checkpoint(&opts)
            .await
            .map_err(|err| err.with_operation(&format!("checkpoint container '{id}'")))
    }

    // =========================================================================
    // Recover
    // =========================================================================

    /// Re-attaches to a container that outlived a daemon restart.
    ///
    /// Loads the persisted container record, reconnects to its task's shim
    /// (retrying hung attempts), rebuilds the stdio wrapper over the
    /// persisted FIFO set, and registers a fresh pack. A record with no
    /// live task is deleted and reported not-found: the caller should
    /// treat the container as gone.
    pub async fn recover_container(&self, id: &str, io: IoAttachment) -> Result<()> {
        validate_id(id)?;

        let session = self.backend.session().await?;
        let _guard = self.lock_container(id).await?;

        let container = match session.load_container(id).await {
            Ok(container) => container,
            Err(err) => {
                error!(container = %id, error = %err, "failed to load container from backend");
                if err.is_not_found() {
                    return Err(Error::NotFound(format!("container '{id}'")));
                }
                return Err(err.with_operation(&format!("load container '{id}'")));
            }
        };

        let (task, _io, fifos) = match self.attach_task_with_retry(id, &container, &io).await {
            Ok(pair) => pair,
            Err(err) if err.is_not_found() => {
                warn!(container = %id, "no task to recover, deleting stale container record");
                if let Err(derr) = container.delete().await {
                    if !derr.is_not_found() {
                        warn!(
                            container = %id,
                            error = %derr,
                            "failed to delete stale container record"
                        );
                    }
                }
                return Err(Error::NotFound(format!("task for container '{id}'")));
            }
            Err(err) if err.is_timeout() => return Err(err),
            Err(err) => {
                error!(container = %id, error = %err, "failed to attach task");
                return Err(err.with_operation(&format!("attach task for container '{id}'")));
            }
        };

        let exit_source = task
            .wait()
            .await
            .map_err(|err| err.with_operation(&format!("wait task in container '{id}'")))?;

        self.watch
            .add(Pack::new(id, container, task, session, exit_source, fifos))?;
        info!(container = %id, "container recovered");
        Ok(())
    }

    /// Attaches to the container's task, retrying attempts that hang.
    ///
    /// Each attempt runs as an independent cancellable unit bounded by the
    /// reconnect timeout, so a wedged shim cannot block the next retry
    /// window. An attempt that completes, whether it succeeded or failed,
    /// ends the retries; only timeouts earn another attempt.
    async fn attach_task_with_retry(
        &self,
        id: &str,
        container: &Arc<dyn RemoteContainer>,
        attachment: &IoAttachment,
    ) -> Result<(Arc<dyn RemoteTask>, Box<dyn ContainerIo>, Option<FifoSet>)> {
        let attempts = self.config.recover_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let container = container.clone();
            let attachment = attachment.clone();
            let mut handle = tokio::spawn(async move {
                let (task, fifos) = container.attach_task().await?;
                let io = attach_io(fifos.as_ref(), &attachment)?;
                Ok::<_, Error>((task, io, fifos))
            });

            match tokio::time::timeout(self.config.reconnect_timeout, &mut handle).await {
                Ok(Ok(result)) => return result,
                Ok(Err(join_err)) => {
                    return Err(Error::Internal(format!(
                        "task attach attempt for container '{id}' failed to run: {join_err}"
                    )));
                }
                Err(_) => {
                    handle.abort();
                    if attempt < attempts {
                        warn!(container = %id, attempt, "timeout connecting to shim, retrying");
                        continue;
                    }
                    return Err(Error::Timeout {
                        operation: format!("connect to shim for container '{id}'"),
                        duration: self.config.reconnect_timeout,
                    });
                }
            }
        }
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Kills a container and removes it, escalating until it is gone.
    ///
    /// `timeout` bounds the polite phase: the terminate signal and the wait
    /// for the resulting exit. See the module docs for the full ladder.
    /// Not-found from a signal means nothing is left to destroy; the
    /// registry entry is reaped and the error returned.
    pub async fn destroy_container(&self, id: &str, timeout: Duration) -> Result<()> {
        validate_id(id)?;
        let _guard = self.lock_container(id).await?;

        let pack = match self.watch.get(id) {
            Ok(pack) => pack,
            Err(_) => {
                // Nothing tracked locally; the fallback script guarantees
                // the underlying process group is gone.
                self.force_stop(id).await?;
                return Ok(());
            }
        };

        let confirmed_gone = self.escalate(&pack, timeout).await?;

        let mut msg = self.probe_container(id, Some(timeout)).await;

        // After a force-stop the task is confirmed gone; re-signalling a
        // backend that already failed twice would only run the script again.
        if !confirmed_gone && msg.err().map(Error::is_timeout).unwrap_or(false) {
            warn!(
                container = %id,
                timeout = ?timeout,
                "no exit within the terminate window, sending kill"
            );
            match pack.task().kill(Signal::Kill, true).await {
                Ok(()) => {
                    // Kill cannot soft-fail the way terminate can; wait it
                    // out without a deadline.
                    msg = self.probe_container(id, None).await;
                }
                Err(err) if err.is_not_found() => {
                    warn!(container = %id, "task already gone on kill");
                    self.reap_container(&pack).await;
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        container = %id,
                        error = %err,
                        "kill failed, falling back to force-stop"
                    );
                    self.force_stop(id).await?;
                    self.reap_container(&pack).await;
                    return Err(err);
                }
            }
        }

        if let Some(err) = msg.err() {
            if confirmed_gone {
                self.reap_container(&pack).await;
            }
            return Err(err.clone());
        }

        self.reap_container(&pack).await;
        info!(container = %id, exit_code = msg.exit_code(), "container destroyed");
        Ok(())
    }

    /// Walks the signal ladder until one rung is delivered.
    ///
    /// Returns whether the force-stop rung ran; the task is then confirmed
    /// gone no matter what the exit mailbox reports. Not-found from a
    /// signal ends the ladder early (nothing is left to signal) and is
    /// surfaced after reaping the registry entry.
    async fn escalate(&self, pack: &Pack, timeout: Duration) -> Result<bool> {
        let id = pack.id();
        let mut rung = EscalationRung::Terminate;
        loop {
            let outcome = match rung.signal() {
                Some(signal) => self.kill_bounded(pack, signal, timeout).await,
                None => {
                    self.force_stop(id).await?;
                    return Ok(true);
                }
            };
            match outcome {
                Ok(()) => return Ok(false),
                Err(err) if err.is_not_found() => {
                    warn!(container = %id, rung = ?rung, "task already gone");
                    self.reap_container(pack).await;
                    return Err(err);
                }
                Err(err) => match rung.next() {
                    Some(next) => {
                        warn!(container = %id, rung = ?rung, error = %err, "signal failed, escalating");
                        rung = next;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Delivers a signal to the whole task group, bounded by `timeout`.
    async fn kill_bounded(&self, pack: &Pack, signal: Signal, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, pack.task().kill(signal, true)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                operation: format!("send {signal} to container '{}'", pack.id()),
                duration: timeout,
            }),
        }
    }

    /// Runs the external force-stop command for `id`.
    ///
    /// Last rung of the escalation ladder; the command must guarantee the
    /// container's process group is gone before exiting zero.
    async fn force_stop(&self, id: &str) -> Result<()> {
        info!(
            container = %id,
            script = %self.config.force_stop_path.display(),
            "invoking external force-stop"
        );

        let output = tokio::time::timeout(
            self.config.force_stop_timeout,
            tokio::process::Command::new(&self.config.force_stop_path)
                .arg(id)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("force stop container '{id}'"),
            duration: self.config.force_stop_timeout,
        })?
        .map_err(|err| Error::ForceStop {
            id: id.to_string(),
            reason: format!(
                "failed to run {}: {err}",
                self.config.force_stop_path.display()
            ),
        })?;

        if !output.status.success() {
            return Err(Error::ForceStop {
                id: id.to_string(),
                reason: format!(
                    "exit({}), stdout({}), stderr({})",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            });
        }
        Ok(())
    }

    /// Drops the pack and best-effort deletes the remote task and container
    /// records. Only called once the task is confirmed gone; failures are
    /// logged, never propagated.
    async fn reap_container(&self, pack: &Pack) {
        self.watch.remove(pack.id());

        let id = pack.id().to_string();
        let task = pack.task();
        let container = pack.container();
        let cleanup = async move {
            if let Err(err) = task.delete(false).await {
                if !err.is_not_found() {
                    warn!(container = %id, error = %err, "failed to reap task");
                }
            }
            if let Err(err) = container.delete().await {
                if !err.is_not_found() {
                    warn!(container = %id, error = %err, "failed to delete container record");
                }
            }
        };
        if tokio::time::timeout(self.config.cleanup_timeout, cleanup)
            .await
            .is_err()
        {
            warn!(container = %pack.id(), "remote record cleanup timed out");
        }

        if let Some(fifos) = pack.fifos() {
            fifos.cleanup();
        }
    }

    // =========================================================================
    // Rollback Helpers
    // =========================================================================

    /// Best-effort delete of a half-created container record.
    async fn cleanup_container(&self, id: &str, container: &Arc<dyn RemoteContainer>) {
        match tokio::time::timeout(self.config.cleanup_timeout, container.delete()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(container = %id, error = %err, "failed to clean up container record")
            }
            Err(_) => warn!(container = %id, "container record cleanup timed out"),
        }
    }

    /// Best-effort delete of a half-created task, killing its processes.
    async fn cleanup_task(&self, id: &str, task: &Arc<dyn RemoteTask>) {
        match tokio::time::timeout(self.config.cleanup_timeout, task.delete(true)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(container = %id, error = %err, "failed to clean up task"),
            Err(_) => warn!(container = %id, "task cleanup timed out"),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lock_container(&self, id: &str) -> Result<crate::lock::ContainerGuard> {
        self.lock
            .try_lock_with_retry(id)
            .await
            .ok_or_else(|| Error::LockBusy(id.to_string()))
    }

    fn stdin_closer(&self) -> Arc<dyn StdinCloser> {
        Arc::new(BackendStdinCloser {
            backend: self.backend.clone(),
        })
    }
}

// =============================================================================
// Escalation Ladder
// =============================================================================

/// Rungs of the destroy escalation ladder, in order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationRung {
    /// Bounded SIGTERM to the whole task group.
    Terminate,
    /// Bounded SIGKILL after terminate failed.
    Kill,
    /// External command; the backend is no longer trusted to deliver
    /// anything.
    ForceStop,
}

impl EscalationRung {
    /// The signal this rung delivers through the backend, if any.
    fn signal(self) -> Option<Signal> {
        match self {
            Self::Terminate => Some(Signal::Term),
            Self::Kill => Some(Signal::Kill),
            Self::ForceStop => None,
        }
    }

    /// The rung to try when this one fails without a definitive answer.
    fn next(self) -> Option<Self> {
        match self {
            Self::Terminate => Some(Self::Kill),
            Self::Kill => Some(Self::ForceStop),
            Self::ForceStop => None,
        }
    }
}

// =============================================================================
// Stdin Close Path
// =============================================================================

/// Closes the remote write side of a process's stdin.
///
/// Always works through a fresh session and load chain rather than the
/// registry: the close worker can fire before the pack is registered (the
/// pack only exists after start).
struct BackendStdinCloser {
    backend: Arc<dyn TaskBackend>,
}

#[async_trait]
impl StdinCloser for BackendStdinCloser {
    async fn close_stdin(&self, container_id: &str, process_id: &str) -> Result<()> {
        let session = self.backend.session().await?;
        let container = session.load_container(container_id).await?;
        let (task, _fifos) = container.attach_task().await?;
        let process = task.load_process(process_id).await?;
        process.close_stdin().await
    }
}

// =============================================================================
// Exec Helpers
// =============================================================================

/// Maps an exit-source resolution into a message. A dropped source is a
/// backend failure, never a clean exit.
fn exec_exit_message(
    res: std::result::Result<ExitStatus, oneshot::error::RecvError>,
    exec_id: &str,
) -> ExitMessage {
    match res {
        Ok(status) => ExitMessage::from_status(status),
        Err(_) => ExitMessage::from_error(Error::Backend {
            operation: format!("wait for exec process '{exec_id}'"),
            reason: "exit channel closed by backend".to_string(),
        }),
    }
}

/// Runs the exit hooks in order (first failure stops the rest), reaps the
/// exec process, and removes its stdio pipes.
async fn finish_exec(
    hooks: &[ExitHook],
    process: &Arc<dyn RemoteProcess>,
    exec_id: &str,
    msg: &ExitMessage,
    fifos: &FifoSet,
) {
    for hook in hooks {
        if let Err(err) = hook(exec_id, msg) {
            error!(process = %exec_id, error = %err, "exec exit hook failed");
            break;
        }
    }
    reap_process(process, exec_id).await;
    fifos.cleanup();
}

/// Best-effort delete of an exec process record.
async fn reap_process(process: &Arc<dyn RemoteProcess>, exec_id: &str) {
    if let Err(err) = process.delete().await {
        if !err.is_not_found() {
            warn!(process = %exec_id, error = %err, "failed to reap exec process");
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    constants::validate_identifier(id).map_err(|reason| Error::InvalidIdentifier {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}
