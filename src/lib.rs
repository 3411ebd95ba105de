//! # magiktask
//!
//! **Container Task Lifecycle Controller over a Remote Runtime Backend**
//!
//! This crate drives the container-task lifecycle of an engine daemon
//! against a remote runtime backend: create, exec, pause, resize, stats,
//! checkpoint, recover and destroy. It handles single-node task control
//! only - image distribution, networking and pod semantics live in the
//! layers above it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           magiktask                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                         Client                            │  │
//! │  │   create │ exec │ pause │ resize │ stats │ checkpoint     │  │
//! │  │   probe / wait │ recover │ destroy (escalating)           │  │
//! │  └──────┬──────────────────┬──────────────────┬──────────────┘  │
//! │         │                  │                  │                 │
//! │  ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼───────────┐     │
//! │  │ Lock Table  │    │   Watcher   │    │  Stdio Streams   │     │
//! │  │ per-ID gate │    │ Pack + exit │    │ FIFO plumbing,   │     │
//! │  │ bounded wait│    │  mailboxes  │    │ gated stdin close│     │
//! │  └─────────────┘    └─────────────┘    └──────────────────┘     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       TaskBackend Seam                          │
//! │   Session ──► RemoteContainer ──► RemoteTask ──► RemoteProcess  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Exit Observation
//!
//! Every registered container gets a single-slot, replayable exit mailbox.
//! A monitor task deposits the terminal [`ExitMessage`] exactly once; any
//! number of probes, before or after the exit, observe the same message:
//!
//! ```text
//!   task exits ──► monitor ──► ExitMessage ──► mailbox (single slot)
//!                                                  │
//!                        probe ◄───── replay ──────┼───── replay ──► probe
//!                        (late readers see the identical message)
//! ```
//!
//! # Locking Discipline
//!
//! Lifecycle operations serialize per container through an advisory lock
//! with a bounded acquisition budget; contention fails fast instead of
//! queueing behind a stuck peer:
//!
//! | Operations                                      | Lock | Why                                 |
//! |-------------------------------------------------|------|-------------------------------------|
//! | create, destroy, recover                        | held | lifecycle transitions must serialize|
//! | pause, unpause, resize, stats, pid(s), status, update | held | consistent view of the live pack |
//! | probe, wait                                     | none | must observe exits during a destroy |
//! | exec, resize_exec, checkpoint                   | none | backend serializes per process      |
//!
//! # Destroy Escalation
//!
//! [`Client::destroy_container`] walks a terminate → kill → force-stop
//! ladder so a wedged task cannot survive; see the [`client`] module docs
//! for the full diagram.
//!
//! # Example
//!
//! ```rust,ignore
//! use magiktask::{Client, ClientConfig, IoAttachment};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> magiktask::Result<()> {
//!     let backend = connect_backend().await?; // Arc<dyn TaskBackend>
//!     let client = Client::new(backend, ClientConfig::default());
//!
//!     client.create_container(&container_config("web-1"), None).await?;
//!
//!     let outcome = client.wait_container("web-1").await?;
//!     println!("web-1 exited with {}", outcome.status_code);
//!
//!     client.destroy_container("web-1", Duration::from_secs(10)).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod lock;
pub mod message;
pub mod stdio;
pub mod watch;

// Re-exports
pub use backend::{
    BackendSession, CheckpointOptions, CreateOptions, ExecSpec, ExitSource, ExitStatus,
    ProcessInfo, RemoteContainer, RemoteProcess, RemoteTask, Resources, RootFs, RuntimeSpec,
    Signal, TaskBackend, TaskMetrics, TaskOptions, TaskState, TaskStatus,
};
pub use client::{Client, ContainerConfig, ExecProcess, ExitHook, ResizeOptions, WaitOutcome};
pub use config::ClientConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use lock::{ContainerGuard, ContainerLock};
pub use message::{ExitMessage, Mailbox};
pub use stdio::{
    ContainerIo, DirectIo, FifoSet, IoAttachment, StdinCloser, StdinWriter, StreamInitializer,
};
pub use watch::{Pack, Watcher};
