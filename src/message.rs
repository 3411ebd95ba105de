//! Exit messages and the per-container mailbox.
//!
//! A task's terminal state is published exactly once in content but
//! observed arbitrarily many times, sometimes concurrently and long after
//! the exit. The [`Mailbox`] is therefore a single-slot, replayable
//! final-state cache: depositing publishes the value for every current and
//! future reader, and reading never consumes it.

use crate::backend::ExitStatus;
use crate::error::Error;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// Exit Message
// =============================================================================

/// The result of waiting on a task or exec process.
///
/// Immutable once constructed; replayed by value. The error slot carries
/// wait-machinery failures (timeout, backend loss), never the process's own
/// exit code; a process that exits nonzero produces a clean message with
/// that code.
#[derive(Debug, Clone)]
pub struct ExitMessage {
    err: Option<Error>,
    exit_code: u32,
    exit_time: Option<DateTime<Utc>>,
}

impl ExitMessage {
    /// Builds a message from its parts.
    ///
    /// Used when an exit was observed but the wait itself still failed, e.g.
    /// an attached exec whose caller timeout expired before the exit.
    pub fn new(err: Option<Error>, exit_code: u32, exit_time: Option<DateTime<Utc>>) -> Self {
        Self {
            err,
            exit_code,
            exit_time,
        }
    }

    /// Message for an observed exit.
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            err: None,
            exit_code: status.code,
            exit_time: Some(status.exited_at),
        }
    }

    /// Message for a wait that failed instead of observing an exit.
    pub fn from_error(err: Error) -> Self {
        Self {
            err: Some(err),
            exit_code: 0,
            exit_time: None,
        }
    }

    /// Process exit code (0 when the message carries an error instead).
    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    /// When the process exited, if an exit was observed.
    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        self.exit_time
    }

    /// The wait failure, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

// =============================================================================
// Mailbox
// =============================================================================

/// Single-slot, replayable holder of a terminal [`ExitMessage`].
///
/// Cloning yields another handle to the same slot. Depositing a second
/// value replaces the first; the exit monitor only ever deposits once per
/// pack, but probe timeouts never write here at all, so the slot holds
/// nothing until the real terminal value arrives.
#[derive(Debug, Clone)]
pub struct Mailbox {
    slot: Arc<watch::Sender<Option<ExitMessage>>>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Creates a mailbox already holding `msg`.
    ///
    /// Used by the registry to answer probes for unknown containers with an
    /// immediate not-found message.
    pub fn with_message(msg: ExitMessage) -> Self {
        let mailbox = Self::new();
        mailbox.deposit(msg);
        mailbox
    }

    /// Publishes the terminal value for every current and future reader.
    pub fn deposit(&self, msg: ExitMessage) {
        self.slot.send_replace(Some(msg));
    }

    /// Returns the held value without waiting, if one has been deposited.
    pub fn try_read(&self) -> Option<ExitMessage> {
        self.slot.borrow().clone()
    }

    /// Waits until a value is deposited and returns a copy of it.
    ///
    /// Never consumes the slot; any number of concurrent readers observe
    /// the same value. Callers bound this with `tokio::time::timeout` when
    /// they need a deadline.
    pub async fn read(&self) -> ExitMessage {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(msg) = rx.borrow_and_update().clone() {
                return msg;
            }
            // Cannot fail: `self` keeps the sender half alive.
            let _ = rx.changed().await;
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_message_from_status() {
        let msg = ExitMessage::from_status(ExitStatus::new(3));
        assert_eq!(msg.exit_code(), 3);
        assert!(msg.err().is_none());
        assert!(msg.exit_time().is_some());
    }

    #[test]
    fn test_message_from_error() {
        let msg = ExitMessage::from_error(Error::NotFound("container 'c1'".to_string()));
        assert_eq!(msg.exit_code(), 0);
        assert!(msg.err().map(|e| e.is_not_found()).unwrap_or(false));
    }

    #[test]
    fn test_message_carries_error_and_observed_exit() {
        let err = Error::Timeout {
            operation: "exec process 'e1'".to_string(),
            duration: Duration::from_secs(2),
        };
        let msg = ExitMessage::new(Some(err), 137, Some(Utc::now()));
        assert_eq!(msg.exit_code(), 137);
        assert!(msg.err().map(|e| e.is_timeout()).unwrap_or(false));
        assert!(msg.exit_time().is_some());
    }

    #[tokio::test]
    async fn test_mailbox_replays_value() {
        let mailbox = Mailbox::new();
        assert!(mailbox.try_read().is_none());

        mailbox.deposit(ExitMessage::from_status(ExitStatus::new(7)));

        // Reading does not consume: every read sees the same value.
        for _ in 0..5 {
            assert_eq!(mailbox.read().await.exit_code(), 7);
        }
        assert_eq!(mailbox.try_read().map(|m| m.exit_code()), Some(7));
    }

    #[tokio::test]
    async fn test_mailbox_wakes_pending_readers() {
        let mailbox = Mailbox::new();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let mb = mailbox.clone();
            readers.push(tokio::spawn(async move { mb.read().await.exit_code() }));
        }

        // Give the readers a chance to park on the empty slot first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.deposit(ExitMessage::from_status(ExitStatus::new(42)));

        for reader in readers {
            assert_eq!(reader.await.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn test_mailbox_with_message_resolves_immediately() {
        let mailbox =
            Mailbox::with_message(ExitMessage::from_error(Error::NotFound("task".to_string())));
        let msg = mailbox.read().await;
        assert!(msg.err().map(|e| e.is_not_found()).unwrap_or(false));
    }
}
