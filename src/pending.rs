//! Pending-response correlation table (the RPC demultiplexer).
//!
//! Maps in-flight `message_id`s to their waiting futures. Entries are born
//! on [`PendingResponses::register`], resolved by
//! [`complete`](PendingResponses::complete) or
//! [`fail`](PendingResponses::fail), and removed on every terminal path:
//! completion, failure, timeout, or the waiter being dropped.
//!
//! `complete` and `fail` never block, so every connection's read loop can
//! call them directly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time;
use uuid::Uuid;

use crate::error::{PipehubError, Result};
use crate::protocol::PipeMessage;

struct PendingEntry {
    tx: oneshot::Sender<Result<PipeMessage>>,
    connection_id: Uuid,
}

type Entries = Arc<DashMap<Uuid, PendingEntry>>;

/// Table of in-flight requests awaiting their responses.
///
/// Cloning is cheap; all clones share one table.
#[derive(Clone, Default)]
pub struct PendingResponses {
    entries: Entries,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the response to `request`, bound to the
    /// connection the request will be written on.
    ///
    /// Must be called before the request frame is written: the response can
    /// arrive before the sending task resumes.
    ///
    /// # Errors
    ///
    /// [`PipehubError::DuplicatePending`] if a waiter already exists for
    /// this `message_id`; that is a programming error in the caller.
    pub fn register(&self, request: &PipeMessage, connection_id: Uuid) -> Result<PendingReply> {
        let id = request.message_id;
        let (tx, rx) = oneshot::channel();
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PipehubError::DuplicatePending(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingEntry { tx, connection_id });
                Ok(PendingReply {
                    id,
                    rx,
                    entries: Arc::clone(&self.entries),
                })
            }
        }
    }

    /// Resolve the waiter matching `response.message_id`.
    ///
    /// Returns `false` without side effect when no waiter exists; the
    /// caller decides whether the message is an unsolicited request or a
    /// late response to drop.
    pub fn complete(&self, response: &PipeMessage) -> bool {
        match self.entries.remove(&response.message_id) {
            Some((_, entry)) => {
                if entry.tx.send(Ok(response.clone())).is_err() {
                    tracing::warn!(
                        message_id = %response.message_id,
                        "waiter gone before completion"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Reject the waiter for `request`, if any.
    pub fn fail(&self, request: &PipeMessage, error: PipehubError) {
        if let Some((_, entry)) = self.entries.remove(&request.message_id) {
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Reject every in-flight waiter bound to `connection_id`.
    ///
    /// Called when a connection's read loop terminates so in-flight callers
    /// fail immediately instead of waiting out their timeouts.
    pub fn fail_connection(&self, connection_id: Uuid) {
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.tx.send(Err(PipehubError::ConnectionClosed));
            }
        }
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A registered waiter for one response.
///
/// Dropping it without receiving removes the entry, so a cancelled caller
/// does not leak table slots.
pub struct PendingReply {
    id: Uuid,
    rx: oneshot::Receiver<Result<PipeMessage>>,
    entries: Entries,
}

impl PendingReply {
    /// Message id this waiter is keyed by.
    pub fn message_id(&self) -> Uuid {
        self.id
    }

    /// Wait for the response.
    ///
    /// Resolves with the completed response, the error passed to `fail`,
    /// or [`PipehubError::Timeout`] when `timeout` elapses first. The
    /// table entry is removed on every terminal path.
    pub async fn recv(mut self, timeout: Duration) -> Result<PipeMessage> {
        match time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // sender dropped without resolving: the table went away
            Ok(Err(_)) => Err(PipehubError::ConnectionClosed),
            Err(_) => Err(PipehubError::Timeout),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
    }
}
