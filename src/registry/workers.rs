//! Live-worker bookkeeping for the registry process.
//!
//! A worker record's lifetime is bracketed by its connection's lifetime:
//! the per-connection task registers it after the handshake and removes it
//! when the read loop terminates. Worker ids are compared
//! case-insensitively; re-registering an id displaces the prior record
//! (last writer wins) while both connections stay tracked until one closes.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// Hook invoked on worker join/leave.
pub type WorkerHook = Arc<dyn Fn(&WorkerRecord) + Send + Sync>;

/// One registered worker, bound to the connection that bears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    /// Unique worker identifier, as the worker sent it.
    pub worker_id: String,
    /// Pipe name the worker advertised for itself.
    pub pipe_name: String,
    /// Connection the registration arrived on.
    pub connection_id: Uuid,
}

/// The set of live workers, keyed case-insensitively by worker id.
#[derive(Default)]
pub struct WorkerTable {
    workers: DashMap<String, WorkerRecord>,
    on_connected: Option<WorkerHook>,
    on_disconnected: Option<WorkerHook>,
}

impl WorkerTable {
    pub fn new(on_connected: Option<WorkerHook>, on_disconnected: Option<WorkerHook>) -> Self {
        Self {
            workers: DashMap::new(),
            on_connected,
            on_disconnected,
        }
    }

    fn key(worker_id: &str) -> String {
        worker_id.to_ascii_lowercase()
    }

    /// Register a worker and fire the connected hook.
    ///
    /// An existing record under the same id is displaced and returned; its
    /// connection stays alive until it closes on its own, but routing now
    /// targets the new registration.
    pub fn register(&self, record: WorkerRecord) -> Option<WorkerRecord> {
        let displaced = self.workers.insert(Self::key(&record.worker_id), record.clone());
        if let Some(hook) = &self.on_connected {
            hook(&record);
        }
        displaced
    }

    /// Remove the record for `worker_id` while it is still bound to
    /// `connection_id`, firing the disconnected hook on removal.
    ///
    /// A displaced record's dying connection must not evict its successor,
    /// so removal is conditional on the connection still matching.
    pub fn remove_if(&self, worker_id: &str, connection_id: Uuid) -> Option<WorkerRecord> {
        let removed = self
            .workers
            .remove_if(&Self::key(worker_id), |_, record| {
                record.connection_id == connection_id
            })
            .map(|(_, record)| record);
        if let Some(record) = &removed {
            if let Some(hook) = &self.on_disconnected {
                hook(record);
            }
        }
        removed
    }

    /// Look up a worker by id (case-insensitive).
    pub fn lookup(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers
            .get(&Self::key(worker_id))
            .map(|record| record.clone())
    }

    /// Stable snapshot of the connected worker ids.
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|record| record.worker_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
