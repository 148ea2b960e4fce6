//! Registry server: accept loop, per-connection lifecycle, and routing.
//!
//! The registry accepts worker connections in a loop. Each connection runs
//! a small state machine: the first frame must be a `RegisterWorker`
//! envelope, after which the connection's listen loop serves traffic until
//! the peer goes away. Inbound frames are first offered to the
//! pending-response table; anything left over is an unsolicited request for
//! the `RequestReceived` hook.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipehub::registry::RegistryServer;
//! use pipehub::transport::NativeConnector;
//!
//! let registry = RegistryServer::builder()
//!     .on_worker_connected(|worker| println!("joined: {}", worker.worker_id))
//!     .start(Arc::new(NativeConnector))
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::connection::{BoxFuture, Connection, MessageHandler};
use crate::constants::{DEFAULT_CALL_TIMEOUT, DEFAULT_REGISTRY_PIPE_NAME, REGISTRY_STOP_GRACE};
use crate::error::{PipehubError, Result};
use crate::pending::PendingResponses;
use crate::protocol::{message_type, PipeMessage, RegisterWorkerRequest};
use crate::transport::{Connector, Listener};

use super::workers::{WorkerHook, WorkerRecord, WorkerTable};

/// Builder for [`RegistryServer`].
pub struct RegistryServerBuilder {
    pipe_name: String,
    call_timeout: Duration,
    on_worker_connected: Option<WorkerHook>,
    on_worker_disconnected: Option<WorkerHook>,
    request_hook: Option<Arc<dyn MessageHandler>>,
}

impl RegistryServerBuilder {
    fn new() -> Self {
        Self {
            pipe_name: DEFAULT_REGISTRY_PIPE_NAME.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            on_worker_connected: None,
            on_worker_disconnected: None,
            request_hook: None,
        }
    }

    /// Pipe name to listen on.
    pub fn pipe_name(mut self, pipe_name: &str) -> Self {
        self.pipe_name = pipe_name.to_string();
        self
    }

    /// Default per-call timeout for outbound requests.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Hook fired when a worker registers.
    pub fn on_worker_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerRecord) + Send + Sync + 'static,
    {
        self.on_worker_connected = Some(Arc::new(hook));
        self
    }

    /// Hook fired exactly once when a registered worker's connection ends.
    pub fn on_worker_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerRecord) + Send + Sync + 'static,
    {
        self.on_worker_disconnected = Some(Arc::new(hook));
        self
    }

    /// Hook offered every unsolicited request arriving from a worker; its
    /// returned envelope, if any, is written back.
    pub fn on_request(mut self, hook: Arc<dyn MessageHandler>) -> Self {
        self.request_hook = Some(hook);
        self
    }

    /// Bind the pipe and start the accept loop.
    pub async fn start(self, connector: Arc<dyn Connector>) -> Result<Arc<RegistryServer>> {
        let listener = connector.bind(&self.pipe_name).await?;

        let server = Arc::new(RegistryServer {
            pipe_name: self.pipe_name,
            call_timeout: self.call_timeout,
            workers: WorkerTable::new(self.on_worker_connected, self.on_worker_disconnected),
            connections: DashMap::new(),
            pending: PendingResponses::new(),
            request_hook: self.request_hook,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let accept = Arc::clone(&server);
        server
            .tasks
            .spawn(async move { accept.accept_loop(listener).await });

        Ok(server)
    }
}

/// The registry process: accepts worker connections, tracks registrations,
/// and routes requests to workers. It owns the pending-response table that
/// demultiplexes replies arriving on any connection.
pub struct RegistryServer {
    pipe_name: String,
    call_timeout: Duration,
    workers: WorkerTable,
    connections: DashMap<Uuid, Arc<Connection>>,
    pending: PendingResponses,
    request_hook: Option<Arc<dyn MessageHandler>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl RegistryServer {
    pub fn builder() -> RegistryServerBuilder {
        RegistryServerBuilder::new()
    }

    /// Pipe name this registry listens on.
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Default per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Snapshot of the currently connected worker ids.
    pub fn connected_worker_ids(&self) -> Vec<String> {
        self.workers.snapshot_ids()
    }

    /// Look up a registered worker.
    pub fn lookup_worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.lookup(worker_id)
    }

    async fn accept_loop(self: Arc<Self>, listener: Box<dyn Listener>) {
        loop {
            let stream = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        time::sleep(Duration::from_millis(250)).await;
                        continue;
                    }
                },
            };

            let connection = Arc::new(Connection::new(stream));
            self.connections.insert(connection.id(), Arc::clone(&connection));
            let server = Arc::clone(&self);
            self.tasks
                .spawn(async move { server.serve_connection(connection).await });
        }
    }

    /// Per-connection lifecycle: registration handshake, serving, cleanup.
    async fn serve_connection(self: Arc<Self>, connection: Arc<Connection>) {
        let worker_id = match self.await_registration(&connection).await {
            Ok(worker_id) => worker_id,
            Err(e) => {
                tracing::warn!(
                    connection = %connection.id(),
                    error = %e,
                    "registration failed, closing connection"
                );
                self.connections.remove(&connection.id());
                return;
            }
        };

        let handler = RegistryMessageHandler {
            server: Arc::clone(&self),
        };
        if let Err(e) = connection.listen(&handler, &self.cancel).await {
            tracing::warn!(worker = %worker_id, error = %e, "worker connection lost");
        }

        self.connections.remove(&connection.id());
        self.pending.fail_connection(connection.id());
        self.workers.remove_if(&worker_id, connection.id());
    }

    /// The first frame on a new connection must be a `RegisterWorker`.
    async fn await_registration(&self, connection: &Arc<Connection>) -> Result<String> {
        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipehubError::Cancelled),
            first = connection.recv() => first?,
        };
        let first = first.ok_or(PipehubError::ConnectionClosed)?;

        if first.message_type != message_type::REGISTER_WORKER {
            return Err(PipehubError::Protocol(format!(
                "expected {} as first frame, got {}",
                message_type::REGISTER_WORKER,
                first.message_type
            )));
        }

        let register: RegisterWorkerRequest = first.payload_as()?;
        let record = WorkerRecord {
            worker_id: register.worker_id.clone(),
            pipe_name: register.pipe_name,
            connection_id: connection.id(),
        };
        if let Some(displaced) = self.workers.register(record) {
            tracing::debug!(
                worker = %displaced.worker_id,
                "displaced prior registration"
            );
        }
        tracing::debug!(worker = %register.worker_id, "worker registered");
        Ok(register.worker_id)
    }

    /// Send `request` to the named worker and await its reply.
    pub async fn send_to_worker(
        &self,
        worker_id: &str,
        request: PipeMessage,
    ) -> Result<PipeMessage> {
        self.send_to_worker_timeout(worker_id, request, self.call_timeout)
            .await
    }

    /// [`send_to_worker`](Self::send_to_worker) with an explicit timeout.
    pub async fn send_to_worker_timeout(
        &self,
        worker_id: &str,
        request: PipeMessage,
        timeout: Duration,
    ) -> Result<PipeMessage> {
        let (record, connection) = self.route(worker_id)?;

        // register before writing: the reply can beat the writer back
        let reply = self.pending.register(&request, connection.id())?;
        if let Err(e) = connection.send(&request).await {
            drop(reply); // removes the pending entry
            self.connections.remove(&connection.id());
            self.workers.remove_if(&record.worker_id, record.connection_id);
            return Err(e);
        }
        reply.recv(timeout).await
    }

    /// Send `request` to the named worker without awaiting any reply.
    pub async fn post_to_worker(&self, worker_id: &str, request: PipeMessage) -> Result<()> {
        let (record, connection) = self.route(worker_id)?;
        if let Err(e) = connection.send(&request).await {
            self.connections.remove(&connection.id());
            self.workers.remove_if(&record.worker_id, record.connection_id);
            return Err(e);
        }
        Ok(())
    }

    fn route(&self, worker_id: &str) -> Result<(WorkerRecord, Arc<Connection>)> {
        let record = self
            .workers
            .lookup(worker_id)
            .ok_or_else(|| PipehubError::WorkerNotRegistered(worker_id.to_string()))?;
        let connection = self
            .connections
            .get(&record.connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipehubError::ConnectionGone(record.worker_id.clone()))?;
        Ok((record, connection))
    }

    /// Stop accepting, cancel all connection loops, and wait bounded for
    /// spawned tasks to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        if time::timeout(REGISTRY_STOP_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("registry tasks did not exit within the stop grace period");
        }
    }
}

struct RegistryMessageHandler {
    server: Arc<RegistryServer>,
}

impl MessageHandler for RegistryMessageHandler {
    fn on_message(&self, message: PipeMessage) -> BoxFuture<'_, Option<PipeMessage>> {
        Box::pin(async move {
            // a response to an outstanding request resolves its waiter
            if self.server.pending.complete(&message) {
                return None;
            }
            match &self.server.request_hook {
                Some(hook) => hook.on_message(message).await,
                None => {
                    tracing::warn!(
                        message_type = %message.message_type,
                        message_id = %message.message_id,
                        "dropping unsolicited message"
                    );
                    None
                }
            }
        })
    }
}
