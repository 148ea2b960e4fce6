//! Worker endpoint: connects to the registry, registers, serves requests.
//!
//! The [`WorkerServerBuilder`] provides a fluent API for registering
//! methods and hooks, then `start()` runs the lifecycle:
//! 1. Connect to the registry pipe (bounded connect timeout)
//! 2. Send exactly one `RegisterWorker` envelope
//! 3. Serve inbound requests through the dispatch engine
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipehub::WorkerServer;
//! use pipehub::transport::NativeConnector;
//!
//! let worker = WorkerServer::builder("calc")
//!     .method("add", |(a, b): (i32, i32)| async move { Ok(a + b) })
//!     .start(Arc::new(NativeConnector))
//!     .await?;
//!
//! worker.stop().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{BoxFuture, Connection, MessageHandler};
use crate::constants::{worker_pipe_name, CONNECT_TIMEOUT, DEFAULT_REGISTRY_PIPE_NAME, WORKER_STOP_GRACE};
use crate::dispatch::{FromArgs, MethodRouter};
use crate::error::Result;
use crate::protocol::PipeMessage;
use crate::transport::Connector;

/// Hook fired once when the worker's registry connection goes away.
pub type ConnectionLostHook = Arc<dyn Fn() + Send + Sync>;

/// Builder for [`WorkerServer`].
pub struct WorkerServerBuilder {
    worker_id: String,
    registry_pipe_name: String,
    pipe_name: Option<String>,
    router: MethodRouter,
    request_hook: Option<Arc<dyn MessageHandler>>,
    on_connection_lost: Option<ConnectionLostHook>,
}

impl WorkerServerBuilder {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            registry_pipe_name: DEFAULT_REGISTRY_PIPE_NAME.to_string(),
            pipe_name: None,
            router: MethodRouter::new(),
            request_hook: None,
            on_connection_lost: None,
        }
    }

    /// Pipe name of the registry to connect to.
    pub fn registry_pipe_name(mut self, pipe_name: &str) -> Self {
        self.registry_pipe_name = pipe_name.to_string();
        self
    }

    /// Pipe name this worker advertises for itself. Defaults to
    /// [`worker_pipe_name`] of the worker id.
    pub fn pipe_name(mut self, pipe_name: &str) -> Self {
        self.pipe_name = Some(pipe_name.to_string());
        self
    }

    /// Register a value-returning method.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: FromArgs + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.router.handle(name, handler);
        self
    }

    /// Register a fire-and-forget method (no reply is ever written).
    pub fn method_notify<A, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: FromArgs + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.router.handle_notify(name, handler);
        self
    }

    /// Hook offered every inbound request before reflective dispatch; a
    /// returned envelope pre-empts the method router.
    pub fn on_request(mut self, hook: Arc<dyn MessageHandler>) -> Self {
        self.request_hook = Some(hook);
        self
    }

    /// Hook fired exactly once when the registry connection ends.
    pub fn on_connection_lost<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Arc::new(hook));
        self
    }

    /// Connect to the registry, register, and start serving.
    pub async fn start(self, connector: Arc<dyn Connector>) -> Result<Arc<WorkerServer>> {
        let pipe_name = self
            .pipe_name
            .unwrap_or_else(|| worker_pipe_name(&self.worker_id));

        let stream = connector
            .connect(&self.registry_pipe_name, CONNECT_TIMEOUT)
            .await?;
        let connection = Arc::new(Connection::new(stream));

        let register = PipeMessage::register_worker(&self.worker_id, &pipe_name)?;
        connection.send(&register).await?;

        let server = Arc::new(WorkerServer {
            worker_id: self.worker_id,
            pipe_name,
            router: self.router,
            request_hook: self.request_hook,
            on_connection_lost: self.on_connection_lost,
            connection,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(true),
            lost_fired: AtomicBool::new(false),
        });

        let serve = Arc::clone(&server);
        server.tasks.spawn(async move { serve.listen().await });

        Ok(server)
    }
}

/// A worker process endpoint serving requests from the registry.
pub struct WorkerServer {
    worker_id: String,
    pipe_name: String,
    router: MethodRouter,
    request_hook: Option<Arc<dyn MessageHandler>>,
    on_connection_lost: Option<ConnectionLostHook>,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
    lost_fired: AtomicBool,
}

impl WorkerServer {
    /// Create a builder for a worker with the given id.
    pub fn builder(worker_id: &str) -> WorkerServerBuilder {
        WorkerServerBuilder::new(worker_id)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Pipe name this worker advertised.
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// True between a completed registration and the connection ending.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn listen(self: Arc<Self>) {
        let handler = WorkerDispatchHandler {
            worker: Arc::clone(&self),
        };
        if let Err(e) = self.connection.listen(&handler, &self.cancel).await {
            tracing::warn!(worker = %self.worker_id, error = %e, "registry connection lost");
        }
        self.started.store(false, Ordering::Release);
        self.fire_connection_lost();
    }

    fn fire_connection_lost(&self) {
        if self.lost_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = &self.on_connection_lost {
            hook();
        }
    }

    /// Cancel the listen loop and wait bounded for it to exit. Idempotent;
    /// the connection-lost hook fires exactly once whether the loop ended
    /// here or on its own.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        if time::timeout(WORKER_STOP_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                worker = %self.worker_id,
                "listen loop did not exit within the stop grace period"
            );
        }
        let _ = self.connection.close().await;
        self.started.store(false, Ordering::Release);
        self.fire_connection_lost();
    }
}

struct WorkerDispatchHandler {
    worker: Arc<WorkerServer>,
}

impl MessageHandler for WorkerDispatchHandler {
    fn on_message(&self, message: PipeMessage) -> BoxFuture<'_, Option<PipeMessage>> {
        Box::pin(async move {
            // the user hook may pre-empt reflective dispatch
            if let Some(hook) = &self.worker.request_hook {
                if let Some(reply) = hook.on_message(message.clone()).await {
                    return Some(reply);
                }
            }
            self.worker.router.dispatch(&message).await
        })
    }
}
