//! # pipehub
//!
//! Local inter-process RPC with a registry-and-workers topology over named
//! pipes (Unix domain sockets on Unix, named pipes on Windows).
//!
//! A single registry process accepts connections from workers. Each worker
//! registers under a unique id and serves requests; the registry can
//! forward a request to one named worker and await the reply, or fan it out
//! to every connected worker and race the replies. Application code on
//! either side goes through generated proxies and name-dispatched handler
//! methods, so a call travels the wire as a `(method, argument-array)`
//! pair and comes back as a typed value.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipehub::transport::NativeConnector;
//! use pipehub::{proxy::Caller, RegistryServer, WorkerServer};
//!
//! #[tokio::main]
//! async fn main() -> pipehub::Result<()> {
//!     let connector: Arc<dyn pipehub::transport::Connector> = Arc::new(NativeConnector);
//!
//!     let registry = RegistryServer::builder().start(connector.clone()).await?;
//!
//!     let worker = WorkerServer::builder("calc")
//!         .method("add", |(a, b): (i32, i32)| async move { Ok(a + b) })
//!         .start(connector)
//!         .await?;
//!
//!     let calc = Caller::unicast(registry.clone(), "calc");
//!     let sum: Option<i32> = calc.call("add", serde_json::json!([2, 3])).await?;
//!     assert_eq!(sum, Some(5));
//!
//!     worker.stop().await;
//!     registry.stop().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod transport;
pub mod worker;

pub use connection::{BoxFuture, Connection, MessageHandler};
pub use error::{PipehubError, Result};
pub use protocol::{message_type, PipeMessage};
pub use registry::{RegistryServer, WorkerRecord};
pub use worker::WorkerServer;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
