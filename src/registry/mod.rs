//! Registry-side components: the live-worker table and the registry server.

mod server;
mod workers;

pub use server::{RegistryServer, RegistryServerBuilder};
pub use workers::{WorkerHook, WorkerRecord, WorkerTable};
