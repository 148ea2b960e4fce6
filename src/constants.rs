//! Protocol-level defaults and limits.

use std::time::Duration;

/// Default per-call timeout for outbound requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a worker's connect attempt to the registry.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `WorkerServer::stop` waits for the listen loop to exit.
pub const WORKER_STOP_GRACE: Duration = Duration::from_secs(2);

/// How long `RegistryServer::stop` waits for spawned tasks to exit.
pub const REGISTRY_STOP_GRACE: Duration = Duration::from_secs(5);

/// Canonical pipe name the registry listens on.
pub const DEFAULT_REGISTRY_PIPE_NAME: &str = "AlphaOmega.NamedPipes.Registry";

/// Maximum frame body size (64 MiB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Default pipe name a worker advertises for itself.
pub fn worker_pipe_name(worker_id: &str) -> String {
    format!("AlphaOmega.NamedPipes.Worker.{worker_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pipe_name_format() {
        assert_eq!(
            worker_pipe_name("w1"),
            "AlphaOmega.NamedPipes.Worker.w1"
        );
    }
}
