//! In-process loopback transport keyed by pipe name.
//!
//! Rendezvous happens over `tokio::io::duplex` pairs, so tests exercise the
//! full registry/worker stack without touching the filesystem. `bind`
//! registers a queue under the pipe name; `connect` pushes one half of a
//! fresh duplex pair into it and keeps the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::duplex;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::error::{PipehubError, Result};

use super::{BoxedPipe, Connector, Listener};

const STREAM_BUFFER: usize = 64 * 1024;

/// Loopback connector for tests and single-process setups.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    endpoints: Arc<DashMap<String, mpsc::Sender<BoxedPipe>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn bind(&self, pipe_name: &str) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::channel(16);
        self.endpoints.insert(pipe_name.to_string(), tx);
        Ok(Box::new(MemoryListener {
            incoming: Mutex::new(rx),
        }))
    }

    async fn connect(&self, pipe_name: &str, timeout: Duration) -> Result<BoxedPipe> {
        let deadline = time::Instant::now() + timeout;
        // the listener may not have bound yet
        loop {
            let endpoint = self
                .endpoints
                .get(pipe_name)
                .map(|entry| entry.value().clone());
            if let Some(endpoint) = endpoint {
                let (near, far) = duplex(STREAM_BUFFER);
                return match endpoint.send(Box::new(far) as BoxedPipe).await {
                    Ok(()) => Ok(Box::new(near)),
                    Err(_) => Err(PipehubError::ConnectionClosed),
                };
            }
            if time::Instant::now() >= deadline {
                return Err(PipehubError::Timeout);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct MemoryListener {
    incoming: Mutex<mpsc::Receiver<BoxedPipe>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<BoxedPipe> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(PipehubError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let connector = MemoryConnector::new();
        let listener = connector.bind("loop").await.unwrap();

        let client_connector = connector.clone();
        let client_task = tokio::spawn(async move {
            let mut client = client_connector
                .connect("loop", Duration::from_secs(1))
                .await
                .unwrap();
            client.write_all(b"hello").await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_bind() {
        let connector = MemoryConnector::new();

        let binder = connector.clone();
        let bind_task = tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            let listener = binder.bind("late").await.unwrap();
            listener.accept().await.unwrap()
        });

        let stream = connector.connect("late", Duration::from_secs(1)).await;
        assert!(stream.is_ok());
        bind_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        let connector = MemoryConnector::new();
        let result = connector
            .connect("nobody", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(PipehubError::Timeout)));
    }

    #[tokio::test]
    async fn test_multiple_clients_accepted_in_order() {
        let connector = MemoryConnector::new();
        let listener = connector.bind("multi").await.unwrap();

        for _ in 0..3 {
            let client_connector = connector.clone();
            tokio::spawn(async move {
                let _stream = client_connector
                    .connect("multi", Duration::from_secs(1))
                    .await
                    .unwrap();
                // keep the stream alive briefly so accept sees it
                time::sleep(Duration::from_millis(100)).await;
            });
        }

        for _ in 0..3 {
            listener.accept().await.unwrap();
        }
    }
}
