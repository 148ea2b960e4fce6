//! Native pipe transport.
//!
//! - Unix: Unix Domain Socket at `/tmp/<pipe-name>.sock`
//! - Windows: Named Pipe at `\\.\pipe\<pipe-name>`

use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use crate::error::{PipehubError, Result};

use super::{BoxedPipe, Connector, Listener};

/// Map a logical pipe name to the platform rendezvous path.
pub fn pipe_path(pipe_name: &str) -> String {
    #[cfg(unix)]
    {
        format!("/tmp/{pipe_name}.sock")
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{pipe_name}")
    }
}

/// Default transport backed by the operating system's local pipes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConnector;

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use tokio::net::{UnixListener, UnixStream};

    use crate::error::Result;
    use crate::transport::{BoxedPipe, Listener};

    /// Unix Domain Socket listener. Removes its socket file on drop.
    pub struct NativeListener {
        listener: UnixListener,
        path: String,
    }

    impl NativeListener {
        /// Bind to a socket path, replacing any stale socket file.
        pub fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }
    }

    impl Drop for NativeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[async_trait]
    impl Listener for NativeListener {
        async fn accept(&self) -> Result<BoxedPipe> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(Box::new(stream))
        }
    }

    pub async fn connect(path: &str) -> std::io::Result<BoxedPipe> {
        let stream = UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};
    use tokio::sync::Mutex;
    use tokio::time;

    use crate::error::Result;
    use crate::transport::{BoxedPipe, Listener};

    /// Windows error returned while all pipe instances are busy.
    const ERROR_PIPE_BUSY: i32 = 231;

    /// Named pipe listener. Each accept creates the next server instance.
    pub struct NativeListener {
        path: String,
        // the pre-created instance waiting for the next client
        next: Mutex<Option<tokio::net::windows::named_pipe::NamedPipeServer>>,
    }

    impl NativeListener {
        pub fn bind(path: &str) -> Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;
            Ok(Self {
                path: path.to_string(),
                next: Mutex::new(Some(first)),
            })
        }
    }

    #[async_trait]
    impl Listener for NativeListener {
        async fn accept(&self) -> Result<BoxedPipe> {
            let mut next = self.next.lock().await;
            let server = match next.take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.path)?,
            };
            server.connect().await?;
            *next = Some(ServerOptions::new().create(&self.path)?);
            Ok(Box::new(server))
        }
    }

    pub async fn connect(path: &str) -> std::io::Result<BoxedPipe> {
        loop {
            match ClientOptions::new().open(path) {
                Ok(client) => return Ok(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Connector for NativeConnector {
    async fn bind(&self, pipe_name: &str) -> Result<Box<dyn Listener>> {
        let path = pipe_path(pipe_name);

        #[cfg(unix)]
        {
            Ok(Box::new(unix_impl::NativeListener::bind(&path)?))
        }

        #[cfg(windows)]
        {
            Ok(Box::new(windows_impl::NativeListener::bind(&path)?))
        }
    }

    async fn connect(&self, pipe_name: &str, timeout: Duration) -> Result<BoxedPipe> {
        let path = pipe_path(pipe_name);

        #[cfg(unix)]
        let connecting = unix_impl::connect(&path);

        #[cfg(windows)]
        let connecting = windows_impl::connect(&path);

        match time::timeout(timeout, connecting).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(PipehubError::Io(e)),
            Err(_) => Err(PipehubError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_path_format() {
        let path = pipe_path("AlphaOmega.NamedPipes.Registry");

        #[cfg(unix)]
        {
            assert!(path.starts_with("/tmp/"));
            assert!(path.ends_with(".sock"));
        }

        #[cfg(windows)]
        {
            assert!(path.starts_with(r"\\.\pipe\"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_connect_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let pipe_name = format!("pipehub-test-{}", std::process::id());
        let connector = NativeConnector;
        let listener = connector.bind(&pipe_name).await.unwrap();

        let client_task = tokio::spawn(async move {
            let mut client = NativeConnector
                .connect(&pipe_name, Duration::from_secs(1))
                .await
                .unwrap();
            client.write_all(b"ping").await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(received, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_to_absent_pipe_fails() {
        let result = NativeConnector
            .connect("pipehub-nobody-home", Duration::from_millis(200))
            .await;
        assert!(result.is_err());
    }
}
