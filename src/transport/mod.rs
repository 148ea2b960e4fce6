//! Transport module - pipe rendezvous and the connection factory seam.
//!
//! The fabric needs exactly two transport operations: bind a pipe name and
//! accept server sides, or connect one client side within a timeout. The
//! [`Connector`] trait captures that seam so tests can substitute the
//! in-process [`MemoryConnector`] for the operating system's pipes.

mod memory;
mod pipe;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use memory::MemoryConnector;
pub use pipe::{pipe_path, NativeConnector};

/// Combined I/O bound for one duplex pipe stream.
pub trait PipeIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PipeIo for T {}

/// A connected duplex byte stream with its concrete type erased.
pub type BoxedPipe = Box<dyn PipeIo>;

/// Accept side of a bound pipe name.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept one incoming stream. Must be cancellation-safe: dropping a
    /// pending `accept` future must not leak resources.
    async fn accept(&self) -> Result<BoxedPipe>;
}

/// Factory for transport endpoints, keyed by pipe name.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Bind `pipe_name` and return its accept side.
    async fn bind(&self, pipe_name: &str) -> Result<Box<dyn Listener>>;

    /// Connect one client side, failing with [`crate::PipehubError::Timeout`]
    /// when the peer does not accept within `timeout`.
    async fn connect(&self, pipe_name: &str, timeout: Duration) -> Result<BoxedPipe>;
}
