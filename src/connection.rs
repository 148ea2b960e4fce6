//! One established duplex stream with framed send/receive.
//!
//! A [`Connection`] owns both halves of a stream: the write half behind a
//! mutex held only across the bytes of a single frame, and the read half
//! behind a mutex so at most one reader runs at a time. Reads and writes
//! stay concurrent with each other (full duplex).
//!
//! The [`listen`](Connection::listen) loop reads frames, hands each message
//! to a [`MessageHandler`], and writes back any reply the handler returns.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{read_frame, write_frame, PipeMessage};

/// Boxed future used by handler traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives each inbound message from a connection's listen loop.
///
/// Returning `Some(reply)` makes the loop write the reply back on the same
/// connection.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: PipeMessage) -> BoxFuture<'_, Option<PipeMessage>>;
}

/// One established duplex stream plus its write serializer.
pub struct Connection {
    id: Uuid,
    writer: Mutex<Writer>,
    reader: Mutex<Reader>,
}

impl Connection {
    /// Wrap an established stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = io::split(stream);
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(Box::new(write_half)),
            reader: Mutex::new(Box::new(read_half)),
        }
    }

    /// Connection id, used to associate a worker with its transport.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write one message as a single frame.
    ///
    /// The write mutex is held across the length header and body only, so
    /// concurrent senders never interleave bytes of two frames.
    pub async fn send(&self, message: &PipeMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, message).await
    }

    /// Read one message. `None` means the peer closed cleanly.
    pub async fn recv(&self) -> Result<Option<PipeMessage>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    /// Shut down the write half, signalling EOF to the peer.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Read frames until the peer closes, the token is cancelled, or I/O
    /// fails, handing each message to `handler` and writing back any reply.
    ///
    /// Holds the reader mutex for the whole loop, so a second listener on
    /// the same connection waits instead of competing for frames. Returns
    /// `Ok(())` on cancellation and on clean EOF; I/O errors propagate to
    /// the owner.
    pub async fn listen<H>(&self, handler: &H, cancel: &CancellationToken) -> Result<()>
    where
        H: MessageHandler,
    {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = read_frame(&mut *reader) => next,
            };
            match next {
                Ok(Some(message)) => {
                    if let Some(reply) = handler.on_message(message).await {
                        self.send(&reply).await?;
                    }
                }
                Ok(None) => {
                    tracing::debug!(connection = %self.id, "peer closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipehubError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoHandler;

    impl MessageHandler for EchoHandler {
        fn on_message(&self, message: PipeMessage) -> BoxFuture<'_, Option<PipeMessage>> {
            Box::pin(async move {
                let text: String = message.payload_as().ok()?;
                PipeMessage::reply_to(&message, &message.message_type, &text).ok()
            })
        }
    }

    struct SilentHandler(Arc<AtomicUsize>);

    impl MessageHandler for SilentHandler {
        fn on_message(&self, _message: PipeMessage) -> BoxFuture<'_, Option<PipeMessage>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { None })
        }
    }

    #[tokio::test]
    async fn test_listen_echoes_replies() {
        let (near, far) = tokio::io::duplex(4096);
        let server = Arc::new(Connection::new(far));
        let client = Connection::new(near);

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let listener = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.listen(&EchoHandler, &loop_cancel).await })
        };

        let request = PipeMessage::request("Echo", &"hello").unwrap();
        client.send(&request).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();

        assert_eq!(reply.message_id, request.message_id);
        assert_eq!(reply.payload_as::<String>().unwrap(), "hello");

        cancel.cancel();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listen_exits_cleanly_on_peer_close() {
        let (near, far) = tokio::io::duplex(4096);
        let server = Connection::new(far);

        drop(near);
        let cancel = CancellationToken::new();
        let result = server.listen(&SilentHandler(Arc::default()), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listen_exits_on_cancellation() {
        let (_near, far) = tokio::io::duplex(4096);
        let server = Connection::new(far);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = server.listen(&SilentHandler(Arc::default()), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let sender = Arc::new(Connection::new(near));
        let receiver = Connection::new(far);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let sender = Arc::clone(&sender);
            tasks.push(tokio::spawn(async move {
                let payload = format!("payload-{i}").repeat(64);
                let message = PipeMessage::request("Blob", &payload).unwrap();
                sender.send(&message).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        sender.close().await.unwrap();

        // interleaved frames would fail to parse
        let mut received = 0;
        while let Some(message) = receiver.recv().await.unwrap() {
            assert_eq!(message.message_type, "Blob");
            message.payload_as::<String>().unwrap();
            received += 1;
        }
        assert_eq!(received, 20);
    }

    #[tokio::test]
    async fn test_listen_handles_without_reply() {
        let (near, far) = tokio::io::duplex(4096);
        let server = Connection::new(far);
        let client = Connection::new(near);

        let count = Arc::new(AtomicUsize::new(0));
        let handler = SilentHandler(Arc::clone(&count));
        let cancel = CancellationToken::new();

        client
            .send(&PipeMessage::request("Notify", &()).unwrap())
            .await
            .unwrap();
        client.close().await.unwrap();

        server.listen(&handler, &cancel).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_listener_waits_for_reader() {
        let (near, far) = tokio::io::duplex(4096);
        let server = Arc::new(Connection::new(far));
        let _client = Connection::new(near);

        let cancel = CancellationToken::new();
        let first = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.listen(&SilentHandler(Arc::default()), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the second listen cannot take the reader while the first runs
        let second = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.listen(&SilentHandler(Arc::default()), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        cancel.cancel();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recv_surfaces_truncated_stream() {
        let (mut near, far) = tokio::io::duplex(4096);
        let server = Connection::new(far);

        // a length prefix promising more bytes than ever arrive
        tokio::io::AsyncWriteExt::write_all(&mut near, &100u32.to_le_bytes())
            .await
            .unwrap();
        drop(near);

        assert!(matches!(
            server.recv().await,
            Err(PipehubError::UnexpectedEof)
        ));
    }
}
