//! Length-prefixed frame codec.
//!
//! One frame on the wire is `<u32 little-endian length><length bytes of
//! UTF-8 JSON>`. The length counts body bytes only and there is no trailing
//! delimiter. A zero or oversized length is a protocol violation; a stream
//! that ends after any bytes of a frame have been consumed is
//! [`PipehubError::UnexpectedEof`].
//!
//! Frame writes must not interleave with other writers on the same stream;
//! [`write_frame`] assembles header and body into one buffer and the
//! connection serializes callers behind its write mutex.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{PipehubError, Result};
use crate::protocol::PipeMessage;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Write one message as a single frame and flush.
pub async fn write_frame<W>(writer: &mut W, message: &PipeMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(PipehubError::Protocol(format!(
            "frame body of {} bytes exceeds maximum {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `None` when the peer closed cleanly at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<PipeMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if !fill_or_eof(reader, &mut prefix).await? {
        return Ok(None);
    }

    let length = u32::from_le_bytes(prefix);
    if length == 0 {
        return Err(PipehubError::Protocol("zero-length frame".to_string()));
    }
    if length > MAX_FRAME_SIZE {
        return Err(PipehubError::Protocol(format!(
            "frame length {length} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; length as usize];
    if !fill_or_eof(reader, &mut body).await? {
        // prefix consumed, body missing entirely
        return Err(PipehubError::UnexpectedEof);
    }

    Ok(Some(serde_json::from_slice(&body)?))
}

/// Fill `buf` exactly.
///
/// Returns `false` when the stream ends before the first byte; a close
/// after any byte is [`PipehubError::UnexpectedEof`].
async fn fill_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(PipehubError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> PipeMessage {
        PipeMessage::request("Echo", &vec![1, 2, 3]).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let message = sample();
        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, &message).await.unwrap();

        cursor.set_position(0);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let first = sample();
        let second = PipeMessage::request("Other", &"x").unwrap();

        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, &first).await.unwrap();
        write_frame(&mut cursor, &second).await.unwrap();

        cursor.set_position(0);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), first);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), second);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_at_frame_boundary() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_unexpected_eof() {
        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, &sample()).await.unwrap();
        let mut buf = cursor.into_inner();
        buf.truncate(2);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(PipehubError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_unexpected_eof() {
        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, &sample()).await.unwrap();
        let mut buf = cursor.into_inner();
        let cut = buf.len() - 5;
        buf.truncate(cut);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(PipehubError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_protocol_error() {
        let mut cursor = Cursor::new(0u32.to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(PipehubError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_is_protocol_error() {
        let mut cursor = Cursor::new((MAX_FRAME_SIZE + 1).to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(PipehubError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let message = sample();

        let sent = message.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &sent).await.unwrap();
        });

        let decoded = read_frame(&mut server).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(decoded, message);
    }
}
