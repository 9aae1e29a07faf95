//! Relay frame codec
//!
//! Every relay message on the wire is a single length-prefixed JSON frame:
//!
//! ```text
//! Frame: [ length: u32 big-endian ][ body: UTF-8 JSON, `length` bytes ]
//! ```
//!
//! `length` counts only the body, never includes itself, and is capped at
//! [`MAX_PAYLOAD_BYTES`]. Writers emit the length prefix and body as a single
//! buffered write so a partial write never leaves the frame boundary
//! ambiguous to the reader; readers always read exactly `length` bytes, never
//! fewer, before attempting to parse JSON.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size: 16 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Size of the length prefix, in bytes.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed while reading frame")]
    ConnectionClosed,
    #[error("payload of {0} bytes exceeds maximum of {max} bytes", max = MAX_PAYLOAD_BYTES)]
    PayloadTooLarge(usize),
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed JSON frame from `reader` and deserialize it as `T`.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes before a
/// complete header arrives (a clean EOF at a frame boundary), and
/// [`FrameError::PayloadTooLarge`] without reading the body if the declared
/// length exceeds [`MAX_PAYLOAD_BYTES`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed)
        }
        Err(e) => return Err(FrameError::Io(e)),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
            _ => FrameError::Io(e),
        })?;

    Ok(serde_json::from_slice(&body)?)
}

/// Serialize `value` and write it as one length-prefixed JSON frame to `writer`.
///
/// The length prefix and body are written from a single buffer so the two
/// halves of the frame can never be torn by a partial write.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::io::Cursor;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { n: 7 }).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Ping = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, Ping { n: 7 });
    }

    #[tokio::test]
    async fn header_encodes_body_len_only() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { n: 1 }).await.unwrap();
        let declared = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, buf.len() - HEADER_SIZE);
    }

    #[tokio::test]
    async fn oversize_header_is_rejected_without_reading_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_PAYLOAD_BYTES + 1) as u32).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, Ping>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn clean_close_before_header_is_connection_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_frame::<_, Ping>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn malformed_json_body_is_reported() {
        let mut buf = Vec::new();
        let body = b"not json";
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, Ping>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::MalformedJson(_)));
    }
}
