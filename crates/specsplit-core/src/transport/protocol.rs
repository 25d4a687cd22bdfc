//! Length-prefixed framing shared by the client and server.
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```
//!
//! Readers never hand back a short frame: either the full payload arrives or
//! the call fails. A peer that closes exactly on a frame boundary is reported
//! as [`TransportError::PeerClosed`]; one that closes mid-frame is reported as
//! [`TransportError::IncompleteFrame`].

use crate::config::TransportConfig;
use crate::error::{Result, SplitError, TransportError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Build the on-wire bytes for one frame.
///
/// Fails before anything is written if the payload cannot be described by the
/// length prefix or exceeds `max_frame_size`.
pub fn encode_frame(payload: &[u8], max_frame_size: u32) -> Result<BytesMut> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        SplitError::protocol(format!(
            "payload of {} bytes does not fit a 32-bit length prefix",
            payload.len()
        ))
    })?;
    if len > max_frame_size {
        return Err(SplitError::protocol(format!(
            "payload of {} bytes exceeds maximum frame size {}",
            len, max_frame_size
        )));
    }

    let mut frame = BytesMut::with_capacity(TransportConfig::FRAME_HEADER_LEN + payload.len());
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame)
}

/// Write one length-prefixed frame.
///
/// The prefix and payload go out in a single `write_all` so a peer never sees
/// a prefix without its payload unless the socket itself fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_frame_size: u32,
) -> Result<()> {
    let frame = encode_frame(payload, max_frame_size)?;
    writer
        .write_all(&frame)
        .await
        .map_err(TransportError::from)?;
    writer.flush().await.map_err(TransportError::from)?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; TransportConfig::FRAME_HEADER_LEN];
    let got = read_full(reader, &mut len_buf).await?;
    if got == 0 {
        return Err(TransportError::PeerClosed.into());
    }
    if got < len_buf.len() {
        return Err(TransportError::IncompleteFrame {
            expected: len_buf.len(),
            received: got,
        }
        .into());
    }

    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_size {
        return Err(SplitError::protocol(format!(
            "length prefix {} exceeds maximum frame size {}",
            len, max_frame_size
        )));
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_full(reader, &mut payload).await?;
    if got < payload.len() {
        return Err(TransportError::IncompleteFrame {
            expected: payload.len(),
            received: got,
        }
        .into());
    }

    Ok(payload)
}

/// Fill `buf` from `reader`, stopping early only at EOF. Returns bytes read.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::result::Result<usize, TransportError> {
    let mut off = 0;
    while off < buf.len() {
        match reader.read(&mut buf[off..]).await? {
            0 => break,
            n => off += n,
        }
    }
    Ok(off)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = TransportConfig::DEFAULT_MAX_FRAME_SIZE;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"PROPOSALS01";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload, MAX).await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, MAX).await.unwrap();
        assert_eq!(read_back, payload.to_vec());
    }

    #[tokio::test]
    async fn test_empty_payload_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"", MAX).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_is_peer_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(err.is_peer_closed());
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_incomplete_frame() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        match read_frame(&mut cursor, MAX).await.unwrap_err() {
            SplitError::Transport(TransportError::IncompleteFrame { expected, received }) => {
                assert_eq!(expected, 4);
                assert_eq!(received, 2);
            }
            other => panic!("Expected IncompleteFrame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_incomplete_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"SCORES");

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor, MAX).await.unwrap_err() {
            SplitError::Transport(TransportError::IncompleteFrame { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 6);
            }
            other => panic!("Expected IncompleteFrame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_read_oversized_is_protocol_violation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&65u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 64).await.unwrap_err();
        assert!(matches!(err, SplitError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_oversized_write_sends_nothing() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &[7u8; 65], 64).await.unwrap_err();
        assert!(matches!(err, SplitError::ProtocolViolation { .. }));
        assert!(buf.is_empty());
    }
}
