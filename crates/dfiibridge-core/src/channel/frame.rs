//! Message framing for the bridge transport.
//!
//! Each message is a 4-byte big-endian length prefix followed by the payload:
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```
//!
//! Zero-length frames are legal; the server uses them for the exit
//! acknowledgement.

use crate::config::BridgeConfig;
use crate::{BridgeError, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HEADER_LEN: usize = 4;

fn check_len(len: usize) -> Result<()> {
    if len > BridgeConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::Protocol(format!(
            "frame of {} bytes is over the {} byte limit",
            len,
            BridgeConfig::MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

/// Prefix `payload` with its length header.
fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    check_len(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one frame.
///
/// `None` means the peer closed the connection between frames. A connection
/// that drops partway through a frame is a `Protocol` error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(BridgeError::Protocol(format!(
                    "connection closed after {} of {} header bytes",
                    filled, HEADER_LEN
                )))
            }
            n => filled += n,
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(BridgeError::Protocol(format!(
            "connection closed inside a {} byte frame",
            len
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Write one frame as a single buffer and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_back_to_back_frames_keep_boundaries() {
        let mut wire = Vec::new();
        write_frame(&mut wire, br#"{"func":"echo"}"#).await.unwrap();
        write_frame(&mut wire, b"").await.unwrap();
        write_frame(&mut wire, "h\u{e9}llo".as_bytes()).await.unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(
            read_frame(&mut reader).await.unwrap().as_deref(),
            Some(&br#"{"func":"echo"}"#[..])
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Vec::new()));
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some("h\u{e9}llo".as_bytes().to_vec())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[test]
    fn test_encode_header_is_big_endian_length() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(&frame[..HEADER_LEN], &[0, 0, 0, 3]);
        assert_eq!(&frame[HEADER_LEN..], b"abc");
    }

    #[tokio::test]
    async fn test_truncated_header_is_protocol_error() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_protocol_error() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"only");

        let result = read_frame(&mut Cursor::new(wire)).await;
        assert!(matches!(result, Err(BridgeError::Protocol(msg)) if msg.contains("10 byte frame")));
    }

    #[tokio::test]
    async fn test_header_over_limit_is_rejected_before_allocating() {
        let claimed = (BridgeConfig::MAX_MESSAGE_SIZE as u32) + 1;
        let result = read_frame(&mut Cursor::new(claimed.to_be_bytes().to_vec())).await;
        assert!(matches!(result, Err(BridgeError::Protocol(msg)) if msg.contains("limit")));
    }
}
