//! Frame codec for the control channel.
//!
//! ```text
//! ┌──────────────────────────┬───────────────────────────────┐
//! │ length (LEB128, 1-5 B)   │ UTF-8 JSON message (length B) │
//! └──────────────────────────┴───────────────────────────────┘
//! ```
//!
//! This is the layout a .NET `BinaryWriter.Write(string)` produces, which is
//! what the controller speaks.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame the host accepts
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A LEB128 `u32` never needs more than 5 bytes
const MAX_PREFIX_LEN: usize = 5;

/// Encode a message into a length-prefixed frame
#[must_use]
pub fn encode_frame(message: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + MAX_PREFIX_LEN);
    let mut len = message.len();
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            frame.push(byte);
            break;
        }
        frame.push(byte | 0x80);
    }
    frame.extend_from_slice(message.as_bytes());
    frame
}

/// Decode one frame from the front of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` when
/// `buf` does not hold a complete frame yet.
pub fn decode_frame(buf: &[u8]) -> io::Result<Option<(String, usize)>> {
    let mut len: usize = 0;
    let mut prefix = 0;
    loop {
        let Some(&byte) = buf.get(prefix) else {
            return Ok(None);
        };
        len |= usize::from(byte & 0x7f) << (7 * prefix);
        prefix += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if prefix == MAX_PREFIX_LEN {
            return Err(invalid("frame length prefix too long"));
        }
    }
    check_len(len)?;

    let end = prefix + len;
    let Some(body) = buf.get(prefix..end) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(body).map_err(|e| invalid(&e.to_string()))?;
    Ok(Some((text.to_string(), end)))
}

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut len: usize = 0;
    for shift in 0..MAX_PREFIX_LEN {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && shift == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        len |= usize::from(byte & 0x7f) << (7 * shift);
        if byte & 0x80 == 0 {
            check_len(len)?;
            let mut body = vec![0_u8; len];
            reader.read_exact(&mut body).await?;
            return String::from_utf8(body)
                .map(Some)
                .map_err(|e| invalid(&e.to_string()));
        }
    }
    Err(invalid("frame length prefix too long"))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_len(message.len())?;
    writer.write_all(&encode_frame(message)).await?;
    writer.flush().await
}

fn check_len(len: usize) -> io::Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(invalid(&format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Length prefix
    // =========================================================================

    #[test]
    fn test_short_prefix_is_one_byte() {
        let frame = encode_frame("hi");
        assert_eq!(frame, vec![2, b'h', b'i']);
    }

    #[test]
    fn test_prefix_spills_at_128() {
        let message = "x".repeat(128);
        let frame = encode_frame(&message);
        assert_eq!(&frame[..2], &[0x80, 0x01]);
        assert_eq!(frame.len(), 130);
    }

    #[test]
    fn test_prefix_for_300() {
        let frame = encode_frame(&"y".repeat(300));
        // 300 = 0b10_0101100
        assert_eq!(&frame[..2], &[0xac, 0x02]);
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(encode_frame(""), vec![0]);
        assert_eq!(decode_frame(&[0]).unwrap(), Some((String::new(), 1)));
    }

    // =========================================================================
    // Sync decoding
    // =========================================================================

    #[test]
    fn test_decode_needs_more_bytes() {
        let frame = encode_frame("hello");
        assert_eq!(decode_frame(&frame[..3]).unwrap(), None);
        assert_eq!(decode_frame(&[]).unwrap(), None);
        assert_eq!(decode_frame(&[0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = encode_frame("first");
        buf.extend(encode_frame("second"));
        let (one, used) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(one, "first");
        let (two, _) = decode_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(two, "second");
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode_frame(&[2, 0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_runaway_prefix() {
        let err = decode_frame(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        // 0x7fffffff encoded as LEB128
        let err = decode_frame(&[0xff, 0xff, 0xff, 0xff, 0x07]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    // =========================================================================
    // Async framing
    // =========================================================================

    #[tokio::test]
    async fn test_async_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, r#"{"MessageType":"ProtocolVersion"}"#)
            .await
            .unwrap();
        write_frame(&mut client, "second").await.unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.unwrap().as_deref(),
            Some(r#"{"MessageType":"ProtocolVersion"}"#)
        );
        assert_eq!(
            read_frame(&mut server).await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_truncated_body_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[10, b'a', b'b']).await.unwrap();
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_async_large_frame() {
        let message = "z".repeat(20_000);
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &message).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(message));
    }
}
