//! Wire codec for the increment protocol.
//!
//! Requests and responses share one frame format: a single unsigned 64-bit
//! integer in little-endian byte order. There is no header, length prefix
//! or delimiter.
//!
//! ```text
//! Request:  [amount: u64 LE]      (8 bytes)
//! Response: [new counter: u64 LE] (8 bytes)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of every request and response frame in bytes
pub const FRAME_LEN: usize = 8;

/// Append one frame holding `value` to `dst`.
pub fn encode(value: u64, dst: &mut BytesMut) {
    dst.reserve(FRAME_LEN);
    dst.put_u64_le(value);
}

/// Take one frame from the front of `src`.
///
/// Returns `None` and leaves `src` untouched if fewer than
/// [`FRAME_LEN`] bytes are buffered.
pub fn decode<B: Buf>(src: &mut B) -> Option<u64> {
    if src.remaining() < FRAME_LEN {
        return None;
    }
    Some(src.get_u64_le())
}

/// Errors produced while reading a frame
#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the stream on a frame boundary.
    Closed,
    /// The stream ended part way through a frame.
    Truncated { received: usize },
    /// Any other I/O failure.
    Io(io::Error),
}

impl ReadError {
    /// True for a clean end-of-stream, which is an expected way for a
    /// connection to finish.
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Closed => write!(f, "end of stream"),
            ReadError::Truncated { received } => write!(
                f,
                "stream ended after {} of {} frame bytes",
                received, FRAME_LEN
            ),
            ReadError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Read exactly one frame from `reader`.
///
/// Blocks until all [`FRAME_LEN`] bytes have arrived. A peer that closes
/// before sending any byte of the frame yields [`ReadError::Closed`]; one
/// that closes mid-frame yields [`ReadError::Truncated`].
pub async fn read_u64<R>(reader: &mut R) -> Result<u64, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; FRAME_LEN];
    let mut filled = 0;

    while filled < FRAME_LEN {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ReadError::Closed
            } else {
                ReadError::Truncated { received: filled }
            });
        }
        filled += n;
    }

    let mut buf = &frame[..];
    Ok(buf.get_u64_le())
}

/// Write one frame to `writer` and flush it.
///
/// The flush matters for buffered writers: the peer is blocked waiting for
/// this frame before it sends the next request.
pub async fn write_u64<W>(writer: &mut W, value: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(FRAME_LEN);
    encode(value, &mut frame);
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_is_little_endian() {
        let mut buf = BytesMut::new();
        encode(0x0102_0304_0506_0708, &mut buf);
        assert_eq!(&buf[..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_decode_needs_full_frame() {
        let mut partial = &[1u8, 0, 0][..];
        assert_eq!(decode(&mut partial), None);
        assert_eq!(partial.len(), 3);

        let mut full = &[42u8, 0, 0, 0, 0, 0, 0, 0, 9][..];
        assert_eq!(decode(&mut full), Some(42));
        assert_eq!(full, &[9]);
    }

    #[tokio::test]
    async fn test_read_frame() {
        let mut stream = Builder::new().read(&5u64.to_le_bytes()).build();
        assert_eq!(read_u64(&mut stream).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_read_frame_split_across_reads() {
        let bytes = u64::MAX.to_le_bytes();
        let mut stream = Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..7])
            .read(&bytes[7..])
            .build();
        assert_eq!(read_u64(&mut stream).await.unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn test_read_clean_close() {
        let mut stream = Builder::new().build();
        let err = read_u64(&mut stream).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_read_truncated_frame() {
        let mut stream = Builder::new().read(&[1, 2, 3]).build();
        match read_u64(&mut stream).await {
            Err(ReadError::Truncated { received: 3 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_io_error() {
        let mut stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        match read_u64(&mut stream).await {
            Err(ReadError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut stream = Builder::new().write(&9u64.to_le_bytes()).build();
        write_u64(&mut stream, 9).await.unwrap();
    }
}
