//! Wire codec: fixed-width primitives and deadline-bounded stream access.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Booleans and short lengths are one byte. Strings carry no terminator;
//! their length always travels in an earlier field.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::timeout;

use crate::error::{ProtocolError, Result, SyncError};

/// Largest value a one-byte length field can carry.
pub const MAX_SHORT_LEN: usize = u8::MAX as usize;

// =============================================================================
// Encoding
// =============================================================================

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a one-byte length, failing if `len` does not fit.
pub fn put_len(buf: &mut BytesMut, field: &'static str, len: usize) -> Result<()> {
    let byte = u8::try_from(len).map_err(|_| ProtocolError::FieldTooLong { field, len })?;
    buf.put_u8(byte);
    Ok(())
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Raw string bytes; the length was written separately.
pub fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
}

// =============================================================================
// Decoding
// =============================================================================

pub fn get_bool<B: Buf>(buf: &mut B) -> bool {
    buf.get_u8() == 1
}

pub fn get_len<B: Buf>(buf: &mut B) -> usize {
    usize::from(buf.get_u8())
}

pub fn get_u32<B: Buf>(buf: &mut B) -> u32 {
    buf.get_u32()
}

pub fn decode_str(raw: Vec<u8>, field: &'static str) -> Result<String> {
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(field).into())
}

async fn with_deadline<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SyncError::Transport(e)),
        Err(_) => Err(SyncError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

// =============================================================================
// Stream wrappers
// =============================================================================

/// Read side of a connection. Every read is exact and bounded by a deadline.
pub struct WireReader<R> {
    inner: R,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Read the one-byte frame header. `None` means the peer closed the stream.
    pub async fn read_header(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = with_deadline("read frame header", self.timeout, self.inner.read(&mut byte))
            .await?;
        Ok((n == 1).then_some(byte[0]))
    }

    /// Fill `buf` completely. A short read is a transport fault.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        with_deadline("read", self.timeout, self.inner.read_exact(buf)).await?;
        Ok(())
    }

    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_string(&mut self, len: usize, field: &'static str) -> Result<String> {
        let mut raw = vec![0u8; len];
        self.read_exact(&mut raw).await?;
        decode_str(raw, field)
    }
}

/// Write side of a connection, buffered. Flushes are explicit.
pub struct WireWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self {
            inner: BufWriter::new(inner),
            timeout,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        with_deadline("write", self.timeout, self.inner.write_all(buf)).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        with_deadline("flush", self.timeout, self.inner.flush()).await
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        with_deadline("shutdown", self.timeout, self.inner.shutdown()).await
    }

    /// Unwrap the stream. Unflushed bytes are dropped.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_primitives_layout() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);
        put_len(&mut buf, "path", 255).unwrap();
        put_u32(&mut buf, 0x0102_0304);
        put_str(&mut buf, "ab");

        assert_eq!(&buf[..], &[1, 0, 255, 1, 2, 3, 4, b'a', b'b']);

        let mut rd = buf.freeze();
        assert!(get_bool(&mut rd));
        assert!(!get_bool(&mut rd));
        assert_eq!(get_len(&mut rd), 255);
        assert_eq!(get_u32(&mut rd), 0x0102_0304);
        assert_eq!(&rd[..], b"ab");
    }

    #[test]
    fn test_only_one_is_true() {
        let mut rd: &[u8] = &[2];
        assert!(!get_bool(&mut rd));
    }

    #[test]
    fn test_len_overflow() {
        let mut buf = BytesMut::new();
        let err = put_len(&mut buf, "username", 256).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::FieldTooLong {
                field: "username",
                len: 256
            })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let err = decode_str(vec![0xff, 0xfe], "path").unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::InvalidUtf8("path"))
        ));
    }

    #[tokio::test]
    async fn test_header_on_closed_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = WireReader::new(server, SECOND);
        assert_eq!(reader.read_header().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_short_read_is_transport_fault() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);

        let mut reader = WireReader::new(server, SECOND);
        let err = reader.read_array::<4>().await.unwrap_err();
        match err {
            SyncError::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = WireReader::new(server, Duration::from_millis(50));
        let err = reader.read_array::<1>().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_writer_buffers_until_flush() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut writer = WireWriter::new(client, SECOND);
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
