//! Fixed-size chunking of async byte streams
//!
//! The chunker never holds more than one chunk of input in memory, so
//! arbitrarily large streams can be imported.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size: 256 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Splits an async reader into chunks of at most `chunk_size` bytes.
///
/// Every chunk except the last is exactly `chunk_size` bytes long.
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    eof_reached: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a chunker with the default chunk size
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    /// Create a chunker with a custom chunk size
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            offset: 0,
            eof_reached: false,
        }
    }

    /// Read the next chunk, or `None` once the reader is exhausted
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        while buffer.len() < self.chunk_size {
            let remaining = self.chunk_size - buffer.len();
            let n = (&mut self.reader)
                .take(remaining as u64)
                .read_buf(&mut buffer)
                .await?;
            if n == 0 {
                self.eof_reached = true;
                break;
            }
        }

        if buffer.is_empty() {
            return Ok(None);
        }

        self.offset += buffer.len() as u64;
        Ok(Some(buffer.freeze()))
    }
}

impl<R> Chunker<R> {
    /// The configured chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of bytes handed out so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the underlying reader has reported EOF
    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
        let mut chunker = Chunker::with_chunk_size(data, chunk_size);
        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_partial_last_chunk() {
        let chunks = collect(b"hello world", 5).await;
        assert_eq!(chunks, vec![&b"hello"[..], &b" worl"[..], &b"d"[..]]);
    }

    #[tokio::test]
    async fn test_exact_boundary_has_no_empty_tail() {
        let chunks = collect(b"0123456789", 5).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], &b"56789"[..]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut chunker = Chunker::with_chunk_size(&b""[..], 64);
        assert_eq!(chunker.next_chunk().await.unwrap(), None);
        assert!(chunker.is_eof());
        assert_eq!(chunker.next_chunk().await.unwrap(), None);
        assert_eq!(chunker.offset(), 0);
    }

    #[tokio::test]
    async fn test_slow_reader_still_fills_chunks() {
        // The mock hands out 3 bytes per read
        let mut reader = trickling_reader();
        let mut chunker = Chunker::with_chunk_size(&mut reader, 8);
        let first = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 8);
        let second = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 4);
        assert_eq!(chunker.offset(), 12);
        assert_eq!(chunker.next_chunk().await.unwrap(), None);
    }

    fn trickling_reader() -> impl AsyncRead + Unpin {
        let (mut tx, rx) = tokio::io::duplex(3);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(b"abcdefghijkl").await.unwrap();
        });
        rx
    }

    #[tokio::test]
    async fn test_large_input_preserves_bytes() {
        let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let chunks = collect(&data, DEFAULT_CHUNK_SIZE).await;

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == DEFAULT_CHUNK_SIZE));
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be greater than 0")]
    fn test_zero_chunk_size_panics() {
        let _chunker = Chunker::with_chunk_size(&b"test"[..], 0);
    }
}
