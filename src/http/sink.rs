//! Destinations for streamed response bodies.
//!
//! A download that fails halfway can only be retried if whatever was already
//! written can be overwritten. [`Rewindable`] remembers where the first attempt
//! started writing and seeks back there; [`Forward`] cannot go back, so
//! downloads into it are attempted once.

use std::io::{self, Seek, SeekFrom, Write};

use async_trait::async_trait;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Blocking download destination.
pub trait Sink {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn is_rewindable(&self) -> bool;

    /// Moves back to the position of the first attempt.
    fn rewind(&mut self) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Cooperative download destination.
#[async_trait]
pub trait AsyncSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn is_rewindable(&self) -> bool;

    async fn rewind(&mut self) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;
}

/// A seekable writer, rewound to its starting position before every retry.
#[derive(Debug)]
pub struct Rewindable<W> {
    inner: W,
    origin: u64,
}

impl<W> Rewindable<W> {
    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> Rewindable<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        let origin = inner.stream_position()?;
        Ok(Self { inner, origin })
    }
}

impl<W: AsyncWrite + AsyncSeek + Unpin> Rewindable<W> {
    pub async fn new_async(mut inner: W) -> io::Result<Self> {
        let origin = inner.stream_position().await?;
        Ok(Self { inner, origin })
    }
}

impl<W: Write + Seek> Sink for Rewindable<W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.inner.write_all(chunk)
    }

    fn is_rewindable(&self) -> bool {
        true
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.origin))?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[async_trait]
impl<W: AsyncWrite + AsyncSeek + Unpin + Send> AsyncSink for Rewindable<W> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.inner.write_all(chunk).await
    }

    fn is_rewindable(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.origin)).await?;
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

/// A forward-only writer. Downloads into it are never retried.
#[derive(Debug)]
pub struct Forward<W> {
    inner: W,
    written: u64,
}

impl<W> Forward<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Sink for Forward<W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.inner.write_all(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn is_rewindable(&self) -> bool {
        false
    }

    fn rewind(&mut self) -> io::Result<()> {
        forward_rewind(self.written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> AsyncSink for Forward<W> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.inner.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn is_rewindable(&self) -> bool {
        false
    }

    async fn rewind(&mut self) -> io::Result<()> {
        forward_rewind(self.written)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

// Nothing written yet means there is nothing to undo.
fn forward_rewind(written: u64) -> io::Result<()> {
    if written == 0 {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "forward-only sink cannot be rewound",
        ))
    }
}
