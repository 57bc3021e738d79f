//! Pull-based byte sources
//!
//! [`ByteSource`] is the single reading abstraction the container pipeline is
//! built on: the raw file, the digesting header reader, the decrypted body and
//! the hashed-block stream all implement it, so each layer can wrap the next.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use zeroize::Zeroizing;

/// A pull-based origin of bytes
pub trait ByteSource {
    /// Whether more bytes may be available
    fn can_read(&self) -> bool;

    /// Read up to `n` bytes. Fewer than `n` bytes are returned only when the
    /// source has ended, so a short result never needs to be retried.
    fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Read every remaining byte
    fn read_to_end(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying resource. Further reads return nothing.
    fn close(&mut self);

    /// Read exactly `n` bytes or fail with [`Error::ShortRead`]
    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.read(n)?;
        if bytes.len() != n {
            return Err(Error::ShortRead {
                expected: n,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact_bytes(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(&self.read_exact_bytes(2)?))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read_exact_bytes(4)?))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.read_exact_bytes(8)?))
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        (**self).read(n)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        (**self).read_to_end()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        (**self).read(n)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        (**self).read_to_end()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// An in-memory byte source. The buffer is wiped when the source is closed or dropped.
pub struct SliceSource {
    data: Zeroizing<Vec<u8>>,
    pos: usize,
}

impl SliceSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Zeroizing::new(data.into()),
            pos: 0,
        }
    }

    /// Number of bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Number of bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource {
    fn can_read(&self) -> bool {
        self.pos < self.data.len()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let take = n.min(self.remaining());
        let out = self.data[self.pos..self.pos + take].to_vec();
        self.pos += take;
        Ok(out)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let out = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        Ok(out)
    }

    fn close(&mut self) {
        self.data = Zeroizing::new(Vec::new());
        self.pos = 0;
    }
}

impl std::fmt::Debug for SliceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceSource")
            .field("len", &self.data.len())
            .field("pos", &self.pos)
            .finish()
    }
}

/// A byte source over any [`std::io::Read`], typically an open file
#[derive(Debug)]
pub struct ReaderSource<R: Read> {
    inner: Option<R>,
    eof: bool,
}

impl ReaderSource<BufReader<File>> {
    /// Open the file at `path` for reading.
    ///
    /// The handle is released by [`ByteSource::close`] or when the source is
    /// dropped, whichever comes first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Some(reader),
            eof: false,
        }
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn can_read(&self) -> bool {
        self.inner.is_some() && !self.eof
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let Some(reader) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        // Grows with the data actually present, so a bogus length prefix
        // cannot force a huge allocation up front.
        let mut buf = Vec::new();
        let filled = Read::read_to_end(&mut reader.take(n as u64), &mut buf)?;
        if filled < n {
            self.eof = true;
        }
        Ok(buf)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let Some(reader) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        Read::read_to_end(reader, &mut out)?;
        self.eof = true;
        Ok(out)
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

/// Adapts a [`ByteSource`] back into [`std::io::Read`], so stream transforms
/// such as decompression can pull from it directly
pub struct IoReader<S: ByteSource>(pub S);

impl<S: ByteSource> Read for IoReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.0.read(buf.len()).map_err(|e| match e {
            Error::Io(io) => io,
            other => std::io::Error::other(other),
        })?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}
