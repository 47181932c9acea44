//! Optional streaming compression stage.
//!
//! Layered between the caller and the record layer when both endpoints
//! enable it. The writer performs a sync flush on every `write`: without
//! it the encoder could sit on buffered input indefinitely and the peer's
//! record framing would block waiting for bytes that were never emitted.

use std::io::{self, Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};

/// Compressing writer that flushes a complete frame on every write.
#[derive(Debug)]
pub(crate) struct CompressedWriter<W: Write> {
    inner: DeflateEncoder<W>,
}

impl<W: Write> CompressedWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner: DeflateEncoder::new(inner, Compression::default()),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut W {
        self.inner.get_mut()
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf)?;
        self.inner.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pull-based decompressing reader.
#[derive(Debug)]
pub(crate) struct CompressedReader<R: Read> {
    inner: DeflateDecoder<R>,
}

impl<R: Read> CompressedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner: DeflateDecoder::new(inner),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
