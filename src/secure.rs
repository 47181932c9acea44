//! Framed AEAD record layer.
//!
//! Both directions of a session are independent instances of the same
//! scheme: plaintext is chunked into records of at most [`MAX_PAYLOAD`]
//! bytes, each sealed with a deterministic nonce and framed as
//!
//! ```text
//! | length | ciphertext   | tag |
//! |   2B   | length - 16B | 16B |
//! ```
//!
//! where `length` is little-endian and counts ciphertext plus tag. A length
//! of zero is reserved as the end-of-stream marker.
//!
//! The wire nonce for a record is `le_u64(counter) ‖ suffix`, truncated to
//! the cipher's nonce size. The counter is pre-incremented for every record
//! and the suffix never changes, so nonces cannot repeat within a session;
//! sessions that derived different suffixes cannot collide with each other.
//! Counter wrap-around is a silent operational event: the handshake
//! randomizes the initial counter, and a session would have to move 2^64
//! records to come back around.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{SessionAead, MAX_NONCE_SIZE, TAG_SIZE};
use crate::error::Error;

pub(crate) const HEADER_SIZE: usize = 2;
pub(crate) const MAX_PAYLOAD: usize = 4 * 1024;
pub(crate) const MAX_RECORD: usize = HEADER_SIZE + MAX_PAYLOAD + TAG_SIZE;

/// Length of the counter embedded at the head of every nonce.
pub(crate) const COUNTER_SIZE: usize = 8;

/// Per-direction nonce schedule: a 64-bit counter followed by a static
/// suffix taken from the derived base nonce.
#[derive(Debug)]
pub(crate) struct NonceSequence {
    counter: AtomicU64,
    suffix: [u8; MAX_NONCE_SIZE],
    size: usize,
}

impl NonceSequence {
    /// Builds the schedule from a derived base nonce. Bytes `[0..8]` seed
    /// the counter (little-endian), the rest become the static suffix.
    pub(crate) fn new(base: &[u8]) -> Self {
        debug_assert!((COUNTER_SIZE..=MAX_NONCE_SIZE).contains(&base.len()));
        let mut suffix = [0u8; MAX_NONCE_SIZE];
        suffix[COUNTER_SIZE..base.len()].copy_from_slice(&base[COUNTER_SIZE..]);
        Self {
            counter: AtomicU64::new(u64::from_le_bytes(base[..COUNTER_SIZE].try_into().unwrap())),
            suffix,
            size: base.len(),
        }
    }

    /// Advances the counter and composes the next wire nonce.
    ///
    /// Use `&nonce[..self.size()]` of the returned array.
    pub(crate) fn next(&self) -> [u8; MAX_NONCE_SIZE] {
        let id = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut nonce = self.suffix;
        nonce[..COUNTER_SIZE].copy_from_slice(&id.to_le_bytes());
        nonce
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// Seals plaintext into records and pushes them to the inner writer.
#[derive(Debug)]
pub(crate) struct SecureWriter<W> {
    inner: W,
    aead: SessionAead,
    nonce: NonceSequence,
    buf: Option<Vec<u8>>,
    err: Option<Error>,
}

impl<W: Write> SecureWriter<W> {
    pub(crate) fn new(inner: W, aead: SessionAead, nonce: NonceSequence) -> Self {
        Self {
            inner,
            aead,
            nonce,
            buf: Some(vec![0u8; MAX_RECORD]),
            err: None,
        }
    }

    /// Releases the scratch buffer. Idempotent; subsequent writes fail with
    /// [`Error::ClosedPipe`].
    pub(crate) fn close(&mut self) {
        self.buf = None;
        if self.err.is_none() {
            self.err = Some(Error::ClosedPipe);
        }
    }

    /// Chunks `data` into records and writes them out, looping on short
    /// writes until each record is fully flushed.
    ///
    /// Returns the number of plaintext bytes accepted before the first
    /// failure. Any failure is sticky: the nonce for the broken record has
    /// already been consumed, so the session cannot continue.
    pub(crate) fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        if let Some(err) = &self.err {
            return Err(err.clone().into());
        }
        let mut written = 0;
        while !data.is_empty() {
            let chunk = data.len().min(MAX_PAYLOAD);
            if let Err(e) = self.write_record(&data[..chunk]) {
                return if written == 0 { Err(e) } else { Ok(written) };
            }
            written += chunk;
            data = &data[chunk..];
        }
        Ok(written)
    }

    fn write_record(&mut self, chunk: &[u8]) -> io::Result<()> {
        let Some(buf) = self.buf.as_mut() else {
            return Err(Error::ClosedPipe.into());
        };
        let record_len = HEADER_SIZE + chunk.len() + TAG_SIZE;
        buf[..HEADER_SIZE].copy_from_slice(&((chunk.len() + TAG_SIZE) as u16).to_le_bytes());
        buf[HEADER_SIZE..HEADER_SIZE + chunk.len()].copy_from_slice(chunk);

        let nonce = self.nonce.next();
        if let Err(e) = self
            .aead
            .seal(&nonce[..self.nonce.size()], &mut buf[HEADER_SIZE..record_len])
        {
            self.err = Some(e.clone());
            return Err(e.into());
        }

        if let Err(e) = self.inner.write_all(&buf[..record_len]) {
            self.err = Some(Error::Carrier(e.kind()));
            return Err(e);
        }
        Ok(())
    }
}

/// Pulls records from the inner reader and hands out their plaintext.
#[derive(Debug)]
pub(crate) struct SecureReader<R> {
    inner: R,
    aead: SessionAead,
    nonce: NonceSequence,
    buf: Option<Vec<u8>>,
    pos: usize,
    avail: usize,
    eof: bool,
    err: Option<Error>,
}

impl<R: Read> SecureReader<R> {
    pub(crate) fn new(inner: R, aead: SessionAead, nonce: NonceSequence) -> Self {
        Self {
            inner,
            aead,
            nonce,
            buf: Some(vec![0u8; MAX_RECORD]),
            pos: 0,
            avail: 0,
            eof: false,
            err: None,
        }
    }

    /// Releases the scratch buffer. Idempotent; subsequent reads fail with
    /// [`Error::ClosedPipe`].
    pub(crate) fn close(&mut self) {
        self.buf = None;
        self.avail = 0;
        if self.err.is_none() {
            self.err = Some(Error::ClosedPipe);
        }
    }

    /// Copies buffered plaintext into `dst`, pulling and opening the next
    /// record when the buffer is empty. Returns `Ok(0)` at end-of-stream.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.err {
            return Err(err.clone().into());
        }
        if self.avail == 0 {
            if self.eof {
                return Ok(0);
            }
            if !self.fill()? {
                self.eof = true;
                return Ok(0);
            }
        }
        let Some(buf) = self.buf.as_ref() else {
            return Err(Error::ClosedPipe.into());
        };
        let n = dst.len().min(self.avail);
        dst[..n].copy_from_slice(&buf[HEADER_SIZE + self.pos..HEADER_SIZE + self.pos + n]);
        self.pos += n;
        self.avail -= n;
        Ok(n)
    }

    /// Reads and opens one record. Returns `Ok(false)` on a clean
    /// end-of-stream (either the carrier closed at a record boundary or the
    /// peer sent the reserved zero length).
    fn fill(&mut self) -> io::Result<bool> {
        let Some(buf) = self.buf.as_mut() else {
            return Err(Error::ClosedPipe.into());
        };

        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.inner, &mut header) {
            Ok(Filled::Eof) => return Ok(false),
            Ok(Filled::Complete) => {}
            Ok(Filled::Truncated) => {
                self.err = Some(Error::UnexpectedEof);
                return Err(Error::UnexpectedEof.into());
            }
            Err(e) => {
                self.err = Some(Error::Carrier(e.kind()));
                return Err(e);
            }
        }

        let record_len = u16::from_le_bytes(header);
        if record_len == 0 {
            return Ok(false);
        }
        if record_len as usize > MAX_PAYLOAD + TAG_SIZE {
            let err = Error::MessageTooLong {
                received: record_len,
            };
            self.err = Some(err.clone());
            return Err(err.into());
        }
        if record_len as usize <= TAG_SIZE {
            let err = Error::MessageTooShort {
                received: record_len,
            };
            self.err = Some(err.clone());
            return Err(err.into());
        }

        let record_len = record_len as usize;
        match read_full(
            &mut self.inner,
            &mut buf[HEADER_SIZE..HEADER_SIZE + record_len],
        ) {
            Ok(Filled::Complete) => {}
            Ok(Filled::Eof) | Ok(Filled::Truncated) => {
                self.err = Some(Error::UnexpectedEof);
                return Err(Error::UnexpectedEof.into());
            }
            Err(e) => {
                self.err = Some(Error::Carrier(e.kind()));
                return Err(e);
            }
        }

        let nonce = self.nonce.next();
        match self.aead.open(
            &nonce[..self.nonce.size()],
            &mut buf[HEADER_SIZE..HEADER_SIZE + record_len],
        ) {
            Ok(n) => {
                self.pos = 0;
                self.avail = n;
                Ok(true)
            }
            Err(e) => {
                self.err = Some(e.clone());
                Err(e.into())
            }
        }
    }
}

impl<W: Write> Write for SecureWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        SecureWriter::write(self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read> Read for SecureReader<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        SecureReader::read(self, dst)
    }
}

enum Filled {
    /// The whole buffer was filled.
    Complete,
    /// End-of-stream before the first byte.
    Eof,
    /// End-of-stream after at least one byte.
    Truncated,
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Filled> {
    let mut pos = 0;
    while pos < buf.len() {
        match reader.read(&mut buf[pos..]) {
            Ok(0) => {
                return Ok(if pos == 0 {
                    Filled::Eof
                } else {
                    Filled::Truncated
                })
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Filled::Complete)
}
