//! The connection object and the carrier contract it runs on.

use core::fmt::{Debug, Formatter};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crate::{
    compress::{CompressedReader, CompressedWriter},
    config::{ClientConfig, ServerContext},
    crypto::SessionAead,
    error::{downcast_io, Error},
    handshake::{client_handshake, server_handshake, SessionSecrets},
    secure::{NonceSequence, SecureReader, SecureWriter},
    stat::{Metered, TrafficStat},
};

/// The duplex byte-stream contract the protocol runs on.
///
/// A carrier is a reliable, ordered stream with wall-clock I/O timeouts
/// and an idempotent close, accessed through a shared handle: both record
/// stacks of a connection read and write concurrently through the same
/// carrier, so all methods take `&self`. [`TcpStream`] is the canonical
/// implementation.
pub trait Carrier: Send + Sync {
    /// Reads into `buf`, returning the number of bytes read. Zero means
    /// end-of-stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flushes buffered bytes, if the carrier buffers at all.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Sets or clears the read timeout.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Sets or clears the write timeout.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Sets or clears both timeouts.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    /// Shuts the carrier down. Subsequent reads and writes fail promptly.
    fn close(&self) -> io::Result<()>;

    /// The local address, when the carrier has one.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The peer address, when the carrier has one.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Carrier for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream: &TcpStream = self;
        Read::read(&mut stream, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream: &TcpStream = self;
        Write::write(&mut stream, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

enum Role {
    Client(Box<ClientConfig>),
    Server(Arc<ServerContext>),
}

enum ReadStack<C: Carrier> {
    Plain(SecureReader<Metered<C>>),
    Compressed(CompressedReader<SecureReader<Metered<C>>>),
}

enum WriteStack<C: Carrier> {
    Plain(SecureWriter<Metered<C>>),
    Compressed(CompressedWriter<SecureWriter<Metered<C>>>),
}

struct Stacks<C: Carrier> {
    reader: ReadStack<C>,
    writer: WriteStack<C>,
}

enum State<C: Carrier> {
    /// Created; the handshake has not run yet.
    Pending,
    /// Handshake succeeded; the record stacks are installed.
    Ready(Stacks<C>),
    /// Handshake failed, or the connection was closed. Sticky.
    Failed(Error),
}

/// A secure connection over a [`Carrier`].
///
/// The connection is created in a pre-handshake state; the first `read`,
/// `write` or explicit [`handshake`] call runs the handshake exactly once.
/// A failed handshake is sticky: every subsequent operation returns the
/// recorded error. All record-layer errors are equally terminal, because
/// nonces advance on every record and a retry could never be correct.
///
/// [`handshake`]: Conn::handshake
pub struct Conn<C: Carrier> {
    carrier: Arc<C>,
    role: Role,
    state: State<C>,
    stat: Arc<TrafficStat>,
    plain_read: AtomicU64,
    plain_written: AtomicU64,
    counted: bool,
    closed: bool,
}

impl<C: Carrier> Conn<C> {
    /// Wraps `carrier` as the client side of a connection.
    ///
    /// No I/O happens until the handshake runs.
    pub fn client(carrier: C, config: ClientConfig) -> Self {
        Self::new(carrier, Role::Client(Box::new(config)))
    }

    /// Wraps `carrier` as the server side of a connection bound to a
    /// shared server context.
    pub fn server(carrier: C, ctx: Arc<ServerContext>) -> Self {
        Self::new(carrier, Role::Server(ctx))
    }

    fn new(carrier: C, role: Role) -> Self {
        Self {
            carrier: Arc::new(carrier),
            role,
            state: State::Pending,
            stat: Arc::new(TrafficStat::default()),
            plain_read: AtomicU64::new(0),
            plain_written: AtomicU64::new(0),
            counted: false,
            closed: false,
        }
    }

    /// Marks this connection as holding a slot in the server context's
    /// connection counter; the slot is released on close.
    pub(crate) fn mark_counted(&mut self) {
        self.counted = true;
    }

    /// Runs the handshake if it has not run yet.
    ///
    /// The first caller performs the exchange under the configured
    /// handshake timeout; everyone after that observes the recorded
    /// outcome.
    pub fn handshake(&mut self) -> Result<(), Error> {
        match &self.state {
            State::Ready(_) => return Ok(()),
            State::Failed(err) => return Err(err.clone()),
            State::Pending => {}
        }
        match self.run_handshake() {
            Ok(stacks) => {
                self.state = State::Ready(stacks);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%err, "handshake failed");
                self.state = State::Failed(err.clone());
                Err(err)
            }
        }
    }

    fn run_handshake(&mut self) -> Result<Stacks<C>, Error> {
        let mut wire = Metered::new(Arc::clone(&self.carrier), Arc::clone(&self.stat));
        let carrier_err = |e: io::Error| Error::Carrier(e.kind());

        let (secrets, compression) = match &self.role {
            Role::Client(config) => {
                let timeout = config.effective_handshake_timeout();
                self.carrier
                    .set_write_timeout(Some(timeout))
                    .map_err(carrier_err)?;
                let result = client_handshake(&mut wire, config);
                let cleared = self.carrier.set_write_timeout(None);
                let secrets = result.map_err(handshake_error)?;
                cleared.map_err(carrier_err)?;
                (secrets, config.compression)
            }
            Role::Server(ctx) => {
                let timeout = ctx.config().effective_handshake_timeout();
                self.carrier
                    .set_read_timeout(Some(timeout))
                    .map_err(carrier_err)?;
                let result = server_handshake(&mut wire, ctx);
                let cleared = self.carrier.set_read_timeout(None);
                let secrets = result.map_err(handshake_error)?;
                cleared.map_err(carrier_err)?;
                (secrets, ctx.config().compression)
            }
        };

        Ok(build_stacks(wire, &secrets, compression))
    }

    /// Idempotently closes the connection: record buffers are released,
    /// the connection is marked failed and the carrier is shut down.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let State::Ready(stacks) = &mut self.state {
            match &mut stacks.reader {
                ReadStack::Plain(r) => r.close(),
                ReadStack::Compressed(r) => r.get_mut().close(),
            }
            match &mut stacks.writer {
                WriteStack::Plain(w) => w.close(),
                WriteStack::Compressed(w) => w.get_mut().close(),
            }
        }
        self.state = State::Failed(Error::ClosedPipe);
        if self.counted {
            if let Role::Server(ctx) = &self.role {
                ctx.release_conn();
            }
            self.counted = false;
        }
        self.carrier.close()
    }

    /// Byte counters: `(plaintext read, plaintext written, wire read,
    /// wire written)`. Wire counters include the handshake packet.
    pub fn stat(&self) -> (u64, u64, u64, u64) {
        let (wire_read, wire_written) = self.stat.totals();
        (
            self.plain_read.load(Ordering::Relaxed),
            self.plain_written.load(Ordering::Relaxed),
            wire_read,
            wire_written,
        )
    }

    /// The carrier's local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.check_open()?;
        self.carrier.local_addr()
    }

    /// The carrier's peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.check_open()?;
        self.carrier.peer_addr()
    }

    /// Sets or clears the carrier's read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.check_open()?;
        self.carrier.set_read_timeout(timeout)
    }

    /// Sets or clears the carrier's write timeout.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.check_open()?;
        self.carrier.set_write_timeout(timeout)
    }

    /// Sets or clears both carrier timeouts.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.check_open()?;
        self.carrier.set_timeout(timeout)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(Error::ClosedPipe.into());
        }
        Ok(())
    }
}

impl<C: Carrier> Read for Conn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handshake()?;
        let State::Ready(stacks) = &mut self.state else {
            return Err(Error::ClosedPipe.into());
        };
        let n = match &mut stacks.reader {
            ReadStack::Plain(reader) => reader.read(buf)?,
            ReadStack::Compressed(reader) => reader.read(buf)?,
        };
        self.plain_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<C: Carrier> Write for Conn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handshake()?;
        let State::Ready(stacks) = &mut self.state else {
            return Err(Error::ClosedPipe.into());
        };
        let n = match &mut stacks.writer {
            WriteStack::Plain(writer) => writer.write(buf)?,
            WriteStack::Compressed(writer) => writer.write(buf)?,
        };
        self.plain_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            State::Ready(stacks) => match &mut stacks.writer {
                WriteStack::Plain(_) => Ok(()),
                WriteStack::Compressed(writer) => writer.flush(),
            },
            State::Pending => Ok(()),
            State::Failed(err) => Err(err.clone().into()),
        }
    }
}

impl<C: Carrier> Drop for Conn<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<C: Carrier> Debug for Conn<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Pending => "pre-handshake",
            State::Ready(_) => "ready",
            State::Failed(_) => "failed",
        };
        let role = match &self.role {
            Role::Client(_) => "client",
            Role::Server(_) => "server",
        };
        f.debug_struct("Conn")
            .field("role", &role)
            .field("state", &state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Maps a handshake I/O failure onto the error taxonomy: protocol errors
/// pass through, expired deadlines become [`Error::HandshakeTimeout`] and
/// everything else is a carrier failure.
fn handshake_error(e: io::Error) -> Error {
    if let Some(protocol) = downcast_io(&e) {
        return protocol.clone();
    }
    if Error::is_timeout_kind(e.kind()) {
        return Error::HandshakeTimeout;
    }
    Error::Carrier(e.kind())
}

fn build_stacks<C: Carrier>(
    wire: Metered<C>,
    secrets: &SessionSecrets,
    compression: bool,
) -> Stacks<C> {
    let reader = SecureReader::new(
        wire.clone(),
        SessionAead::new(secrets.cipher, &secrets.session_key),
        NonceSequence::new(secrets.base_nonce()),
    );
    let writer = SecureWriter::new(
        wire,
        SessionAead::new(secrets.cipher, &secrets.session_key),
        NonceSequence::new(secrets.base_nonce()),
    );
    if compression {
        Stacks {
            reader: ReadStack::Compressed(CompressedReader::new(reader)),
            writer: WriteStack::Compressed(CompressedWriter::new(writer)),
        }
    } else {
        Stacks {
            reader: ReadStack::Plain(reader),
            writer: WriteStack::Plain(writer),
        }
    }
}
