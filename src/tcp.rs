//! TCP listener and dialer glue.
//!
//! Thin wrappers that upgrade plain TCP endpoints to [`Conn`]s: the
//! listener hands out pre-handshake server connections bound to a shared
//! [`ServerContext`]; the dialer connects and completes the handshake
//! before returning.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::{ClientConfig, KnownHosts, ServerContext},
    conn::Conn,
    error::Error,
};

/// A listener that upgrades accepted TCP connections.
#[derive(Debug)]
pub struct Listener {
    inner: Option<TcpListener>,
    ctx: Arc<ServerContext>,
}

impl Listener {
    /// Wraps an already-bound TCP listener.
    pub fn new(inner: TcpListener, ctx: Arc<ServerContext>) -> Self {
        Self {
            inner: Some(inner),
            ctx,
        }
    }

    /// Accepts the next connection, in pre-handshake state.
    ///
    /// Connections beyond the context's `max_conns` limit are shut down
    /// immediately and the accept loop continues with the next one.
    pub fn accept(&self) -> io::Result<Conn<TcpStream>> {
        let Some(listener) = &self.inner else {
            return Err(Error::ClosedPipe.into());
        };
        loop {
            let (stream, peer) = listener.accept()?;
            if !self.ctx.try_acquire_conn() {
                tracing::warn!(%peer, "connection limit reached, refusing");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
            tracing::debug!(%peer, "accepted connection");
            let mut conn = Conn::server(stream, Arc::clone(&self.ctx));
            conn.mark_counted();
            return Ok(conn);
        }
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Some(listener) => listener.local_addr(),
            None => Err(Error::ClosedPipe.into()),
        }
    }

    /// The server context backing accepted connections.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Closes the TCP listener and the server context (stopping the
    /// replay sweeper). Idempotent.
    pub fn close(&mut self) {
        self.inner = None;
        self.ctx.close();
    }
}

/// Binds a TCP listener on `addr` serving the given context.
///
/// Fails with [`Error::InvalidConfig`] when the context has no private
/// key, before touching the network.
pub fn listen(addr: impl ToSocketAddrs, ctx: Arc<ServerContext>) -> io::Result<Listener> {
    ctx.config().private_key_bytes().map_err(io::Error::from)?;
    let inner = TcpListener::bind(addr)?;
    Ok(Listener::new(inner, ctx))
}

/// Connects to `addr` and completes the handshake synchronously.
///
/// On handshake failure the TCP connection is closed and the failure is
/// returned.
pub fn dial(addr: impl ToSocketAddrs, config: ClientConfig) -> io::Result<Conn<TcpStream>> {
    config.server_pub_bytes().map_err(io::Error::from)?;
    let stream = TcpStream::connect(addr)?;
    handshake_or_close(Conn::client(stream, config))
}

/// A reusable dialer carrying client configuration, an optional connect
/// timeout and an optional known-hosts map for per-target key pinning.
#[derive(Clone, Debug, Default)]
pub struct Dialer {
    /// Client configuration applied to every dialed connection.
    pub config: ClientConfig,
    /// TCP connect timeout. `None` uses the system default.
    pub timeout: Option<Duration>,
    /// Pinned server keys by `host:port`, consulted when
    /// [`ClientConfig::server_pub`] is empty.
    pub known_hosts: Option<KnownHosts>,
}

impl Dialer {
    /// Creates a dialer around a client config.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            timeout: None,
            known_hosts: None,
        }
    }

    /// Connects to `addr` (a `host:port` string) and completes the
    /// handshake.
    pub fn connect(&self, addr: &str) -> io::Result<Conn<TcpStream>> {
        let mut config = self.config.clone();
        if config.server_pub.is_empty() {
            if let Some(key) = self
                .known_hosts
                .as_ref()
                .and_then(|hosts| hosts.host_key(addr))
            {
                config.server_pub = key.to_vec();
            }
        }
        config.server_pub_bytes().map_err(io::Error::from)?;

        let stream = match self.timeout {
            Some(timeout) => {
                let target = addr
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
                TcpStream::connect_timeout(&target, timeout)?
            }
            None => TcpStream::connect(addr)?,
        };
        handshake_or_close(Conn::client(stream, config))
    }
}

fn handshake_or_close(mut conn: Conn<TcpStream>) -> io::Result<Conn<TcpStream>> {
    if let Err(err) = conn.handshake() {
        let _ = conn.close();
        return Err(err.into());
    }
    Ok(conn)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::InvalidConfig;
    use crate::testutil::{client_key, server_key, server_pub};
    use std::io::{Read as _, Write as _};
    use std::thread;

    fn client_config() -> ClientConfig {
        let mut config = ClientConfig::new();
        config.private_key = Some(client_key().to_vec());
        config.server_pub = server_pub().to_vec();
        config
    }

    fn server_context() -> Arc<ServerContext> {
        let mut config = ServerConfig::new();
        config.private_key = Some(server_key().to_vec());
        Arc::new(ServerContext::new(config).unwrap())
    }

    #[test]
    fn test_listen_dial_echo() {
        let ctx = server_context();
        let listener = listen("127.0.0.1:0", Arc::clone(&ctx)).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut conn = listener.accept().unwrap();
            conn.handshake().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write(&buf[..n]).unwrap();
        });

        let mut conn = dial(addr, client_config()).unwrap();
        conn.write(b"ping over tcp").unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping over tcp");

        server.join().unwrap();
        ctx.close();
    }

    #[test]
    fn test_dial_requires_server_key() {
        let config = ClientConfig::new();
        let err = dial("127.0.0.1:1", config).unwrap_err();
        assert_eq!(
            crate::error::downcast_io(&err),
            Some(&Error::InvalidConfig(InvalidConfig::MissingServerKey))
        );
    }

    #[test]
    fn test_listen_requires_private_key() {
        let ctx = Arc::new(ServerContext::new(ServerConfig::new()).unwrap());
        let err = listen("127.0.0.1:0", ctx).unwrap_err();
        assert_eq!(
            crate::error::downcast_io(&err),
            Some(&Error::InvalidConfig(InvalidConfig::MissingPrivateKey))
        );
    }

    #[test]
    fn test_dialer_uses_known_hosts() {
        let ctx = server_context();
        let listener = listen("127.0.0.1:0", Arc::clone(&ctx)).unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let mut conn = listener.accept().unwrap();
            conn.handshake().unwrap();
        });

        let mut config = client_config();
        config.server_pub = Vec::new();
        let mut hosts = KnownHosts::default();
        hosts.insert(addr.clone(), server_pub().to_vec());
        let dialer = Dialer {
            config,
            timeout: Some(Duration::from_secs(5)),
            known_hosts: Some(hosts),
        };
        let conn = dialer.connect(&addr).unwrap();
        drop(conn);
        server.join().unwrap();
        ctx.close();
    }

    #[test]
    fn test_dialer_unknown_host_fails() {
        let dialer = Dialer {
            config: ClientConfig::new(),
            timeout: None,
            known_hosts: Some(KnownHosts::default()),
        };
        let err = dialer.connect("127.0.0.1:1").unwrap_err();
        assert_eq!(
            crate::error::downcast_io(&err),
            Some(&Error::InvalidConfig(InvalidConfig::MissingServerKey))
        );
    }
}
