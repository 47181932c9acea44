//! STCP is a connection-oriented secure transport that wraps a reliable
//! byte stream (typically TCP) with mutually authenticated, confidential,
//! length-framed delivery.
//!
//! A server listens; a client dials. Both sides derive a per-session
//! symmetric key from an ephemeral X25519 exchange, authenticate it with
//! an HMAC tied to the peers' static keys and a coarse time window, and
//! from then on exchange length-prefixed AEAD records in both directions:
//!
//! ```text
//! | length | ciphertext   | tag |
//! |   2B   | length - 16B | 16B |
//! ```
//!
//! ## Quick start
//!
//! Generate identities with the bundled `stcp-keygen` tool (or
//! [`key::generate`]), exchange public keys out of band, then:
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use stcp::{dial, listen, ClientConfig, ServerConfig, ServerContext};
//!
//! # fn main() -> std::io::Result<()> {
//! // Server side.
//! let mut config = ServerConfig::new();
//! config.private_key = Some(stcp::key::read("id_stcp")?.to_vec());
//! let ctx = Arc::new(ServerContext::new(config).map_err(std::io::Error::from)?);
//! let listener = listen("127.0.0.1:9000", Arc::clone(&ctx))?;
//! let mut conn = listener.accept()?;
//! let mut buf = [0u8; 128];
//! let n = conn.read(&mut buf)?;
//! println!("received {} bytes", n);
//!
//! // Client side.
//! let mut config = ClientConfig::new();
//! config.server_pub = stcp::key::decode("3VoQupYQYGJRGEirnNkbHurxgWaYlQ74m_sM9OGbgHg")?.to_vec();
//! let mut conn = dial("127.0.0.1:9000", config)?;
//! conn.write_all(b"hello")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`ClientConfig`] and [`ServerConfig`] carry the handshake timeout, the
//! time-window tolerance, the cipher choice ([`CipherKind`]) and the key
//! material; both load from YAML. Servers may restrict clients to an
//! authorized key set, and clients may pin server keys per target through
//! [`KnownHosts`]. See the [`config`] module for the full surface.
//!
//! ## Error model
//!
//! Every protocol failure is terminal for its connection: record nonces
//! advance as a side effect of each record, so no failed operation can be
//! retried safely. Errors are surfaced once verbatim and then replayed
//! from the connection's sticky state; see [`Error`].
//!
//! ## Concurrency
//!
//! A connection is designed for the usual one-reader/one-writer duplex
//! idiom. The two directions share no mutable state beyond the carrier:
//! each owns its record buffer and nonce schedule. Blocking happens only
//! in the carrier, so cancellation is expressed through carrier timeouts
//! and [`Conn::close`].
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod key;

mod compress;
mod conn;
mod crypto;
mod handshake;
mod replay_cache;
mod secure;
mod stat;
mod tcp;

pub use config::{ClientConfig, KnownHosts, ServerConfig, ServerContext};
pub use conn::{Carrier, Conn};
pub use crypto::{CipherKind, KEY_SIZE, TAG_SIZE};
pub use error::Error;
pub use tcp::{dial, listen, Dialer, Listener};
