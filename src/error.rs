//! All possible protocol errors.
//!
//! Every error in this module is fatal to the connection that produced it.
//! Record-layer state is consumed destructively (the nonce counter advances
//! on every record, sent or received), so there is no correct way to retry
//! a failed operation; the error is recorded and every subsequent call on
//! the same connection observes it.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible protocol errors.
///
/// Errors cross the [`Read`]/[`Write`] boundary wrapped in an [`io::Error`]
/// with [`ErrorKind::Other`]; callers that need to match on the protocol
/// error can downcast the inner error back to this type.
///
/// [`Read`]: std::io::Read
/// [`Write`]: std::io::Write
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The configuration cannot be used for a handshake.
    ///
    /// The parameter provides a hint about which part is unusable.
    InvalidConfig(InvalidConfig),

    /// The underlying carrier failed during a read, write or deadline
    /// operation.
    ///
    /// The first failure is surfaced verbatim as the original I/O error;
    /// this variant preserves its [`ErrorKind`] for subsequent calls.
    Carrier(ErrorKind),

    /// The carrier reached end-of-stream in the middle of a handshake
    /// packet or a record.
    UnexpectedEof,

    /// A record header announced a length larger than the maximum record
    /// size.
    MessageTooLong {
        /// The length field that was received.
        received: u16,
    },

    /// A record header announced a length that cannot even hold the
    /// authentication tag.
    MessageTooShort {
        /// The length field that was received.
        received: u16,
    },

    /// Encryption failed, or decryption failed to authenticate.
    ///
    /// On the read side this usually means the peer used different session
    /// secrets or the data was tampered with in transit.
    Cipher,

    /// The handshake signature did not verify.
    ///
    /// This is returned by the server when the HMAC over the packet prefix
    /// does not match, which also covers peers whose clocks fall into a
    /// different time window.
    Sign,

    /// The server saw a handshake id that is already in its replay cache.
    ReplayAttack {
        /// The duplicated handshake id.
        id: u64,
    },

    /// The client key is not in the server's authorized set.
    UnauthorizedClient,

    /// The handshake deadline expired before the exchange completed.
    HandshakeTimeout,

    /// The connection (or one of its halves) was used after being closed.
    ClosedPipe,
}

/// Configuration defects detected at handshake time.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InvalidConfig {
    /// The server requires a private key and none was configured.
    MissingPrivateKey,

    /// The client requires a pinned server public key and none was
    /// configured.
    MissingServerKey,

    /// A configured key does not have the expected length.
    BadKeyLength {
        /// The expected key length in bytes.
        expected: usize,
        /// The length of the configured key.
        received: usize,
    },

    /// The configured cipher name is not one of the supported set.
    UnsupportedCrypto {
        /// The unrecognized cipher name.
        name: String,
    },

    /// The time-window tolerance is zero, which would make every
    /// handshake fail.
    ZeroTolerance,

    /// The authorized-keys file could not be read or contains an
    /// undecodable key.
    BadAuthorizedKeys {
        /// The offending path.
        path: String,
    },
}

impl Error {
    /// Returns `true` if this I/O error kind indicates an expired deadline.
    pub(crate) fn is_timeout_kind(kind: ErrorKind) -> bool {
        matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidConfig(err) => write!(f, "invalid config: {}", err),
            Error::Carrier(kind) => write!(f, "carrier error: {}", kind),
            Error::UnexpectedEof => write!(f, "unexpected end of stream"),
            Error::MessageTooLong { received } => {
                write!(f, "message too long: received length {}", received)
            }
            Error::MessageTooShort { received } => {
                write!(f, "message too short: received length {}", received)
            }
            Error::Cipher => write!(f, "cipher error"),
            Error::Sign => write!(f, "sign error"),
            Error::ReplayAttack { id } => write!(f, "replay attack: {}", id),
            Error::UnauthorizedClient => write!(f, "unauthorized client key"),
            Error::HandshakeTimeout => write!(f, "handshake timeout"),
            Error::ClosedPipe => write!(f, "closed pipe"),
        }
    }
}

impl Display for InvalidConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            InvalidConfig::MissingPrivateKey => write!(f, "private key is missing"),
            InvalidConfig::MissingServerKey => write!(f, "server public key is missing"),
            InvalidConfig::BadKeyLength { expected, received } => {
                write!(f, "key length {} (expected {})", received, expected)
            }
            InvalidConfig::UnsupportedCrypto { name } => {
                write!(f, "unsupported crypto type {:?}", name)
            }
            InvalidConfig::ZeroTolerance => write!(f, "tolerance must be non-zero"),
            InvalidConfig::BadAuthorizedKeys { path } => {
                write!(f, "bad authorized keys at {:?}", path)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::InvalidConfig(err) => Some(err),
            _ => None,
        }
    }
}

impl error::Error for InvalidConfig {}

impl From<InvalidConfig> for Error {
    fn from(e: InvalidConfig) -> Self {
        Error::InvalidConfig(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<InvalidConfig> for io::Error {
    fn from(e: InvalidConfig) -> Self {
        io::Error::new(ErrorKind::Other, Error::InvalidConfig(e))
    }
}

/// Extracts the protocol error from an I/O error produced by this crate,
/// if there is one.
pub(crate) fn downcast_io(e: &io::Error) -> Option<&Error> {
    e.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_io_round_trip() {
        let io_err: io::Error = Error::ReplayAttack { id: 7 }.into();
        assert_eq!(io_err.kind(), ErrorKind::Other);
        assert_eq!(downcast_io(&io_err), Some(&Error::ReplayAttack { id: 7 }));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Sign.to_string(), "sign error");
        assert_eq!(
            Error::MessageTooLong { received: 4113 }.to_string(),
            "message too long: received length 4113"
        );
        assert_eq!(
            Error::from(InvalidConfig::UnsupportedCrypto {
                name: "rot13".into()
            })
            .to_string(),
            "invalid config: unsupported crypto type \"rot13\""
        );
    }

    #[test]
    fn test_timeout_kinds() {
        assert!(Error::is_timeout_kind(ErrorKind::WouldBlock));
        assert!(Error::is_timeout_kind(ErrorKind::TimedOut));
        assert!(!Error::is_timeout_kind(ErrorKind::BrokenPipe));
    }
}
