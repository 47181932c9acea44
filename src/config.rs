//! Configuration for clients, servers and the keygen tooling.
//!
//! Configs are plain structs with sensible defaults and can be loaded from
//! YAML. Key material is carried as raw bytes in memory and encoded as
//! unpadded base64url (RFC 4648 §5) in YAML files, the same encoding the
//! key files and `stcp-keygen` use.
//!
//! # Example
//!
//! ```yaml
//! # client.yaml
//! handshake_timeout: 30
//! tolerance: 120
//! crypto_type: aes-256-gcm
//! private_key: vVdrBkSFqLSONN0JRN0xA_9B6yVjT5xlIQh4761f9FY
//! server_pub: 3VoQupYQYGJRGEirnNkbHurxgWaYlQ74m_sM9OGbgHg
//! ```

use core::fmt::{Debug, Formatter};
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{CipherKind, KEY_SIZE},
    error::{Error, InvalidConfig},
    replay_cache::ReplayCache,
};

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time-window tolerance in seconds.
pub const DEFAULT_TOLERANCE: u64 = 120;

/// Default cap on concurrently accepted server connections.
pub const DEFAULT_MAX_CONNS: usize = 1024;

fn default_handshake_timeout() -> Duration {
    DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_tolerance() -> u64 {
    DEFAULT_TOLERANCE
}

fn default_crypto_type() -> String {
    CipherKind::default().name().to_string()
}

fn default_max_conns() -> usize {
    DEFAULT_MAX_CONNS
}

/// Configuration for the client side of a connection.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for the whole handshake exchange. A zero duration falls
    /// back to [`DEFAULT_HANDSHAKE_TIMEOUT`].
    #[serde(default = "default_handshake_timeout", with = "serde_secs")]
    pub handshake_timeout: Duration,

    /// Time-window tolerance in seconds. Client and server agree only when
    /// both clocks fall into the same `floor(unix / tolerance)` bucket.
    #[serde(default = "default_tolerance")]
    pub tolerance: u64,

    /// Record-layer cipher name; see [`CipherKind::from_name`].
    #[serde(default = "default_crypto_type")]
    pub crypto_type: String,

    /// Static X25519 private key. When absent an ephemeral key is
    /// generated for the handshake, which forfeits the server's
    /// authorized-keys check.
    #[serde(default, with = "serde_b64::opt")]
    pub private_key: Option<Vec<u8>>,

    /// The server's pinned X25519 public key. Required.
    #[serde(default, with = "serde_b64::bytes")]
    pub server_pub: Vec<u8>,

    /// Layer a streaming compressor under the record layer. Both endpoints
    /// must agree. Off by default; compression can leak plaintext
    /// structure through record sizes.
    #[serde(default)]
    pub compression: bool,
}

impl ClientConfig {
    /// Creates a config with default settings and no keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a client config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> io::Result<Self> {
        from_yaml(path.as_ref())
    }

    pub(crate) fn cipher(&self) -> Result<CipherKind, Error> {
        CipherKind::from_name(&self.crypto_type)
    }

    pub(crate) fn checked_tolerance(&self) -> Result<u64, Error> {
        checked_tolerance(self.tolerance)
    }

    pub(crate) fn server_pub_bytes(&self) -> Result<[u8; KEY_SIZE], Error> {
        if self.server_pub.is_empty() {
            return Err(InvalidConfig::MissingServerKey.into());
        }
        key_array(&self.server_pub)
    }

    pub(crate) fn private_key_bytes(&self) -> Result<Option<[u8; KEY_SIZE]>, Error> {
        match &self.private_key {
            Some(key) => Ok(Some(key_array(key)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn effective_handshake_timeout(&self) -> Duration {
        effective_timeout(self.handshake_timeout)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tolerance: DEFAULT_TOLERANCE,
            crypto_type: default_crypto_type(),
            private_key: None,
            server_pub: Vec::new(),
            compression: false,
        }
    }
}

impl Debug for ClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tolerance", &self.tolerance)
            .field("crypto_type", &self.crypto_type)
            .field("private_key", &self.private_key.as_ref().map(|_| "*****"))
            .field("server_pub", &URL_SAFE_NO_PAD.encode(&self.server_pub))
            .field("compression", &self.compression)
            .finish()
    }
}

/// Configuration for the server side of a listener.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Deadline for the whole handshake exchange. A zero duration falls
    /// back to [`DEFAULT_HANDSHAKE_TIMEOUT`].
    #[serde(default = "default_handshake_timeout", with = "serde_secs")]
    pub handshake_timeout: Duration,

    /// Time-window tolerance in seconds; also bounds the replay cache.
    #[serde(default = "default_tolerance")]
    pub tolerance: u64,

    /// Record-layer cipher name; see [`CipherKind::from_name`].
    #[serde(default = "default_crypto_type")]
    pub crypto_type: String,

    /// The server's static X25519 private key. Required.
    #[serde(default, with = "serde_b64::opt")]
    pub private_key: Option<Vec<u8>>,

    /// Maximum number of concurrently accepted connections. Zero means
    /// unlimited.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Client public keys accepted by the handshake. When this set (merged
    /// with [`authorized_path`]) is empty, every client key is accepted.
    ///
    /// [`authorized_path`]: ServerConfig::authorized_path
    #[serde(default, with = "serde_b64::list")]
    pub authorized_keys: Vec<Vec<u8>>,

    /// Path to a file of authorized client keys, one base64url key per
    /// line; `#` starts a comment.
    #[serde(default)]
    pub authorized_path: Option<PathBuf>,

    /// Accept handshakes from the adjacent time buckets `now - 1` and
    /// `now + 1` in addition to `now`. Off by default: the strict policy
    /// rejects clients whose clocks sit right on a bucket boundary.
    #[serde(default)]
    pub accept_adjacent_windows: bool,

    /// Layer a streaming compressor under the record layer. Both endpoints
    /// must agree. Off by default.
    #[serde(default)]
    pub compression: bool,
}

impl ServerConfig {
    /// Creates a config with default settings and no keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a server config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> io::Result<Self> {
        from_yaml(path.as_ref())
    }

    pub(crate) fn cipher(&self) -> Result<CipherKind, Error> {
        CipherKind::from_name(&self.crypto_type)
    }

    pub(crate) fn checked_tolerance(&self) -> Result<u64, Error> {
        checked_tolerance(self.tolerance)
    }

    pub(crate) fn private_key_bytes(&self) -> Result<[u8; KEY_SIZE], Error> {
        match &self.private_key {
            Some(key) => key_array(key),
            None => Err(InvalidConfig::MissingPrivateKey.into()),
        }
    }

    pub(crate) fn effective_handshake_timeout(&self) -> Duration {
        effective_timeout(self.handshake_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tolerance: DEFAULT_TOLERANCE,
            crypto_type: default_crypto_type(),
            private_key: None,
            max_conns: DEFAULT_MAX_CONNS,
            authorized_keys: Vec::new(),
            authorized_path: None,
            accept_adjacent_windows: false,
            compression: false,
        }
    }
}

impl Debug for ServerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tolerance", &self.tolerance)
            .field("crypto_type", &self.crypto_type)
            .field("private_key", &self.private_key.as_ref().map(|_| "*****"))
            .field("max_conns", &self.max_conns)
            .field("authorized_keys", &self.authorized_keys.len())
            .field("authorized_path", &self.authorized_path)
            .field("accept_adjacent_windows", &self.accept_adjacent_windows)
            .field("compression", &self.compression)
            .finish()
    }
}

/// Shared server state: the configuration, the replay cache with its
/// sweeper, the resolved authorized-key set and the connection counter.
///
/// One context backs all connections accepted by a [`Listener`]; closing
/// it stops the sweeper and makes every subsequent handshake fail its
/// replay check.
///
/// [`Listener`]: crate::Listener
#[derive(Debug)]
pub struct ServerContext {
    config: ServerConfig,
    authorized: HashSet<[u8; KEY_SIZE]>,
    replay: ReplayCache,
    active_conns: AtomicUsize,
}

impl ServerContext {
    /// Builds a context from a config, loading the authorized-keys file if
    /// one is configured and starting the replay sweeper.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let mut authorized = HashSet::new();
        for key in &config.authorized_keys {
            authorized.insert(key_array(key)?);
        }
        if let Some(path) = &config.authorized_path {
            load_authorized_file(path, &mut authorized)?;
        }
        let replay = ReplayCache::start(config.checked_tolerance()?);
        Ok(Self {
            config,
            authorized,
            replay,
            active_conns: AtomicUsize::new(0),
        })
    }

    /// The configuration this context was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stops the replay sweeper and marks the context closed. Idempotent.
    /// Handshakes performed after this refuse every client.
    pub fn close(&self) {
        self.replay.close();
    }

    pub(crate) fn check_replay(&self, id: u64, now: u64) -> bool {
        self.replay.check(id, now)
    }

    pub(crate) fn is_authorized(&self, key: &[u8; KEY_SIZE]) -> bool {
        self.authorized.is_empty() || self.authorized.contains(key)
    }

    pub(crate) fn try_acquire_conn(&self) -> bool {
        let limit = self.config.max_conns;
        if limit == 0 {
            return true;
        }
        self.active_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_conn(&self) {
        let prev = self.active_conns.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

/// Map from `host:port` to a pinned server public key.
///
/// Lets clients that talk to several servers keep all the pins in one
/// YAML file and fill [`ClientConfig::server_pub`] per dial target.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KnownHosts {
    #[serde(default, with = "serde_b64::map")]
    hosts: HashMap<String, Vec<u8>>,
}

impl KnownHosts {
    /// Loads a known-hosts map from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> io::Result<Self> {
        from_yaml(path.as_ref())
    }

    /// Looks up the pinned key for `host` (a `host:port` string).
    pub fn host_key(&self, host: &str) -> Option<&[u8]> {
        self.hosts.get(host).map(Vec::as_slice)
    }

    /// Pins `key` for `host`.
    pub fn insert(&mut self, host: impl Into<String>, key: impl Into<Vec<u8>>) {
        self.hosts.insert(host.into(), key.into());
    }
}

fn from_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = fs::File::open(path)?;
    serde_yaml::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn key_array(key: &[u8]) -> Result<[u8; KEY_SIZE], Error> {
    key.try_into().map_err(|_| {
        InvalidConfig::BadKeyLength {
            expected: KEY_SIZE,
            received: key.len(),
        }
        .into()
    })
}

fn checked_tolerance(tolerance: u64) -> Result<u64, Error> {
    if tolerance == 0 {
        return Err(InvalidConfig::ZeroTolerance.into());
    }
    Ok(tolerance)
}

fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_HANDSHAKE_TIMEOUT
    } else {
        timeout
    }
}

fn load_authorized_file(path: &Path, into: &mut HashSet<[u8; KEY_SIZE]>) -> Result<(), Error> {
    let bad = || InvalidConfig::BadAuthorizedKeys {
        path: path.display().to_string(),
    };
    let text = fs::read_to_string(path).map_err(|_| bad())?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = URL_SAFE_NO_PAD.decode(line).map_err(|_| bad())?;
        into.insert(key_array(&key).map_err(|_| bad())?);
    }
    Ok(())
}

mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod serde_b64 {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) mod bytes {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&URL_SAFE_NO_PAD.encode(value))
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
            let text = String::deserialize(d)?;
            URL_SAFE_NO_PAD.decode(text).map_err(D::Error::custom)
        }
    }

    pub(super) mod opt {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(
            value: &Option<Vec<u8>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => s.serialize_some(&URL_SAFE_NO_PAD.encode(bytes)),
                None => s.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(text) => URL_SAFE_NO_PAD
                    .decode(text)
                    .map(Some)
                    .map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }

    pub(super) mod list {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(
            value: &[Vec<u8>],
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_seq(value.iter().map(|key| URL_SAFE_NO_PAD.encode(key)))
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Vec<Vec<u8>>, D::Error> {
            Vec::<String>::deserialize(d)?
                .into_iter()
                .map(|text| URL_SAFE_NO_PAD.decode(text).map_err(D::Error::custom))
                .collect()
        }
    }

    pub(super) mod map {
        use super::*;
        use std::collections::HashMap;

        pub(crate) fn serialize<S: Serializer>(
            value: &HashMap<String, Vec<u8>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_map(
                value
                    .iter()
                    .map(|(host, key)| (host, URL_SAFE_NO_PAD.encode(key))),
            )
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
            HashMap::<String, String>::deserialize(d)?
                .into_iter()
                .map(|(host, text)| {
                    URL_SAFE_NO_PAD
                        .decode(text)
                        .map(|key| (host, key))
                        .map_err(D::Error::custom)
                })
                .collect()
        }
    }
}
