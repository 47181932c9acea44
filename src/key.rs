//! Identity key files.
//!
//! Private keys are X25519 scalars stored as unpadded base64url
//! (RFC 4648 §5) in a file readable only by its owner. The same encoding
//! is used for public keys everywhere they appear in configs.

use std::fs;
use std::io;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::crypto::{self, KEY_SIZE};

/// Encodes a key as unpadded base64url.
pub fn encode(key: &[u8; KEY_SIZE]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

/// Decodes an unpadded base64url key, rejecting anything that is not
/// exactly [`KEY_SIZE`] bytes.
pub fn decode(text: &str) -> io::Result<[u8; KEY_SIZE]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "key must decode to 32 bytes")
    })
}

/// Derives the X25519 public key for a private key.
pub fn public_key(private_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    crypto::public_key(private_key)
}

/// Reads a private key file.
pub fn read(path: impl AsRef<Path>) -> io::Result<[u8; KEY_SIZE]> {
    decode(&fs::read_to_string(path)?)
}

/// Writes a private key file with owner-only permissions (mode `0600`).
pub fn write(path: impl AsRef<Path>, key: &[u8; KEY_SIZE]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    io::Write::write_all(&mut file, encode(key).as_bytes())
}

/// Loads the private key at `path`, generating and storing a fresh one if
/// the file does not exist yet.
pub fn generate(path: impl AsRef<Path>) -> io::Result<[u8; KEY_SIZE]> {
    let path = path.as_ref();
    if path.exists() {
        return read(path);
    }
    let mut key = [0u8; KEY_SIZE];
    crypto::random_bytes(&mut key);
    write(path, &key)?;
    Ok(key)
}
