//! Crypto interface.
//!
//! This module provides a uniform factory for the AEAD ciphers supported on
//! the record layer, plus the small set of primitives the handshake key
//! schedule is built from: X25519 ECDH, HKDF-SHA256 and HMAC-SHA256.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use chacha20poly1305::{AeadInPlace, Key, KeyInit, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, TryRngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, InvalidConfig};

/// Key size shared by every supported cipher and by X25519, in bytes.
pub const KEY_SIZE: usize = 32;

/// AEAD authentication tag size, uniform across the supported ciphers.
pub const TAG_SIZE: usize = 16;

/// The largest nonce any supported cipher uses (XChaCha20-Poly1305).
pub(crate) const MAX_NONCE_SIZE: usize = 24;

/// Authenticated Encryption with Associated Data (AEAD) cipher used on the
/// record layer of a [`Conn`].
///
/// Both endpoints must be configured with the same cipher; the choice is
/// not negotiated on the wire.
///
/// [`Conn`]: crate::Conn
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CipherKind {
    /// AES-256 in GCM mode with 128-bit tags and 96-bit nonces.
    ///
    /// This is the default cipher.
    #[default]
    Aes256Gcm,

    /// ChaCha20-Poly1305-IETF with 128-bit tags and 96-bit nonces.
    ChaCha20Poly1305,

    /// XChaCha20-Poly1305 with 128-bit tags and 192-bit nonces.
    XChaCha20Poly1305,
}

impl CipherKind {
    /// Looks up a cipher by its configuration name.
    ///
    /// The recognized names are `aes-256-gcm`, `chacha20-poly1305` and
    /// `xchacha20-poly1305`.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "xchacha20-poly1305" => Ok(CipherKind::XChaCha20Poly1305),
            _ => Err(InvalidConfig::UnsupportedCrypto { name: name.into() }.into()),
        }
    }

    /// The configuration name of this cipher.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// The nonce size of this cipher in bytes.
    pub fn nonce_size(&self) -> usize {
        match self {
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 12,
            CipherKind::XChaCha20Poly1305 => MAX_NONCE_SIZE,
        }
    }
}

/// A 256-bit key derived once per handshake; feeds both directions' AEAD.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for SessionKey {
    fn from(value: [u8; KEY_SIZE]) -> Self {
        Self(value)
    }
}

impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"*****").finish()
    }
}

/// A keyed AEAD instance operating in place over a record buffer.
///
/// The buffer layout is always `ciphertext ‖ tag` with the tag occupying the
/// trailing [`TAG_SIZE`] bytes; the associated data is empty.
pub(crate) struct SessionAead {
    inner: AeadImpl,
    kind: CipherKind,
}

enum AeadImpl {
    AwsLc(LessSafeKey),
    XChaCha(XChaCha20Poly1305),
}

impl SessionAead {
    pub(crate) fn new(kind: CipherKind, key: &SessionKey) -> Self {
        let inner = match kind {
            CipherKind::Aes256Gcm => {
                AeadImpl::AwsLc(LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &key.0).unwrap()))
            }
            CipherKind::ChaCha20Poly1305 => AeadImpl::AwsLc(LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &key.0).unwrap(),
            )),
            CipherKind::XChaCha20Poly1305 => {
                AeadImpl::XChaCha(XChaCha20Poly1305::new(Key::from_slice(&key.0)))
            }
        };
        Self { inner, kind }
    }

    /// Encrypts `in_out[..len-TAG_SIZE]` in place and writes the tag into the
    /// trailing [`TAG_SIZE`] bytes.
    pub(crate) fn seal(&self, nonce: &[u8], in_out: &mut [u8]) -> Result<(), Error> {
        debug_assert!(in_out.len() >= TAG_SIZE);
        debug_assert_eq!(nonce.len(), self.kind.nonce_size());
        let (data, tag_out) = in_out.split_at_mut(in_out.len() - TAG_SIZE);
        match &self.inner {
            AeadImpl::AwsLc(key) => {
                let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| Error::Cipher)?;
                let tag = key
                    .seal_in_place_separate_tag(nonce, Aad::empty(), data)
                    .map_err(|_| Error::Cipher)?;
                tag_out.copy_from_slice(tag.as_ref());
            }
            AeadImpl::XChaCha(aead) => {
                let tag = aead
                    .encrypt_in_place_detached(XNonce::from_slice(nonce), b"", data)
                    .map_err(|_| Error::Cipher)?;
                tag_out.copy_from_slice(tag.as_slice());
            }
        }
        Ok(())
    }

    /// Decrypts `ciphertext ‖ tag` in place, returning the plaintext length.
    pub(crate) fn open(&self, nonce: &[u8], in_out: &mut [u8]) -> Result<usize, Error> {
        debug_assert!(in_out.len() >= TAG_SIZE);
        debug_assert_eq!(nonce.len(), self.kind.nonce_size());
        match &self.inner {
            AeadImpl::AwsLc(key) => {
                let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| Error::Cipher)?;
                let plaintext = key
                    .open_in_place(nonce, Aad::empty(), in_out)
                    .map_err(|_| Error::Cipher)?;
                Ok(plaintext.len())
            }
            AeadImpl::XChaCha(aead) => {
                let (data, tag) = in_out.split_at_mut(in_out.len() - TAG_SIZE);
                let tag = Tag::clone_from_slice(tag);
                aead.decrypt_in_place_detached(XNonce::from_slice(nonce), b"", data, &tag)
                    .map_err(|_| Error::Cipher)?;
                Ok(data.len())
            }
        }
    }
}

impl Debug for SessionAead {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAead")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Computes the X25519 shared secret between a private key and a peer's
/// public key.
///
/// A degenerate all-zero shared secret (low-order peer point) is rejected.
pub(crate) fn ecdh(
    private_key: &[u8; KEY_SIZE],
    peer_public: &[u8; KEY_SIZE],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
    let secret = StaticSecret::from(*private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(Error::Cipher);
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// Derives the X25519 public key of a private key.
pub(crate) fn public_key(private_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    PublicKey::from(&StaticSecret::from(*private_key)).to_bytes()
}

/// HKDF-SHA256 with explicit salt and info, filling `out`.
pub(crate) fn hkdf_sha256(
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    Hkdf::<Sha256>::new(Some(salt), secret)
        .expand(info, out)
        .map_err(|_| Error::Cipher)
}

/// HMAC-SHA256 over `message`.
pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub(crate) fn hmac_verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// Fills `buf` from the operating system CSPRNG.
pub(crate) fn random_bytes(buf: &mut [u8]) {
    OsRng
        .try_fill_bytes(buf)
        .expect("system random source failure");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_key, client_pub, server_key, server_pub};

    fn test_seal_open(kind: CipherKind) {
        let aead = SessionAead::new(kind, &SessionKey::from([7u8; KEY_SIZE]));
        let nonce = vec![0u8; kind.nonce_size()];
        let plaintext = b"Hello, world!";
        let mut buf = plaintext.to_vec();
        buf.extend_from_slice(&[0u8; TAG_SIZE]);

        aead.seal(&nonce, &mut buf).unwrap();
        assert_ne!(&buf[..plaintext.len()], plaintext);

        let n = aead.open(&nonce, &mut buf).unwrap();
        assert_eq!(n, plaintext.len());
        assert_eq!(&buf[..n], plaintext);
    }

    fn test_tamper_detected(kind: CipherKind) {
        let aead = SessionAead::new(kind, &SessionKey::from([7u8; KEY_SIZE]));
        let nonce = vec![0u8; kind.nonce_size()];
        let mut buf = vec![0u8; 32 + TAG_SIZE];
        aead.seal(&nonce, &mut buf).unwrap();

        buf[0] = buf[0].wrapping_add(1);
        assert_eq!(aead.open(&nonce, &mut buf), Err(Error::Cipher));
    }

    #[test]
    fn test_cipher_aes_256_gcm() {
        test_seal_open(CipherKind::Aes256Gcm);
        test_tamper_detected(CipherKind::Aes256Gcm);
    }

    #[test]
    fn test_cipher_chacha20_poly1305() {
        test_seal_open(CipherKind::ChaCha20Poly1305);
        test_tamper_detected(CipherKind::ChaCha20Poly1305);
    }

    #[test]
    fn test_cipher_xchacha20_poly1305() {
        test_seal_open(CipherKind::XChaCha20Poly1305);
        test_tamper_detected(CipherKind::XChaCha20Poly1305);
    }

    #[test]
    fn test_cipher_names() {
        for kind in [
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20Poly1305,
            CipherKind::XChaCha20Poly1305,
        ] {
            assert_eq!(CipherKind::from_name(kind.name()).unwrap(), kind);
        }
        assert_eq!(
            CipherKind::from_name("aes-128-gcm"),
            Err(InvalidConfig::UnsupportedCrypto {
                name: "aes-128-gcm".into()
            }
            .into())
        );
    }

    #[test]
    fn test_ecdh_agreement() {
        let client = ecdh(&client_key(), &server_pub()).unwrap();
        let server = ecdh(&server_key(), &client_pub()).unwrap();
        assert_eq!(*client, *server);
    }

    #[test]
    fn test_public_key_derivation() {
        assert_eq!(public_key(&client_key()), client_pub());
        assert_eq!(public_key(&server_key()), server_pub());
    }

    #[test]
    fn test_ecdh_rejects_low_order_point() {
        assert!(matches!(
            ecdh(&client_key(), &[0u8; KEY_SIZE]),
            Err(Error::Cipher)
        ));
    }
}
