//! Single-round authenticated key exchange.
//!
//! The client sends one fixed-size packet and the server never replies:
//!
//! ```text
//! | ephemeral | id | sign |
//! |    32B    | 8B | 32B  |
//! ```
//!
//! `ephemeral` is the client's X25519 public key, `id` a random
//! little-endian 64-bit value that doubles as the replay-cache key, and
//! `sign` an HMAC-SHA256 over the first 40 bytes.
//!
//! Both sides derive the same session secrets from the ECDH shared secret:
//!
//! ```text
//! info        = lowercase_hex(le_u64(floor(unix_seconds / tolerance)))
//! session_key = HKDF-SHA256(secret = shared, salt = ephemeral ‖ id, info, 32)
//! sign        = HMAC-SHA256(session_key, ephemeral ‖ id)
//! base_nonce  = HKDF-SHA256(secret = session_key, salt = sign, info, nonce_size)
//! ```
//!
//! Binding the key to the coarse time window means a captured packet is
//! only replayable within the window, and the replay cache covers exactly
//! that span.

use std::io::{self, Read, Write};

use crate::{
    config::{ClientConfig, ServerContext},
    crypto::{self, CipherKind, SessionKey, KEY_SIZE, MAX_NONCE_SIZE},
    error::Error,
    replay_cache::unix_seconds,
};

/// Total size of the handshake packet on the wire.
pub(crate) const PACKET_SIZE: usize = 72;

const ID_SIZE: usize = 8;
const KEY_END: usize = KEY_SIZE;
const ID_END: usize = KEY_END + ID_SIZE;

/// Everything both sides agree on after a successful handshake.
#[derive(Debug)]
pub(crate) struct SessionSecrets {
    pub(crate) cipher: CipherKind,
    pub(crate) session_key: SessionKey,
    base_nonce: [u8; MAX_NONCE_SIZE],
    nonce_size: usize,
}

impl SessionSecrets {
    pub(crate) fn base_nonce(&self) -> &[u8] {
        &self.base_nonce[..self.nonce_size]
    }
}

/// Runs the client side: builds the packet, writes it out in full and
/// returns the derived session secrets.
pub(crate) fn client_handshake<W: Write>(
    wire: &mut W,
    config: &ClientConfig,
) -> io::Result<SessionSecrets> {
    let mut id = [0u8; ID_SIZE];
    crypto::random_bytes(&mut id);
    let (packet, secrets) = client_packet(config, id, unix_seconds())?;
    wire.write_all(&packet)?;
    Ok(secrets)
}

/// Builds the handshake packet and session secrets for a fixed id and
/// timestamp. The public entry point draws both from the environment.
pub(crate) fn client_packet(
    config: &ClientConfig,
    id: [u8; ID_SIZE],
    unix: u64,
) -> Result<([u8; PACKET_SIZE], SessionSecrets), Error> {
    let cipher = config.cipher()?;
    let tolerance = config.checked_tolerance()?;
    let server_pub = config.server_pub_bytes()?;
    let private_key = match config.private_key_bytes()? {
        Some(key) => key,
        None => {
            let mut key = [0u8; KEY_SIZE];
            crypto::random_bytes(&mut key);
            key
        }
    };

    let mut packet = [0u8; PACKET_SIZE];
    packet[..KEY_END].copy_from_slice(&crypto::public_key(&private_key));
    packet[KEY_END..ID_END].copy_from_slice(&id);

    let shared = crypto::ecdh(&private_key, &server_pub)?;
    let info = window_info(unix / tolerance);

    let mut session_key = [0u8; KEY_SIZE];
    crypto::hkdf_sha256(&*shared, &packet[..ID_END], &info, &mut session_key)?;
    let sign = crypto::hmac_sha256(&session_key, &packet[..ID_END]);
    packet[ID_END..].copy_from_slice(&sign);

    let secrets = derive_secrets(cipher, session_key, &sign, &info)?;
    Ok((packet, secrets))
}

/// Runs the server side: reads exactly one packet and validates it.
pub(crate) fn server_handshake<R: Read>(
    wire: &mut R,
    ctx: &ServerContext,
) -> io::Result<SessionSecrets> {
    let mut packet = [0u8; PACKET_SIZE];
    wire.read_exact(&mut packet).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof.into()
        } else {
            e
        }
    })?;
    verify_client_packet(&packet, ctx, unix_seconds()).map_err(io::Error::from)
}

/// Validates a client packet against the server context at the given
/// timestamp.
///
/// The replay check runs before any expensive cryptography: a duplicated
/// id is rejected without performing ECDH.
pub(crate) fn verify_client_packet(
    packet: &[u8; PACKET_SIZE],
    ctx: &ServerContext,
    unix: u64,
) -> Result<SessionSecrets, Error> {
    let config = ctx.config();
    let cipher = config.cipher()?;
    let tolerance = config.checked_tolerance()?;
    let private_key = config.private_key_bytes()?;

    let id = u64::from_le_bytes(packet[KEY_END..ID_END].try_into().unwrap());
    if ctx.check_replay(id, unix) {
        return Err(Error::ReplayAttack { id });
    }

    let client_pub: [u8; KEY_SIZE] = packet[..KEY_END].try_into().unwrap();
    if !ctx.is_authorized(&client_pub) {
        return Err(Error::UnauthorizedClient);
    }

    let shared = crypto::ecdh(&private_key, &client_pub)?;
    let sign = &packet[ID_END..];

    let window = unix / tolerance;
    let adjacent = [window, window.wrapping_sub(1), window + 1];
    let candidates: &[u64] = if config.accept_adjacent_windows {
        &adjacent
    } else {
        &adjacent[..1]
    };

    for candidate in candidates {
        let info = window_info(*candidate);
        let mut session_key = [0u8; KEY_SIZE];
        crypto::hkdf_sha256(&*shared, &packet[..ID_END], &info, &mut session_key)?;
        if crypto::hmac_verify(&session_key, &packet[..ID_END], sign) {
            return derive_secrets(cipher, session_key, sign, &info);
        }
    }
    Err(Error::Sign)
}

fn derive_secrets(
    cipher: CipherKind,
    session_key: [u8; KEY_SIZE],
    sign: &[u8],
    info: &[u8],
) -> Result<SessionSecrets, Error> {
    let nonce_size = cipher.nonce_size();
    let mut base_nonce = [0u8; MAX_NONCE_SIZE];
    crypto::hkdf_sha256(&session_key, sign, info, &mut base_nonce[..nonce_size])?;
    Ok(SessionSecrets {
        cipher,
        session_key: SessionKey::from(session_key),
        base_nonce,
        nonce_size,
    })
}

/// The HKDF info string: 16 lowercase hex characters of the little-endian
/// window index.
fn window_info(window: u64) -> [u8; 16] {
    let mut info = [0u8; 16];
    hex::encode_to_slice(window.to_le_bytes(), &mut info).expect("exact-size buffer");
    info
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;
    use crate::crypto::SessionAead;
    use crate::error::InvalidConfig;
    use crate::testutil::{client_key, client_pub, server_key, server_pub};

    fn client_config(crypto_type: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.private_key = Some(client_key().to_vec());
        config.server_pub = server_pub().to_vec();
        config.crypto_type = crypto_type.into();
        config
    }

    fn server_context(crypto_type: &str) -> ServerContext {
        let mut config = ServerConfig::new();
        config.private_key = Some(server_key().to_vec());
        config.crypto_type = crypto_type.into();
        ServerContext::new(config).unwrap()
    }

    fn round_trip(crypto_type: &str, nonce_size: usize) {
        let config = client_config(crypto_type);
        let ctx = server_context(crypto_type);

        let mut wire = Vec::new();
        let client = client_handshake(&mut wire, &config).unwrap();
        assert_eq!(wire.len(), PACKET_SIZE);
        assert_eq!(&wire[..KEY_END], &client_pub());
        assert_eq!(client.base_nonce().len(), nonce_size);

        let server = server_handshake(&mut &wire[..], &ctx).unwrap();
        assert_eq!(server.session_key, client.session_key);
        assert_eq!(server.base_nonce(), client.base_nonce());
        assert_eq!(server.cipher, client.cipher);

        // The derived secrets drive a working cipher in both directions.
        let sealer = SessionAead::new(client.cipher, &client.session_key);
        let opener = SessionAead::new(server.cipher, &server.session_key);
        let mut buf = b"test data".to_vec();
        buf.extend_from_slice(&[0u8; crate::crypto::TAG_SIZE]);
        sealer.seal(client.base_nonce(), &mut buf).unwrap();
        let n = opener.open(server.base_nonce(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"test data");

        ctx.close();
    }

    #[test]
    fn test_round_trip_all_ciphers() {
        round_trip("aes-256-gcm", 12);
        round_trip("chacha20-poly1305", 12);
        round_trip("xchacha20-poly1305", 24);
    }

    #[test]
    fn test_client_requires_server_key() {
        let mut config = client_config("aes-256-gcm");
        config.server_pub = Vec::new();
        let err = client_packet(&config, [0; ID_SIZE], 1_700_000_000).unwrap_err();
        assert_eq!(err, InvalidConfig::MissingServerKey.into());
    }

    #[test]
    fn test_unknown_crypto_type() {
        let config = client_config("rot13");
        let err = client_packet(&config, [0; ID_SIZE], 1_700_000_000).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig(InvalidConfig::UnsupportedCrypto { .. })
        ));
    }

    #[test]
    fn test_server_requires_private_key() {
        let mut config = ServerConfig::new();
        config.private_key = None;
        let ctx = ServerContext::new(config).unwrap();
        let err = verify_client_packet(&[0u8; PACKET_SIZE], &ctx, 1_700_000_000).unwrap_err();
        assert_eq!(err, InvalidConfig::MissingPrivateKey.into());
        ctx.close();
    }

    #[test]
    fn test_replay_rejected_before_ecdh() {
        let ctx = server_context("aes-256-gcm");
        let unix = unix_seconds();

        // Pre-populate the cache with the id the packet carries. The rest
        // of the packet is garbage; the replay check must fire first.
        let mut packet = [0u8; PACKET_SIZE];
        packet[KEY_END..ID_END].copy_from_slice(&0x1122334455u64.to_le_bytes());
        assert!(!ctx.check_replay(0x1122334455, unix));

        let err = verify_client_packet(&packet, &ctx, unix).unwrap_err();
        assert_eq!(err, Error::ReplayAttack { id: 0x1122334455 });
        ctx.close();
    }

    #[test]
    fn test_duplicate_handshake_is_replay() {
        let config = client_config("aes-256-gcm");
        let ctx = server_context("aes-256-gcm");
        let unix = unix_seconds();

        let (packet, _) = client_packet(&config, [9; ID_SIZE], unix).unwrap();
        verify_client_packet(&packet, &ctx, unix).unwrap();
        let err = verify_client_packet(&packet, &ctx, unix).unwrap_err();
        assert!(matches!(err, Error::ReplayAttack { .. }));
        ctx.close();
    }

    #[test]
    fn test_out_of_window_is_sign_error() {
        let mut config = client_config("aes-256-gcm");
        config.tolerance = 1;
        let mut server = ServerConfig::new();
        server.private_key = Some(server_key().to_vec());
        server.tolerance = 1;
        let ctx = ServerContext::new(server).unwrap();

        let unix = unix_seconds();
        let (packet, _) = client_packet(&config, [1; ID_SIZE], unix).unwrap();
        // Two windows later the buckets cannot match, adjacent or not.
        let err = verify_client_packet(&packet, &ctx, unix + 2).unwrap_err();
        assert_eq!(err, Error::Sign);
        ctx.close();
    }

    #[test]
    fn test_adjacent_window_policy() {
        let mut config = client_config("aes-256-gcm");
        config.tolerance = 1;

        let strict = {
            let mut server = ServerConfig::new();
            server.private_key = Some(server_key().to_vec());
            server.tolerance = 1;
            ServerContext::new(server).unwrap()
        };
        let tolerant = {
            let mut server = ServerConfig::new();
            server.private_key = Some(server_key().to_vec());
            server.tolerance = 1;
            server.accept_adjacent_windows = true;
            ServerContext::new(server).unwrap()
        };

        let unix = unix_seconds();
        let (packet, _) = client_packet(&config, [2; ID_SIZE], unix).unwrap();
        assert_eq!(
            verify_client_packet(&packet, &strict, unix + 1).unwrap_err(),
            Error::Sign
        );

        let (packet, client) = client_packet(&config, [3; ID_SIZE], unix).unwrap();
        let server = verify_client_packet(&packet, &tolerant, unix + 1).unwrap();
        assert_eq!(server.session_key, client.session_key);
        assert_eq!(server.base_nonce(), client.base_nonce());

        strict.close();
        tolerant.close();
    }

    #[test]
    fn test_unauthorized_client() {
        let config = client_config("aes-256-gcm");
        let mut server = ServerConfig::new();
        server.private_key = Some(server_key().to_vec());
        server.authorized_keys = vec![server_pub().to_vec()]; // not the client
        let ctx = ServerContext::new(server).unwrap();

        let unix = unix_seconds();
        let (packet, _) = client_packet(&config, [4; ID_SIZE], unix).unwrap();
        assert_eq!(
            verify_client_packet(&packet, &ctx, unix).unwrap_err(),
            Error::UnauthorizedClient
        );
        ctx.close();
    }

    #[test]
    fn test_authorized_client_accepted() {
        let config = client_config("aes-256-gcm");
        let mut server = ServerConfig::new();
        server.private_key = Some(server_key().to_vec());
        server.authorized_keys = vec![client_pub().to_vec()];
        let ctx = ServerContext::new(server).unwrap();

        let unix = unix_seconds();
        let (packet, _) = client_packet(&config, [5; ID_SIZE], unix).unwrap();
        verify_client_packet(&packet, &ctx, unix).unwrap();
        ctx.close();
    }

    #[test]
    fn test_tampered_sign_rejected() {
        let config = client_config("aes-256-gcm");
        let ctx = server_context("aes-256-gcm");

        let unix = unix_seconds();
        let (mut packet, _) = client_packet(&config, [6; ID_SIZE], unix).unwrap();
        packet[PACKET_SIZE - 1] ^= 0x80;
        assert_eq!(
            verify_client_packet(&packet, &ctx, unix).unwrap_err(),
            Error::Sign
        );
        ctx.close();
    }

    #[test]
    fn test_truncated_packet_is_unexpected_eof() {
        let config = client_config("aes-256-gcm");
        let ctx = server_context("aes-256-gcm");

        let mut wire = Vec::new();
        client_handshake(&mut wire, &config).unwrap();
        wire.truncate(40);
        let err = server_handshake(&mut &wire[..], &ctx).unwrap_err();
        assert_eq!(
            crate::error::downcast_io(&err),
            Some(&Error::UnexpectedEof)
        );
        ctx.close();
    }

    #[test]
    fn test_window_info_encoding() {
        // 0x01 encodes as the little-endian byte string 01 00 ... 00.
        assert_eq!(&window_info(1), b"0100000000000000");
        assert_eq!(&window_info(0x0807060504030201), b"0102030405060708");
    }
}
