//! Cookie handling for WireGuard DoS protection
//!
//! Every handshake message carries MAC1, keyed by the receiver's public key,
//! so anyone who knows that key can drop junk without touching per-peer
//! state. When a responder is under load it also demands MAC2, keyed by a
//! cookie bound to the sender's address; without one it answers with a
//! Cookie Reply instead of processing the handshake. The initiator decrypts
//! the cookie and includes it in MAC2 of subsequent handshake attempts.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::aead::{self, XNONCE_LEN};
use crate::crypto::blake2s::{self, HASH_LEN, MAC_LEN};
use crate::crypto::noise;
use crate::crypto::x25519::StaticPublicKey;
use crate::error::{CryptoError, ProtocolError, SecureGuardError};
use crate::protocol::messages::{MessageCookieReply, COOKIE_LEN};

/// Lifetime of a cookie secret (responder) and of a received cookie
/// (initiator), 120 seconds per WireGuard
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

/// Offsets of MAC1/MAC2 counted from the end of a handshake message
fn mac_offsets(msg: &[u8]) -> Result<(usize, usize), ProtocolError> {
    if msg.len() < 2 * MAC_LEN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 2 * MAC_LEN,
            got: msg.len(),
        });
    }
    let mac2 = msg.len() - MAC_LEN;
    Ok((mac2 - MAC_LEN, mac2))
}

/// Address bytes a cookie is bound to: IP octets, then the port (little-endian)
pub fn endpoint_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    out.extend_from_slice(&addr.port().to_le_bytes());
    out
}

/// Outcome of MAC validation on an inbound handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacVerdict {
    /// Process the handshake
    Accept,
    /// Answer with a cookie reply instead of processing
    CookieRequired,
}

struct CheckerState {
    mac1_key: [u8; HASH_LEN],
    encryption_key: [u8; HASH_LEN],
    secret: Zeroizing<[u8; HASH_LEN]>,
    secret_set: Option<Instant>,
}

impl CheckerState {
    fn secret_valid(&self) -> bool {
        self.secret_set.is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME)
    }

    fn cookie_for(&self, src: &SocketAddr) -> Zeroizing<[u8; MAC_LEN]> {
        Zeroizing::new(blake2s::mac(&self.secret, &endpoint_bytes(src)))
    }
}

/// Responder-side MAC validation and cookie issuing (one per device)
pub struct CookieChecker {
    state: RwLock<CheckerState>,
}

impl CookieChecker {
    /// Create a checker for messages addressed to `local_public`
    pub fn new(local_public: &StaticPublicKey) -> Self {
        Self {
            state: RwLock::new(CheckerState {
                mac1_key: noise::mac1_key(local_public),
                encryption_key: noise::cookie_key(local_public),
                secret: Zeroizing::new([0u8; HASH_LEN]),
                secret_set: None,
            }),
        }
    }

    /// Re-key after the device's static key changed
    pub fn init(&self, local_public: &StaticPublicKey) {
        let mut state = self.state.write();
        state.mac1_key = noise::mac1_key(local_public);
        state.encryption_key = noise::cookie_key(local_public);
        state.secret_set = None;
    }

    /// Verify MAC1 of a serialized handshake message
    pub fn check_mac1(&self, msg: &[u8]) -> Result<(), ProtocolError> {
        let (mac1_off, mac2_off) = mac_offsets(msg)?;
        let state = self.state.read();
        let expected = blake2s::mac(&state.mac1_key, &msg[..mac1_off]);
        if !blake2s::mac_eq(&expected, &msg[mac1_off..mac2_off]) {
            return Err(ProtocolError::MacVerificationFailed);
        }
        Ok(())
    }

    /// Verify MAC2 against the cookie we would currently issue to `src`
    pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr) -> Result<(), ProtocolError> {
        let (_, mac2_off) = mac_offsets(msg)?;
        let state = self.state.read();
        if !state.secret_valid() {
            return Err(ProtocolError::MacVerificationFailed);
        }
        let cookie = state.cookie_for(src);
        let expected = blake2s::mac_with_cookie(&cookie, &msg[..mac2_off]);
        if !blake2s::mac_eq(&expected, &msg[mac2_off..]) {
            return Err(ProtocolError::MacVerificationFailed);
        }
        Ok(())
    }

    /// Validate MACs; MAC2 is only demanded when the caller reports load
    pub fn check(
        &self,
        msg: &[u8],
        src: &SocketAddr,
        under_load: bool,
    ) -> Result<MacVerdict, ProtocolError> {
        self.check_mac1(msg)?;
        if under_load && self.check_mac2(msg, src).is_err() {
            return Ok(MacVerdict::CookieRequired);
        }
        Ok(MacVerdict::Accept)
    }

    /// Build a cookie reply for the handshake message `msg` from `src`
    ///
    /// The cookie secret is rotated here when it has expired.
    pub fn create_reply(
        &self,
        msg: &[u8],
        receiver: u32,
        src: &SocketAddr,
    ) -> Result<MessageCookieReply, SecureGuardError> {
        let (mac1_off, mac2_off) = mac_offsets(msg)?;

        let mut state = self.state.write();
        if !state.secret_valid() {
            OsRng
                .try_fill_bytes(&mut state.secret[..])
                .map_err(|_| CryptoError::KeyGeneration)?;
            state.secret_set = Some(Instant::now());
            tracing::debug!("Rotated cookie secret");
        }
        let cookie = state.cookie_for(src);

        let mut nonce = [0u8; XNONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| CryptoError::KeyGeneration)?;

        let mut encrypted_cookie = [0u8; COOKIE_LEN + aead::TAG_LEN];
        aead::xseal(
            &state.encryption_key,
            &nonce,
            &cookie[..],
            &msg[mac1_off..mac2_off],
            &mut encrypted_cookie,
        )?;

        Ok(MessageCookieReply {
            receiver,
            nonce,
            encrypted_cookie,
        })
    }
}

struct GeneratorState {
    mac1_key: [u8; HASH_LEN],
    encryption_key: [u8; HASH_LEN],
    /// Decrypted cookie value
    cookie: Zeroizing<[u8; COOKIE_LEN]>,
    /// When the cookie was received
    cookie_set: Option<Instant>,
    /// MAC1 of the last handshake message we sent
    last_mac1: Option<[u8; MAC_LEN]>,
}

impl GeneratorState {
    fn has_valid_cookie(&self) -> bool {
        self.cookie_set.is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME)
    }
}

/// Initiator-side MAC generation and cookie storage (one per peer)
pub struct CookieGenerator {
    state: RwLock<GeneratorState>,
}

impl CookieGenerator {
    /// Create a generator for messages sent to `remote_public`
    pub fn new(remote_public: &StaticPublicKey) -> Self {
        Self {
            state: RwLock::new(GeneratorState {
                mac1_key: noise::mac1_key(remote_public),
                encryption_key: noise::cookie_key(remote_public),
                cookie: Zeroizing::new([0u8; COOKIE_LEN]),
                cookie_set: None,
                last_mac1: None,
            }),
        }
    }

    /// Check if we hold a cookie that has not expired
    pub fn has_valid_cookie(&self) -> bool {
        self.state.read().has_valid_cookie()
    }

    /// Write MAC1 (and MAC2 when a valid cookie is held) into `msg`
    pub fn add_macs(&self, msg: &mut [u8]) -> Result<(), ProtocolError> {
        let (mac1_off, mac2_off) = mac_offsets(msg)?;
        let mut state = self.state.write();

        let mac1 = blake2s::mac(&state.mac1_key, &msg[..mac1_off]);
        msg[mac1_off..mac2_off].copy_from_slice(&mac1);
        state.last_mac1 = Some(mac1);

        let mac2 = if state.has_valid_cookie() {
            blake2s::mac_with_cookie(&state.cookie, &msg[..mac2_off])
        } else {
            [0u8; MAC_LEN]
        };
        msg[mac2_off..].copy_from_slice(&mac2);
        Ok(())
    }

    /// Decrypt and store the cookie from a Cookie Reply
    ///
    /// The reply must be bound to the MAC1 of the last message we sent.
    pub fn consume_reply(&self, reply: &MessageCookieReply) -> Result<(), SecureGuardError> {
        let mut state = self.state.write();
        let last_mac1 = state.last_mac1.ok_or(CryptoError::Decryption)?;

        let mut cookie = Zeroizing::new([0u8; COOKIE_LEN]);
        aead::xopen(
            &state.encryption_key,
            &reply.nonce,
            &reply.encrypted_cookie,
            &last_mac1,
            &mut cookie[..],
        )?;

        state.cookie = cookie;
        state.cookie_set = Some(Instant::now());

        tracing::debug!(
            "Stored new cookie (valid for {}s)",
            COOKIE_REFRESH_TIME.as_secs()
        );

        Ok(())
    }

    /// Clear the stored cookie
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.cookie = Zeroizing::new([0u8; COOKIE_LEN]);
        state.cookie_set = None;
    }
}
