//! Remote peer state
//!
//! A peer owns its handshake transcript, the cookie generator for MACs on
//! messages sent to it, and its transport keypair slots.

use std::fmt;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;

use crate::crypto::x25519::{PresharedKey, StaticPublicKey, KEY_LEN};
use crate::error::ProtocolError;
use crate::protocol::cookie::CookieGenerator;
use crate::protocol::handshake::{Handshake, HandshakeState};
use crate::protocol::keypair::Keypairs;
use crate::protocol::messages::{MessageInitiation, MessageResponse};

/// A configured remote peer
pub struct Peer {
    public_key: StaticPublicKey,
    pub(crate) handshake: Mutex<Handshake>,
    pub(crate) cookie_generator: CookieGenerator,
    pub(crate) keypairs: Mutex<Keypairs>,
}

impl Peer {
    /// Create a peer; `precomputed_static_static` is DH(our static, theirs)
    pub fn new(
        public_key: StaticPublicKey,
        preshared_key: PresharedKey,
        precomputed_static_static: [u8; KEY_LEN],
    ) -> Self {
        Self {
            public_key,
            handshake: Mutex::new(Handshake::new(
                public_key,
                preshared_key,
                precomputed_static_static,
            )),
            cookie_generator: CookieGenerator::new(&public_key),
            keypairs: Mutex::new(Keypairs::new()),
        }
    }

    pub fn public_key(&self) -> &StaticPublicKey {
        &self.public_key
    }

    /// Lock the handshake transcript
    pub fn handshake(&self) -> parking_lot::MutexGuard<'_, Handshake> {
        self.handshake.lock()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.lock().state()
    }

    pub fn keypairs(&self) -> parking_lot::MutexGuard<'_, Keypairs> {
        self.keypairs.lock()
    }

    pub fn cookie_generator(&self) -> &CookieGenerator {
        &self.cookie_generator
    }

    /// Serialize an initiation with fresh MACs, recording the send time
    ///
    /// The MAC fields of `msg` are updated to match the returned bytes.
    pub fn send_initiation_bytes(
        &self,
        msg: &mut MessageInitiation,
    ) -> Result<[u8; MessageInitiation::SIZE], ProtocolError> {
        let mut bytes = msg.to_bytes();
        self.cookie_generator.add_macs(&mut bytes)?;
        msg.mac1.copy_from_slice(
            &bytes[MessageInitiation::MAC1_OFFSET..MessageInitiation::MAC2_OFFSET],
        );
        msg.mac2.copy_from_slice(&bytes[MessageInitiation::MAC2_OFFSET..]);
        self.mark_sent();
        Ok(bytes)
    }

    /// Serialize a response with fresh MACs, recording the send time
    pub fn send_response_bytes(
        &self,
        msg: &mut MessageResponse,
    ) -> Result<[u8; MessageResponse::SIZE], ProtocolError> {
        let mut bytes = msg.to_bytes();
        self.cookie_generator.add_macs(&mut bytes)?;
        msg.mac1
            .copy_from_slice(&bytes[MessageResponse::MAC1_OFFSET..MessageResponse::MAC2_OFFSET]);
        msg.mac2.copy_from_slice(&bytes[MessageResponse::MAC2_OFFSET..]);
        self.mark_sent();
        Ok(bytes)
    }

    fn mark_sent(&self) {
        self.handshake.lock().last_sent_handshake = Some(Instant::now());
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE64.encode(self.public_key);
        write!(
            f,
            "peer({}…{})",
            &encoded[..4],
            &encoded[encoded.len() - 4..]
        )
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}
