//! WireGuard handshake implementation
//!
//! Implements the Noise IKpsk2 handshake pattern for key exchange:
//!
//! ```text
//! initiator                                   responder
//!   create_initiation  ── MessageInitiation ──▶ consume_initiation
//!   consume_response   ◀── MessageResponse ──── create_response
//!   begin_symmetric_session                     begin_symmetric_session
//! ```
//!
//! Every operation runs on a [`Transcript`] copy while holding the peer's
//! handshake lock, and writes the result back only once all checks passed,
//! so a failed message never leaves a half-mixed transcript behind.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tai64::Tai64N;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::aead::TAG_LEN;
use crate::crypto::noise::Transcript;
use crate::crypto::x25519::{self, PresharedKey, StaticPublicKey, KEY_LEN};
use crate::device::Device;
use crate::error::{HandshakeError, SecureGuardError};
use crate::protocol::index_table::IndexKind;
use crate::protocol::keypair::Keypair;
use crate::protocol::messages::{MessageInitiation, MessageResponse, TIMESTAMP_LEN};
use crate::protocol::peer::Peer;

/// Minimum spacing between two accepted initiations from the same peer
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(20);

/// Granularity the timestamp nanoseconds are rounded down to before sending
const TIMESTAMP_WHITENER: u32 = 0x00FF_FFFF;

/// Progress of one handshake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Zeroed => "handshakeZeroed",
            Self::InitiationCreated => "handshakeInitiationCreated",
            Self::InitiationConsumed => "handshakeInitiationConsumed",
            Self::ResponseCreated => "handshakeResponseCreated",
            Self::ResponseConsumed => "handshakeResponseConsumed",
        };
        f.write_str(name)
    }
}

/// Per-peer handshake transcript, reused across attempts
pub struct Handshake {
    pub(crate) state: HandshakeState,
    pub(crate) hash: [u8; 32],
    pub(crate) chain_key: [u8; 32],
    pub(crate) preshared_key: PresharedKey,
    pub(crate) local_ephemeral: [u8; KEY_LEN],
    pub(crate) local_index: u32,
    pub(crate) remote_index: u32,
    pub(crate) remote_static: StaticPublicKey,
    pub(crate) remote_ephemeral: StaticPublicKey,
    pub(crate) precomputed_static_static: [u8; KEY_LEN],
    pub(crate) last_timestamp: [u8; TIMESTAMP_LEN],
    pub(crate) last_initiation_consumption: Option<Instant>,
    pub(crate) last_sent_handshake: Option<Instant>,
    /// Set once the peer leaves the device; never cleared
    pub(crate) removed: bool,
}

impl Handshake {
    pub fn new(
        remote_static: StaticPublicKey,
        preshared_key: PresharedKey,
        precomputed_static_static: [u8; KEY_LEN],
    ) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            hash: [0u8; 32],
            chain_key: [0u8; 32],
            preshared_key,
            local_ephemeral: [0u8; KEY_LEN],
            local_index: 0,
            remote_index: 0,
            remote_static,
            remote_ephemeral: [0u8; KEY_LEN],
            precomputed_static_static,
            last_timestamp: [0u8; TIMESTAMP_LEN],
            last_initiation_consumption: None,
            last_sent_handshake: None,
            removed: false,
        }
    }

    /// Zero the per-attempt secrets and return to `Zeroed`
    ///
    /// Keeps the peer configuration and the replay timestamp. Does not
    /// touch the index table; callers release `local_index` first.
    pub fn clear(&mut self) {
        self.local_ephemeral.zeroize();
        self.remote_ephemeral.zeroize();
        self.chain_key.zeroize();
        self.hash.zeroize();
        self.local_index = 0;
        self.state = HandshakeState::Zeroed;
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Running transcript hash
    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Running chaining key
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn remote_static(&self) -> &StaticPublicKey {
        &self.remote_static
    }

    /// TAI64N of the newest accepted initiation
    pub fn last_timestamp(&self) -> &[u8; TIMESTAMP_LEN] {
        &self.last_timestamp
    }

    pub fn last_initiation_consumption(&self) -> Option<Instant> {
        self.last_initiation_consumption
    }

    pub fn last_sent_handshake(&self) -> Option<Instant> {
        self.last_sent_handshake
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    fn require_active(&self) -> Result<(), HandshakeError> {
        if self.removed {
            return Err(HandshakeError::PeerRemoved);
        }
        Ok(())
    }

    fn require_state(&self, expected: HandshakeState) -> Result<(), HandshakeError> {
        self.require_active()?;
        if self.state != expected {
            return Err(HandshakeError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn static_static(&self) -> Result<&[u8; KEY_LEN], HandshakeError> {
        if x25519::is_zero(&self.precomputed_static_static) {
            return Err(HandshakeError::MisconfiguredPeer);
        }
        Ok(&self.precomputed_static_static)
    }

    fn commit(&mut self, transcript: &Transcript, state: HandshakeState) {
        self.hash = transcript.hash;
        self.chain_key = transcript.chain_key;
        self.state = state;
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.clear();
        self.precomputed_static_static.zeroize();
    }
}

/// Current TAI64N time, nanoseconds rounded down to a multiple of 2^24 - 1
pub fn timestamp_now() -> [u8; TIMESTAMP_LEN] {
    let now = Tai64N::now();
    Tai64N(now.0, now.1 / TIMESTAMP_WHITENER * TIMESTAMP_WHITENER).to_bytes()
}

fn new_ephemeral() -> Result<(Zeroizing<[u8; KEY_LEN]>, StaticPublicKey), HandshakeError> {
    let private = Zeroizing::new(
        x25519::generate_private().map_err(|_| HandshakeError::KeyGeneration)?,
    );
    let public = x25519::public_key(&private);
    Ok((private, public))
}

/// DH whose failure means the message cannot be authenticated
fn dh_auth(
    private: &[u8; KEY_LEN],
    public: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, HandshakeError> {
    x25519::dh(private, public)
        .map(Zeroizing::new)
        .map_err(|_| HandshakeError::AuthenticationFailure)
}

/// DH against a configured key, whose failure means bad configuration
fn dh_config(
    private: &[u8; KEY_LEN],
    public: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, HandshakeError> {
    x25519::dh(private, public)
        .map(Zeroizing::new)
        .map_err(|_| HandshakeError::MisconfiguredPeer)
}

impl Device {
    /// Create a handshake initiation for `peer` (initiator side)
    ///
    /// The returned message carries MAC1/MAC2 and is ready to send.
    pub fn create_initiation(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<MessageInitiation, SecureGuardError> {
        let identity = self.static_identity.read();
        let mut handshake = peer.handshake.lock();
        handshake.require_active()?;

        let mut transcript = Transcript::initial();
        let (ephemeral, ephemeral_public) = new_ephemeral()?;

        transcript.mix_hash(&handshake.remote_static);

        // e
        transcript.mix_key(&ephemeral_public);
        transcript.mix_hash(&ephemeral_public);

        // es: encrypt our static public key
        let es = dh_config(&ephemeral, &handshake.remote_static)?;
        let key = transcript.mix_key_derive(&es[..]);
        let mut encrypted_static = [0u8; KEY_LEN + TAG_LEN];
        transcript.encrypt_and_hash(&key, &identity.public_key, &mut encrypted_static)?;

        // ss: encrypt the timestamp
        let key = transcript.mix_key_derive(handshake.static_static()?);
        let mut encrypted_timestamp = [0u8; TIMESTAMP_LEN + TAG_LEN];
        transcript.encrypt_and_hash(&key, &timestamp_now(), &mut encrypted_timestamp)?;

        // Nothing is committed to the peer before the new index is live
        self.index_table.delete(handshake.local_index);
        handshake.local_index = 0;
        let local_index = self.index_table.new_index_for_handshake(peer)?;

        handshake.clear();
        handshake.commit(&transcript, HandshakeState::InitiationCreated);
        handshake.local_ephemeral = *ephemeral;
        handshake.local_index = local_index;
        drop(handshake);

        let mut msg = MessageInitiation {
            sender: local_index,
            ephemeral: ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        peer.send_initiation_bytes(&mut msg)?;

        tracing::debug!(
            "Created initiation for {} (sender {:08x})",
            peer,
            local_index
        );
        Ok(msg)
    }

    /// Consume a handshake initiation (responder side)
    ///
    /// Returns the peer that sent it. On any failure nothing is mutated.
    pub fn consume_initiation(
        &self,
        msg: &MessageInitiation,
    ) -> Result<Arc<Peer>, SecureGuardError> {
        let identity = self.static_identity.read();

        let mut transcript = Transcript::initial();
        transcript.mix_hash(&identity.public_key);
        transcript.mix_hash(&msg.ephemeral);
        transcript.mix_key(&msg.ephemeral);

        // es: decrypt the initiator's static key
        let es = dh_auth(identity.private_key.as_bytes(), &msg.ephemeral)?;
        let key = transcript.mix_key_derive(&es[..]);
        let mut peer_public = [0u8; KEY_LEN];
        transcript
            .decrypt_and_hash(&key, &msg.encrypted_static, &mut peer_public)
            .map_err(|_| HandshakeError::AuthenticationFailure)?;

        let peer = self
            .lookup_peer(&peer_public)
            .ok_or(HandshakeError::UnknownPeer)?;

        // Removed between lookup and lock
        let mut handshake = peer.handshake.lock();
        handshake.require_active()?;

        // ss: decrypt the timestamp
        let key = transcript.mix_key_derive(handshake.static_static()?);
        let mut timestamp = [0u8; TIMESTAMP_LEN];
        transcript
            .decrypt_and_hash(&key, &msg.encrypted_timestamp, &mut timestamp)
            .map_err(|_| HandshakeError::AuthenticationFailure)?;

        // TAI64N is big-endian, so byte order is time order
        if timestamp <= handshake.last_timestamp {
            tracing::trace!("Replayed initiation from {}", peer);
            return Err(HandshakeError::ReplayDetected.into());
        }
        if handshake
            .last_initiation_consumption
            .is_some_and(|last| last.elapsed() <= HANDSHAKE_INITIATION_RATE)
        {
            tracing::trace!("Initiation flood from {}", peer);
            return Err(HandshakeError::Flood.into());
        }

        self.index_table.delete(handshake.local_index);
        handshake.clear();
        handshake.commit(&transcript, HandshakeState::InitiationConsumed);
        handshake.remote_index = msg.sender;
        handshake.remote_ephemeral = msg.ephemeral;
        handshake.last_timestamp = timestamp;
        handshake.last_initiation_consumption = Some(Instant::now());
        drop(handshake);

        tracing::debug!(
            "Consumed initiation from {} (sender {:08x})",
            peer,
            msg.sender
        );
        Ok(peer)
    }

    /// Create the handshake response for a consumed initiation
    ///
    /// The returned message carries MAC1/MAC2 and is ready to send.
    pub fn create_response(&self, peer: &Arc<Peer>) -> Result<MessageResponse, SecureGuardError> {
        let mut handshake = peer.handshake.lock();
        handshake.require_state(HandshakeState::InitiationConsumed)?;

        let mut transcript = Transcript::resume(&handshake.hash, &handshake.chain_key);
        let (ephemeral, ephemeral_public) = new_ephemeral()?;

        // e
        transcript.mix_hash(&ephemeral_public);
        transcript.mix_key(&ephemeral_public);

        // ee, se
        let ee = dh_auth(&ephemeral, &handshake.remote_ephemeral)?;
        transcript.mix_key(&ee[..]);
        let se = dh_config(&ephemeral, &handshake.remote_static)?;
        transcript.mix_key(&se[..]);

        // psk
        let key = transcript.mix_preshared_key(handshake.preshared_key.as_bytes());
        let mut encrypted_nothing = [0u8; TAG_LEN];
        transcript.encrypt_and_hash(&key, &[], &mut encrypted_nothing)?;

        self.index_table.delete(handshake.local_index);
        handshake.local_index = 0;
        let local_index = self.index_table.new_index_for_handshake(peer)?;

        handshake.commit(&transcript, HandshakeState::ResponseCreated);
        handshake.local_ephemeral = *ephemeral;
        handshake.local_index = local_index;
        let receiver = handshake.remote_index;
        drop(handshake);

        let mut msg = MessageResponse {
            sender: local_index,
            receiver,
            ephemeral: ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        peer.send_response_bytes(&mut msg)?;

        tracing::debug!(
            "Created response for {} (sender {:08x}, receiver {:08x})",
            peer,
            local_index,
            receiver
        );
        Ok(msg)
    }

    /// Consume a handshake response (initiator side)
    ///
    /// The receiver index routes the message to the handshake that sent
    /// the initiation. On any failure nothing is mutated.
    pub fn consume_response(&self, msg: &MessageResponse) -> Result<Arc<Peer>, SecureGuardError> {
        let entry = self
            .index_table
            .lookup(msg.receiver)
            .ok_or(HandshakeError::UnknownIndex { index: msg.receiver })?;
        if !matches!(entry.kind, IndexKind::Handshake) {
            return Err(HandshakeError::UnknownIndex { index: msg.receiver }.into());
        }
        let peer = entry.peer;

        let identity = self.static_identity.read();
        let mut handshake = peer.handshake.lock();
        handshake.require_state(HandshakeState::InitiationCreated)?;
        if handshake.local_index != msg.receiver {
            // Superseded by a newer attempt between lookup and lock
            return Err(HandshakeError::UnknownIndex { index: msg.receiver }.into());
        }

        let mut transcript = Transcript::resume(&handshake.hash, &handshake.chain_key);

        // e
        transcript.mix_hash(&msg.ephemeral);
        transcript.mix_key(&msg.ephemeral);

        // ee, se
        let ee = dh_auth(&handshake.local_ephemeral, &msg.ephemeral)?;
        transcript.mix_key(&ee[..]);
        let se = dh_auth(identity.private_key.as_bytes(), &msg.ephemeral)?;
        transcript.mix_key(&se[..]);

        // psk, then the empty payload proves the responder derived the same key
        let key = transcript.mix_preshared_key(handshake.preshared_key.as_bytes());
        transcript
            .decrypt_and_hash(&key, &msg.encrypted_nothing, &mut [0u8; 0])
            .map_err(|_| HandshakeError::AuthenticationFailure)?;

        handshake.commit(&transcript, HandshakeState::ResponseConsumed);
        handshake.remote_index = msg.sender;
        drop(handshake);

        tracing::debug!(
            "Consumed response from {} (sender {:08x})",
            peer,
            msg.sender
        );
        Ok(peer)
    }

    /// Split a finished handshake into transport keys
    ///
    /// Valid after `consume_response` (initiator) or `create_response`
    /// (responder). The transcript is zeroized, the handshake index is
    /// rebound to the new keypair, and the keypair is installed in the
    /// peer's keypair slots.
    pub fn begin_symmetric_session(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<Arc<Keypair>, SecureGuardError> {
        let mut handshake = peer.handshake.lock();
        handshake.require_active()?;

        let transcript = Transcript::resume(&handshake.hash, &handshake.chain_key);
        let (send_key, receive_key, is_initiator) = match handshake.state {
            HandshakeState::ResponseConsumed => {
                let (send, receive) = transcript.split();
                (send, receive, true)
            }
            HandshakeState::ResponseCreated => {
                let (receive, send) = transcript.split();
                (send, receive, false)
            }
            found => {
                return Err(HandshakeError::InvalidState {
                    expected: HandshakeState::ResponseConsumed,
                    found,
                }
                .into())
            }
        };

        let local_index = handshake.local_index;
        let keypair = Arc::new(Keypair::new(
            send_key,
            receive_key,
            is_initiator,
            local_index,
            handshake.remote_index,
        ));

        handshake.clear();
        self.index_table
            .swap_index_for_keypair(local_index, Arc::clone(&keypair));

        // Install before dropping the handshake lock; removal takes it too
        let retired = peer.keypairs.lock().install(Arc::clone(&keypair));
        drop(handshake);
        for old in retired {
            self.index_table.delete(old.local_index);
        }

        tracing::info!(
            "Session established with {} ({})",
            peer,
            if is_initiator { "initiator" } else { "responder" }
        );
        Ok(keypair)
    }
}
