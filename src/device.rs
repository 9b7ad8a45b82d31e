//! Handshake device
//!
//! A [`Device`] owns our static identity, the peer directory, the shared
//! index table and the responder-side cookie checker. The four handshake
//! operations live in [`crate::protocol::handshake`] as `impl Device`
//! blocks; this module holds setup, peer management and message dispatch.
//!
//! Lock order: static identity, then a peer's handshake, then the index
//! table or the peer's keypairs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;

use crate::config::DeviceConfig;
use crate::crypto::x25519::{PresharedKey, StaticPrivateKey, StaticPublicKey, KEY_LEN};
use crate::error::{ConfigError, HandshakeError, ProtocolError, Result, SecureGuardError};
use crate::protocol::cookie::{CookieChecker, MacVerdict};
use crate::protocol::index_table::{IndexKind, IndexTable};
use crate::protocol::keypair::Keypair;
use crate::protocol::messages::{
    get_message_type, MessageCookieReply, MessageInitiation, MessageResponse, MessageType,
};
use crate::protocol::peer::Peer;

/// Our static key pair
pub(crate) struct StaticIdentity {
    pub(crate) private_key: StaticPrivateKey,
    pub(crate) public_key: StaticPublicKey,
}

impl StaticIdentity {
    fn new(private_key: StaticPrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }

    /// DH(our static, theirs), or zeros when it is not contributory
    fn precompute(&self, remote: &StaticPublicKey) -> [u8; KEY_LEN] {
        match self.private_key.shared_secret(remote) {
            Ok(secret) => secret,
            Err(_) => {
                tracing::warn!(
                    "Static-static DH with {} is not contributory; peer cannot handshake",
                    BASE64.encode(&remote[..8])
                );
                [0u8; KEY_LEN]
            }
        }
    }
}

/// What an inbound handshake-family packet produced
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// We are under load and the sender needs a cookie first
    CookieReply(MessageCookieReply),
    /// An initiation was accepted; send `response`, `keypair` awaits confirmation
    Response {
        peer: Arc<Peer>,
        response: MessageResponse,
        keypair: Arc<Keypair>,
    },
    /// Our initiation was answered; `keypair` is current
    Established {
        peer: Arc<Peer>,
        keypair: Arc<Keypair>,
    },
    /// A cookie was stored for the next attempt to `peer`
    CookieStored { peer: Arc<Peer> },
}

/// A WireGuard handshake endpoint
pub struct Device {
    pub(crate) static_identity: RwLock<StaticIdentity>,
    pub(crate) peers: RwLock<HashMap<StaticPublicKey, Arc<Peer>>>,
    pub(crate) index_table: IndexTable,
    pub(crate) cookie_checker: CookieChecker,
}

impl Device {
    pub fn new(private_key: StaticPrivateKey) -> Self {
        let identity = StaticIdentity::new(private_key);
        let cookie_checker = CookieChecker::new(&identity.public_key);
        tracing::debug!(
            "Device created with public key {}",
            BASE64.encode(identity.public_key)
        );
        Self {
            static_identity: RwLock::new(identity),
            peers: RwLock::new(HashMap::new()),
            index_table: IndexTable::new(),
            cookie_checker,
        }
    }

    /// Build a device and its peers from a parsed `.conf`
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let device = Self::new(StaticPrivateKey::from(*config.interface.private_key));
        for peer in &config.peers {
            let psk = PresharedKey::from(peer.preshared_key.as_deref().copied());
            device.add_peer(peer.public_key, psk)?;
        }
        tracing::info!(
            "Loaded device {} with {} peer(s)",
            BASE64.encode(device.public_key()),
            config.peers.len()
        );
        Ok(device)
    }

    pub fn public_key(&self) -> StaticPublicKey {
        self.static_identity.read().public_key
    }

    /// Replace our static key
    ///
    /// Recomputes every peer's static-static secret and abandons in-flight
    /// handshakes. A peer whose key equals the new public key is removed.
    pub fn set_private_key(&self, private_key: StaticPrivateKey) {
        let mut identity = self.static_identity.write();
        *identity = StaticIdentity::new(private_key);
        self.cookie_checker.init(&identity.public_key);

        let mut peers = self.peers.write();
        if let Some(peer) = peers.remove(&identity.public_key) {
            tracing::warn!("Removing {}: it now matches our own key", peer);
            self.release_peer(&peer);
        }
        for peer in peers.values() {
            let mut handshake = peer.handshake.lock();
            handshake.precomputed_static_static = identity.precompute(peer.public_key());
            self.index_table.delete(handshake.local_index);
            handshake.clear();
        }
        tracing::info!("Static key changed to {}", BASE64.encode(identity.public_key));
    }

    /// Register a peer by its static public key
    pub fn add_peer(
        &self,
        public_key: StaticPublicKey,
        preshared_key: PresharedKey,
    ) -> Result<Arc<Peer>> {
        let identity = self.static_identity.read();
        if public_key == identity.public_key {
            return Err(ConfigError::PeerIsSelf.into());
        }

        let mut peers = self.peers.write();
        if peers.contains_key(&public_key) {
            return Err(ConfigError::DuplicatePeer {
                public_key: BASE64.encode(public_key),
            }
            .into());
        }

        let precomputed = identity.precompute(&public_key);
        let peer = Arc::new(Peer::new(public_key, preshared_key, precomputed));
        peers.insert(public_key, Arc::clone(&peer));

        tracing::debug!("Added {}", peer);
        Ok(peer)
    }

    /// Remove a peer, releasing every index it holds
    pub fn remove_peer(&self, public_key: &StaticPublicKey) -> Option<Arc<Peer>> {
        let peer = self.peers.write().remove(public_key)?;
        self.release_peer(&peer);
        tracing::debug!("Removed {}", peer);
        Some(peer)
    }

    /// Release every index of `peer` and bar it from further handshakes
    ///
    /// Holders of an `Arc<Peer>` may outlive removal; the flag is set under
    /// the handshake lock so no operation can register an index afterwards.
    fn release_peer(&self, peer: &Peer) {
        let mut handshake = peer.handshake.lock();
        handshake.removed = true;
        self.index_table.delete(handshake.local_index);
        handshake.clear();

        for keypair in peer.keypairs.lock().clear() {
            self.index_table.delete(keypair.local_index);
        }
    }

    pub fn lookup_peer(&self, public_key: &StaticPublicKey) -> Option<Arc<Peer>> {
        self.peers.read().get(public_key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn index_table(&self) -> &IndexTable {
        &self.index_table
    }

    /// Validate MAC1, and MAC2 when `under_load`, of a serialized handshake message
    pub fn check_macs(
        &self,
        packet: &[u8],
        src: &SocketAddr,
        under_load: bool,
    ) -> std::result::Result<MacVerdict, ProtocolError> {
        self.cookie_checker.check(packet, src, under_load)
    }

    /// Answer a handshake message from `src` with a cookie reply
    ///
    /// The reply is addressed to the message's sender index.
    pub fn create_cookie_reply(
        &self,
        packet: &[u8],
        src: &SocketAddr,
    ) -> Result<MessageCookieReply> {
        let sender = packet
            .get(4..8)
            .and_then(|word| <[u8; 4]>::try_from(word).ok())
            .map(u32::from_le_bytes)
            .ok_or(ProtocolError::InvalidMessageLength {
                expected: 8,
                got: packet.len(),
            })?;
        let reply = self.cookie_checker.create_reply(packet, sender, src)?;
        tracing::debug!("Sending cookie reply to {} (receiver {:08x})", src, sender);
        Ok(reply)
    }

    /// Store the cookie from a reply to one of our handshake messages
    pub fn consume_cookie_reply(&self, reply: &MessageCookieReply) -> Result<Arc<Peer>> {
        let entry = self
            .index_table
            .lookup(reply.receiver)
            .ok_or(HandshakeError::UnknownIndex {
                index: reply.receiver,
            })?;
        entry.peer.cookie_generator.consume_reply(reply)?;
        Ok(entry.peer)
    }

    /// Promote a responder keypair once transport data arrived under it
    pub fn confirm_keypair(&self, local_index: u32) -> Result<Arc<Keypair>> {
        let entry = self
            .index_table
            .lookup(local_index)
            .ok_or(HandshakeError::UnknownIndex { index: local_index })?;
        let IndexKind::Keypair(keypair) = entry.kind else {
            return Err(HandshakeError::UnknownIndex { index: local_index }.into());
        };

        let retired = entry.peer.keypairs.lock().confirm_next(local_index)?;
        if let Some(old) = retired {
            self.index_table.delete(old.local_index);
        }
        tracing::debug!("Confirmed keypair {:08x} for {}", local_index, entry.peer);
        Ok(keypair)
    }

    /// Process one inbound handshake-family packet
    ///
    /// MACs are checked before any peer state is touched. Transport data is
    /// not handled here and is rejected as an invalid type.
    pub fn receive_handshake_packet(
        &self,
        packet: &[u8],
        src: &SocketAddr,
        under_load: bool,
    ) -> Result<HandshakeOutcome> {
        let result = self.dispatch(packet, src, under_load);
        if let Err(e) = &result {
            if e.is_silent() {
                tracing::trace!("Dropped handshake packet from {}: {}", src, e);
            } else {
                tracing::warn!("Handshake packet from {} failed: {}", src, e);
            }
        }
        result
    }

    fn dispatch(
        &self,
        packet: &[u8],
        src: &SocketAddr,
        under_load: bool,
    ) -> Result<HandshakeOutcome> {
        match get_message_type(packet)? {
            MessageType::HandshakeInitiation => {
                let msg = MessageInitiation::from_bytes(packet)?;
                if self.check_macs(packet, src, under_load)? == MacVerdict::CookieRequired {
                    return Ok(HandshakeOutcome::CookieReply(
                        self.create_cookie_reply(packet, src)?,
                    ));
                }
                let peer = self.consume_initiation(&msg)?;
                let response = self.create_response(&peer)?;
                let keypair = self.begin_symmetric_session(&peer)?;
                Ok(HandshakeOutcome::Response {
                    peer,
                    response,
                    keypair,
                })
            }
            MessageType::HandshakeResponse => {
                let msg = MessageResponse::from_bytes(packet)?;
                if self.check_macs(packet, src, under_load)? == MacVerdict::CookieRequired {
                    return Ok(HandshakeOutcome::CookieReply(
                        self.create_cookie_reply(packet, src)?,
                    ));
                }
                let peer = self.consume_response(&msg)?;
                let keypair = self.begin_symmetric_session(&peer)?;
                Ok(HandshakeOutcome::Established { peer, keypair })
            }
            MessageType::CookieReply => {
                let reply = MessageCookieReply::from_bytes(packet)?;
                let peer = self.consume_cookie_reply(&reply)?;
                Ok(HandshakeOutcome::CookieStored { peer })
            }
            MessageType::TransportData => Err(SecureGuardError::Protocol(
                ProtocolError::InvalidMessageType {
                    msg_type: MessageType::TransportData as u32,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519;
    use crate::protocol::handshake::HandshakeState;
    use std::net::{IpAddr, Ipv4Addr};

    fn device() -> Device {
        Device::new(StaticPrivateKey::generate().unwrap())
    }

    fn endpoint() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 51820)
    }

    /// Two devices that know each other
    fn pair() -> (Device, Arc<Peer>, Device, Arc<Peer>) {
        let alice = device();
        let bob = device();
        let bob_at_alice = alice.add_peer(bob.public_key(), PresharedKey::default()).unwrap();
        let alice_at_bob = bob.add_peer(alice.public_key(), PresharedKey::default()).unwrap();
        (alice, bob_at_alice, bob, alice_at_bob)
    }

    #[test]
    fn test_add_peer_rejects_self_and_duplicates() {
        let dev = device();
        assert!(matches!(
            dev.add_peer(dev.public_key(), PresharedKey::default()),
            Err(SecureGuardError::Config(ConfigError::PeerIsSelf))
        ));

        let (_, remote) = x25519::generate_keypair().unwrap();
        dev.add_peer(remote, PresharedKey::default()).unwrap();
        assert!(matches!(
            dev.add_peer(remote, PresharedKey::default()),
            Err(SecureGuardError::Config(ConfigError::DuplicatePeer { .. }))
        ));
        assert_eq!(dev.peer_count(), 1);
    }

    #[test]
    fn test_low_order_peer_is_misconfigured() {
        let dev = device();
        // The all-zero point yields a non-contributory DH result
        let peer = dev.add_peer([0u8; 32], PresharedKey::default()).unwrap();
        assert!(matches!(
            dev.create_initiation(&peer),
            Err(SecureGuardError::Handshake(HandshakeError::MisconfiguredPeer))
        ));
        assert_eq!(peer.handshake_state(), HandshakeState::Zeroed);
        assert!(dev.index_table().is_empty());
    }

    #[test]
    fn test_remove_peer_releases_indices() {
        let (alice, bob_at_alice, _bob, _) = pair();
        alice.create_initiation(&bob_at_alice).unwrap();
        assert_eq!(alice.index_table().len(), 1);

        let removed = alice.remove_peer(bob_at_alice.public_key()).unwrap();
        assert!(Arc::ptr_eq(&removed, &bob_at_alice));
        assert!(alice.index_table().is_empty());
        assert!(alice.lookup_peer(bob_at_alice.public_key()).is_none());
        assert!(alice.remove_peer(bob_at_alice.public_key()).is_none());
    }

    #[test]
    fn test_removed_peer_cannot_initiate() {
        let (alice, bob_at_alice, _bob, _) = pair();
        alice.remove_peer(bob_at_alice.public_key()).unwrap();

        assert!(matches!(
            alice.create_initiation(&bob_at_alice),
            Err(SecureGuardError::Handshake(HandshakeError::PeerRemoved))
        ));
        assert!(alice.index_table().is_empty());
        assert!(bob_at_alice.handshake().is_removed());
        assert_eq!(alice.peer_count(), 0);
    }

    #[test]
    fn test_removed_peer_cannot_respond() {
        let (alice, bob_at_alice, bob, _) = pair();
        let init = alice.create_initiation(&bob_at_alice).unwrap();
        let alice_at_bob = bob.consume_initiation(&init).unwrap();

        bob.remove_peer(alice_at_bob.public_key()).unwrap();
        assert!(matches!(
            bob.create_response(&alice_at_bob),
            Err(SecureGuardError::Handshake(HandshakeError::PeerRemoved))
        ));
        assert!(bob.index_table().is_empty());
    }

    #[test]
    fn test_removed_peer_gets_no_session() {
        let (alice, bob_at_alice, bob, _) = pair();
        let init = alice.create_initiation(&bob_at_alice).unwrap();
        let alice_at_bob = bob.consume_initiation(&init).unwrap();
        let response = bob.create_response(&alice_at_bob).unwrap();
        let peer = alice.consume_response(&response).unwrap();

        alice.remove_peer(peer.public_key()).unwrap();
        assert!(matches!(
            alice.begin_symmetric_session(&peer),
            Err(SecureGuardError::Handshake(HandshakeError::PeerRemoved))
        ));
        assert!(peer.keypairs().current().is_none());
        assert!(alice.index_table().is_empty());

        // A late response to the released index is dropped
        assert!(matches!(
            alice.consume_response(&response),
            Err(SecureGuardError::Handshake(HandshakeError::UnknownIndex { .. }))
        ));
    }

    #[test]
    fn test_dispatch_full_exchange() {
        let (alice, bob_at_alice, bob, alice_at_bob) = pair();

        let init = alice.create_initiation(&bob_at_alice).unwrap();
        let outcome = bob
            .receive_handshake_packet(&init.to_bytes(), &endpoint(), false)
            .unwrap();
        let HandshakeOutcome::Response {
            peer,
            response,
            keypair: bob_keys,
        } = outcome
        else {
            panic!("expected a response");
        };
        assert!(Arc::ptr_eq(&peer, &alice_at_bob));

        let outcome = alice
            .receive_handshake_packet(&response.to_bytes(), &endpoint(), false)
            .unwrap();
        let HandshakeOutcome::Established {
            keypair: alice_keys,
            ..
        } = outcome
        else {
            panic!("expected an established session");
        };

        assert_eq!(alice_keys.send_key(), bob_keys.receive_key());
        assert_eq!(alice_keys.receive_key(), bob_keys.send_key());
        assert_eq!(alice_keys.remote_index, bob_keys.local_index);
        assert_eq!(bob_keys.remote_index, alice_keys.local_index);

        // Bob's keypair waits in `next` until transport data confirms it
        assert!(alice_at_bob.keypairs().current().is_none());
        bob.confirm_keypair(bob_keys.local_index).unwrap();
        assert_eq!(
            alice_at_bob.keypairs().current().unwrap().local_index,
            bob_keys.local_index
        );
        assert!(bob.confirm_keypair(bob_keys.local_index).is_err());
    }

    #[test]
    fn test_cookie_required_under_load() {
        let (alice, bob_at_alice, bob, _) = pair();
        let src = endpoint();

        let init = alice.create_initiation(&bob_at_alice).unwrap();
        let outcome = bob
            .receive_handshake_packet(&init.to_bytes(), &src, true)
            .unwrap();
        let HandshakeOutcome::CookieReply(reply) = outcome else {
            panic!("expected a cookie reply");
        };
        assert_eq!(reply.receiver, init.sender);

        let outcome = alice
            .receive_handshake_packet(&reply.to_bytes(), &src, false)
            .unwrap();
        assert!(matches!(outcome, HandshakeOutcome::CookieStored { .. }));
        assert!(bob_at_alice.cookie_generator().has_valid_cookie());

        // The retry carries MAC2 and is processed despite the load
        std::thread::sleep(std::time::Duration::from_millis(40));
        let retry = alice.create_initiation(&bob_at_alice).unwrap();
        let outcome = bob
            .receive_handshake_packet(&retry.to_bytes(), &src, true)
            .unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Response { .. }));
    }

    #[test]
    fn test_bad_mac1_rejected_before_processing() {
        let (alice, bob_at_alice, bob, alice_at_bob) = pair();
        let mut bytes = alice.create_initiation(&bob_at_alice).unwrap().to_bytes();
        bytes[MessageInitiation::MAC1_OFFSET] ^= 0xff;

        let err = bob
            .receive_handshake_packet(&bytes, &endpoint(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            SecureGuardError::Protocol(ProtocolError::MacVerificationFailed)
        ));
        assert_eq!(alice_at_bob.handshake_state(), HandshakeState::Zeroed);
    }

    #[test]
    fn test_transport_data_not_handled() {
        let dev = device();
        let mut packet = [0u8; 32];
        packet[0] = 4;
        assert!(matches!(
            dev.receive_handshake_packet(&packet, &endpoint(), false),
            Err(SecureGuardError::Protocol(ProtocolError::InvalidMessageType { msg_type: 4 }))
        ));
    }

    #[test]
    fn test_set_private_key_rekeys_peers() {
        let (alice, bob_at_alice, bob, _) = pair();
        alice.create_initiation(&bob_at_alice).unwrap();

        alice.set_private_key(StaticPrivateKey::generate().unwrap());
        assert!(alice.index_table().is_empty());
        assert_eq!(bob_at_alice.handshake_state(), HandshakeState::Zeroed);

        // Bob does not know the new key
        std::thread::sleep(std::time::Duration::from_millis(40));
        let init = alice.create_initiation(&bob_at_alice).unwrap();
        assert!(matches!(
            bob.consume_initiation(&init),
            Err(SecureGuardError::Handshake(HandshakeError::UnknownPeer))
        ));
    }

    #[test]
    fn test_set_private_key_drops_self_peer() {
        let dev = device();
        let new_key = StaticPrivateKey::generate().unwrap();
        let new_public = new_key.public_key();
        dev.add_peer(new_public, PresharedKey::default()).unwrap();

        dev.set_private_key(new_key);
        assert_eq!(dev.public_key(), new_public);
        assert_eq!(dev.peer_count(), 0);
    }

    #[test]
    fn test_from_config() {
        let (alice_private, _) = x25519::generate_keypair().unwrap();
        let (_, bob_public) = x25519::generate_keypair().unwrap();
        let conf = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nPresharedKey = {}\n",
            BASE64.encode(alice_private),
            BASE64.encode(bob_public),
            BASE64.encode([9u8; 32])
        );

        let config = DeviceConfig::parse(&conf).unwrap();
        let dev = Device::from_config(&config).unwrap();
        assert_eq!(dev.public_key(), x25519::public_key(&alice_private));
        assert!(dev.lookup_peer(&bob_public).is_some());
    }
}
