//! End-to-end handshake tests between in-process devices

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use secureguard_handshake::crypto::{PresharedKey, StaticPrivateKey};
use secureguard_handshake::error::{HandshakeError, ProtocolError, SecureGuardError};
use secureguard_handshake::protocol::{
    HandshakeState, IndexKind, MessageInitiation, MessageResponse,
};
use secureguard_handshake::{Device, HandshakeOutcome, Peer};

/// Past the timestamp granularity and the initiation rate limit
const BETWEEN_INITIATIONS: Duration = Duration::from_millis(40);

struct Pair {
    alice: Device,
    bob: Device,
    /// Bob as configured on Alice
    bob_at_alice: Arc<Peer>,
    /// Alice as configured on Bob
    alice_at_bob: Arc<Peer>,
}

fn pair_with_psks(alice_psk: [u8; 32], bob_psk: [u8; 32]) -> Pair {
    let alice = Device::new(StaticPrivateKey::generate().unwrap());
    let bob = Device::new(StaticPrivateKey::generate().unwrap());
    let bob_at_alice = alice
        .add_peer(bob.public_key(), PresharedKey::from(alice_psk))
        .unwrap();
    let alice_at_bob = bob
        .add_peer(alice.public_key(), PresharedKey::from(bob_psk))
        .unwrap();
    Pair {
        alice,
        bob,
        bob_at_alice,
        alice_at_bob,
    }
}

fn pair() -> Pair {
    pair_with_psks([0u8; 32], [0u8; 32])
}

fn endpoint() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 51820)
}

fn handshake_error(result: Result<impl std::fmt::Debug, SecureGuardError>) -> HandshakeError {
    match result {
        Err(SecureGuardError::Handshake(err)) => err,
        other => panic!("expected a handshake error, got {:?}", other),
    }
}

#[test]
fn full_handshake_derives_matching_keys() {
    let p = pair();

    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    assert_eq!(init.to_bytes().len(), MessageInitiation::SIZE);
    assert_eq!(p.bob_at_alice.handshake_state(), HandshakeState::InitiationCreated);

    let peer = p.bob.consume_initiation(&init).unwrap();
    assert!(Arc::ptr_eq(&peer, &p.alice_at_bob));
    assert_eq!(peer.handshake_state(), HandshakeState::InitiationConsumed);

    // Both sides hold the same transcript after the first message
    {
        let a = p.bob_at_alice.handshake();
        let b = p.alice_at_bob.handshake();
        assert_eq!(a.transcript_hash(), b.transcript_hash());
        assert_eq!(a.chain_key(), b.chain_key());
        assert_eq!(b.remote_index(), init.sender);
        assert_ne!(b.last_timestamp(), &[0u8; 12]);
        assert!(b.last_initiation_consumption().is_some());
    }

    let response = p.bob.create_response(&peer).unwrap();
    assert_eq!(response.to_bytes().len(), MessageResponse::SIZE);
    assert_eq!(response.receiver, init.sender);

    let peer = p.alice.consume_response(&response).unwrap();
    assert!(Arc::ptr_eq(&peer, &p.bob_at_alice));

    // ... and after the second
    {
        let a = p.bob_at_alice.handshake();
        let b = p.alice_at_bob.handshake();
        assert_eq!(a.state(), HandshakeState::ResponseConsumed);
        assert_eq!(b.state(), HandshakeState::ResponseCreated);
        assert_eq!(a.transcript_hash(), b.transcript_hash());
        assert_eq!(a.chain_key(), b.chain_key());
    }

    let alice_keys = p.alice.begin_symmetric_session(&p.bob_at_alice).unwrap();
    let bob_keys = p.bob.begin_symmetric_session(&p.alice_at_bob).unwrap();

    assert!(alice_keys.is_initiator);
    assert!(!bob_keys.is_initiator);
    assert_eq!(alice_keys.send_key(), bob_keys.receive_key());
    assert_eq!(alice_keys.receive_key(), bob_keys.send_key());
    assert_ne!(alice_keys.send_key(), alice_keys.receive_key());
    assert_eq!(alice_keys.local_index, init.sender);
    assert_eq!(alice_keys.remote_index, response.sender);
    assert_eq!(bob_keys.local_index, response.sender);
    assert_eq!(bob_keys.remote_index, init.sender);

    // Transcripts are wiped once keys are split out
    for peer in [&p.bob_at_alice, &p.alice_at_bob] {
        let hs = peer.handshake();
        assert_eq!(hs.state(), HandshakeState::Zeroed);
        assert_eq!(hs.transcript_hash(), &[0u8; 32]);
        assert_eq!(hs.chain_key(), &[0u8; 32]);
        assert_eq!(hs.local_index(), 0);
    }

    // The handshake index now names the keypair
    match p.alice.index_table().lookup(alice_keys.local_index).unwrap().kind {
        IndexKind::Keypair(kp) => assert!(Arc::ptr_eq(&kp, &alice_keys)),
        IndexKind::Handshake => panic!("index still bound to the handshake"),
    }
    assert_eq!(p.alice.index_table().len(), 1);
    assert_eq!(p.bob.index_table().len(), 1);
    assert!(p.bob_at_alice.keypairs().current().is_some());
    assert!(p.alice_at_bob.keypairs().next().is_some());
}

#[test]
fn matching_preshared_keys_complete() {
    let p = pair_with_psks([5u8; 32], [5u8; 32]);

    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    let peer = p.bob.consume_initiation(&init).unwrap();
    let response = p.bob.create_response(&peer).unwrap();
    p.alice.consume_response(&response).unwrap();

    let alice_keys = p.alice.begin_symmetric_session(&p.bob_at_alice).unwrap();
    let bob_keys = p.bob.begin_symmetric_session(&p.alice_at_bob).unwrap();
    assert_eq!(alice_keys.send_key(), bob_keys.receive_key());
}

#[test]
fn mismatched_preshared_keys_fail_authentication() {
    let p = pair_with_psks([1u8; 32], [2u8; 32]);

    // The PSK only enters with the response
    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    let peer = p.bob.consume_initiation(&init).unwrap();
    let response = p.bob.create_response(&peer).unwrap();

    let before = *p.bob_at_alice.handshake().transcript_hash();
    assert!(matches!(
        handshake_error(p.alice.consume_response(&response)),
        HandshakeError::AuthenticationFailure
    ));

    // Nothing was committed
    let hs = p.bob_at_alice.handshake();
    assert_eq!(hs.state(), HandshakeState::InitiationCreated);
    assert_eq!(hs.transcript_hash(), &before);
}

#[test]
fn replayed_initiation_rejected() {
    let p = pair();
    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();

    p.bob.consume_initiation(&init).unwrap();
    let stamp = *p.alice_at_bob.handshake().last_timestamp();

    thread::sleep(BETWEEN_INITIATIONS);
    assert!(matches!(
        handshake_error(p.bob.consume_initiation(&init)),
        HandshakeError::ReplayDetected
    ));
    assert_eq!(p.alice_at_bob.handshake().last_timestamp(), &stamp);
}

#[test]
fn older_initiation_rejected_after_newer() {
    let p = pair();
    let older = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    thread::sleep(BETWEEN_INITIATIONS);
    let newer = p.alice.create_initiation(&p.bob_at_alice).unwrap();

    p.bob.consume_initiation(&newer).unwrap();
    thread::sleep(BETWEEN_INITIATIONS);
    assert!(matches!(
        handshake_error(p.bob.consume_initiation(&older)),
        HandshakeError::ReplayDetected
    ));
}

#[test]
fn initiation_flood_rejected() {
    let p = pair();
    let first = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    thread::sleep(BETWEEN_INITIATIONS);
    let second = p.alice.create_initiation(&p.bob_at_alice).unwrap();

    p.bob.consume_initiation(&first).unwrap();
    assert!(matches!(
        handshake_error(p.bob.consume_initiation(&second)),
        HandshakeError::Flood
    ));

    // Accepted once the rate limit has passed
    thread::sleep(BETWEEN_INITIATIONS);
    p.bob.consume_initiation(&second).unwrap();
}

#[test]
fn unknown_peer_rejected() {
    let p = pair();
    let stranger = Device::new(StaticPrivateKey::generate().unwrap());
    let bob_at_stranger = stranger
        .add_peer(p.bob.public_key(), PresharedKey::default())
        .unwrap();

    let init = stranger.create_initiation(&bob_at_stranger).unwrap();
    assert!(matches!(
        handshake_error(p.bob.consume_initiation(&init)),
        HandshakeError::UnknownPeer
    ));
}

#[test]
fn initiation_for_someone_else_fails_authentication() {
    let p = pair();
    let carol = Device::new(StaticPrivateKey::generate().unwrap());
    carol
        .add_peer(p.alice.public_key(), PresharedKey::default())
        .unwrap();

    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    assert!(matches!(
        handshake_error(carol.consume_initiation(&init)),
        HandshakeError::AuthenticationFailure
    ));
}

#[test]
fn response_requires_consumed_initiation() {
    let p = pair();
    assert!(matches!(
        handshake_error(p.bob.create_response(&p.alice_at_bob)),
        HandshakeError::InvalidState {
            expected: HandshakeState::InitiationConsumed,
            found: HandshakeState::Zeroed,
        }
    ));
    assert!(p.bob.index_table().is_empty());
}

#[test]
fn split_requires_finished_handshake() {
    let p = pair();
    p.alice.create_initiation(&p.bob_at_alice).unwrap();
    assert!(matches!(
        handshake_error(p.alice.begin_symmetric_session(&p.bob_at_alice)),
        HandshakeError::InvalidState {
            found: HandshakeState::InitiationCreated,
            ..
        }
    ));
}

#[test]
fn response_to_unknown_index_rejected() {
    let p = pair();
    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    let peer = p.bob.consume_initiation(&init).unwrap();
    let mut response = p.bob.create_response(&peer).unwrap();

    response.receiver = init.sender.wrapping_add(1);
    assert!(matches!(
        handshake_error(p.alice.consume_response(&response)),
        HandshakeError::UnknownIndex { .. }
    ));
}

#[test]
fn response_to_superseded_initiation_rejected() {
    let p = pair();
    let first = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    let peer = p.bob.consume_initiation(&first).unwrap();
    let response = p.bob.create_response(&peer).unwrap();

    // A new attempt releases the index the response is addressed to
    let second = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    assert_ne!(first.sender, second.sender);
    assert!(p.alice.index_table().lookup(first.sender).is_none());

    assert!(matches!(
        handshake_error(p.alice.consume_response(&response)),
        HandshakeError::UnknownIndex { .. }
    ));
}

#[test]
fn wrong_message_type_rejected() {
    let p = pair();
    let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
    let bytes = init.to_bytes();

    let mut retagged = bytes;
    retagged[0] = 2;
    assert!(matches!(
        MessageInitiation::from_bytes(&retagged),
        Err(ProtocolError::InvalidMessageType { msg_type: 2 })
    ));

    // Right tag, wrong size
    assert!(matches!(
        MessageResponse::from_bytes(&bytes[..MessageResponse::SIZE]),
        Err(ProtocolError::InvalidMessageType { .. })
    ));
    assert!(matches!(
        MessageInitiation::from_bytes(&bytes[..100]),
        Err(ProtocolError::InvalidMessageLength { expected: 148, got: 100 })
    ));
}

#[test]
fn repeated_sessions_rotate_keypairs() {
    let p = pair();
    let mut established = Vec::new();

    for _ in 0..3 {
        let init = p.alice.create_initiation(&p.bob_at_alice).unwrap();
        let outcome = p
            .bob
            .receive_handshake_packet(&init.to_bytes(), &endpoint(), false)
            .unwrap();
        let HandshakeOutcome::Response { response, .. } = outcome else {
            panic!("expected a response");
        };
        let outcome = p
            .alice
            .receive_handshake_packet(&response.to_bytes(), &endpoint(), false)
            .unwrap();
        let HandshakeOutcome::Established { keypair, .. } = outcome else {
            panic!("expected an established session");
        };
        established.push(keypair);
        thread::sleep(BETWEEN_INITIATIONS);
    }

    let slots = p.bob_at_alice.keypairs();
    assert_eq!(slots.current().unwrap().local_index, established[2].local_index);
    assert_eq!(slots.previous().unwrap().local_index, established[1].local_index);
    drop(slots);

    // The oldest keypair's index was released
    assert!(p.alice.index_table().lookup(established[0].local_index).is_none());
    assert_eq!(p.alice.index_table().len(), 2);
}

#[test]
fn concurrent_handshakes_against_one_responder() {
    let responder = Arc::new(Device::new(StaticPrivateKey::generate().unwrap()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let initiator = Device::new(StaticPrivateKey::generate().unwrap());
            responder
                .add_peer(initiator.public_key(), PresharedKey::default())
                .unwrap();
            let responder = Arc::clone(&responder);
            thread::spawn(move || {
                let peer = initiator
                    .add_peer(responder.public_key(), PresharedKey::default())
                    .unwrap();
                let init = initiator.create_initiation(&peer).unwrap();
                let remote = responder.consume_initiation(&init).unwrap();
                let response = responder.create_response(&remote).unwrap();
                let responder_keys = responder.begin_symmetric_session(&remote).unwrap();
                initiator.consume_response(&response).unwrap();
                let initiator_keys = initiator.begin_symmetric_session(&peer).unwrap();
                assert_eq!(initiator_keys.send_key(), responder_keys.receive_key());
                responder_keys.local_index
            })
        })
        .collect();

    let mut indices: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 8);
    assert_eq!(responder.index_table().len(), 8);
}
