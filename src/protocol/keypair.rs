//! Transport keypairs produced by completed handshakes
//!
//! A [`Keypair`] is what the handshake hands to the transport layer. Each
//! peer keeps up to three of them: `current` (used for sending), `previous`
//! (still accepted while the other side catches up) and `next` (a responder
//! keypair not yet confirmed by an inbound transport packet).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::error::HandshakeError;

/// Initiate rekey after this many seconds
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Reject packets from keypairs older than this
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Directional session keys for one established session
pub struct Keypair {
    send_key: Zeroizing<[u8; 32]>,
    receive_key: Zeroizing<[u8; 32]>,
    /// Whether we sent the initiation that produced this keypair
    pub is_initiator: bool,
    /// When the keys were derived
    pub created: Instant,
    /// Our index; inbound transport packets carry it as receiver
    pub local_index: u32,
    /// Peer's index; outbound transport packets carry it as receiver
    pub remote_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: Zeroizing<[u8; 32]>,
        receive_key: Zeroizing<[u8; 32]>,
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send_key,
            receive_key,
            is_initiator,
            created: Instant::now(),
            local_index,
            remote_index,
        }
    }

    /// Key for encrypting outgoing packets
    pub fn send_key(&self) -> &[u8; 32] {
        &self.send_key
    }

    /// Key for decrypting incoming packets
    pub fn receive_key(&self) -> &[u8; 32] {
        &self.receive_key
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Only the initiator of a keypair rekeys on age
    pub fn needs_rekey(&self) -> bool {
        self.is_initiator && self.age() >= REKEY_AFTER_TIME
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("is_initiator", &self.is_initiator)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

/// The previous/current/next keypair slots of one peer
#[derive(Debug, Default)]
pub struct Keypairs {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

impl Keypairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current keypair, if still usable
    pub fn current(&self) -> Option<&Arc<Keypair>> {
        self.current.as_ref().filter(|k| !k.is_expired())
    }

    pub fn previous(&self) -> Option<&Arc<Keypair>> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<&Arc<Keypair>> {
        self.next.as_ref()
    }

    /// Install a freshly derived keypair
    ///
    /// An initiator's keypair becomes `current` immediately; a responder's
    /// waits in `next` until confirmed. Returns the keypairs that fell out
    /// of every slot so the caller can release their indices.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut retired = Vec::new();
        if keypair.is_initiator {
            if let Some(next) = self.next.take() {
                retired.extend(self.previous.replace(next));
                retired.extend(self.current.take());
            } else {
                retired.extend(self.previous.take());
                self.previous = self.current.take();
            }
            self.current = Some(keypair);
        } else {
            retired.extend(self.next.replace(keypair));
            retired.extend(self.previous.take());
        }
        retired
    }

    /// Promote `next` to `current` once a packet arrived under it
    ///
    /// Returns the keypair retired from `previous`, if any.
    pub fn confirm_next(
        &mut self,
        local_index: u32,
    ) -> Result<Option<Arc<Keypair>>, HandshakeError> {
        match &self.next {
            Some(next) if next.local_index == local_index => {}
            _ => return Err(HandshakeError::UnknownIndex { index: local_index }),
        }
        let retired = self.previous.take();
        self.previous = self.current.take();
        self.current = self.next.take();
        Ok(retired)
    }

    /// Find a keypair by our local index
    pub fn find_by_index(&self, local_index: u32) -> Option<&Arc<Keypair>> {
        [&self.current, &self.previous, &self.next]
            .into_iter()
            .flatten()
            .find(|k| k.local_index == local_index && !k.is_expired())
    }

    /// Drop every keypair, returning them for index release
    pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
        [self.previous.take(), self.current.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}
