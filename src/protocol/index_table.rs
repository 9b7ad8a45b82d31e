//! Process-wide index table
//!
//! Maps the random 32-bit indices carried in handshake and transport
//! messages back to the peer they belong to, and to whether that index
//! currently names an in-progress handshake or an established keypair.
//!
//! Backed by a `DashMap`: insert, lookup and delete are each atomic, and an
//! index is visible to every thread before it is returned to the caller, so
//! it can go on the wire immediately.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use crate::error::HandshakeError;
use crate::protocol::keypair::Keypair;
use crate::protocol::peer::Peer;

/// Attempts at drawing an unused index before giving up
pub const MAX_INDEX_ATTEMPTS: usize = 64;

/// What an index currently refers to
#[derive(Debug, Clone)]
pub enum IndexKind {
    /// The peer's in-progress handshake
    Handshake,
    /// An established session
    Keypair(Arc<Keypair>),
}

/// One entry of the index table
#[derive(Debug, Clone)]
pub struct IndexTableEntry {
    pub peer: Arc<Peer>,
    pub kind: IndexKind,
}

/// Index → peer/handshake/keypair map
///
/// Index 0 means "no index" throughout the crate and is never allocated.
#[derive(Debug, Default)]
pub struct IndexTable {
    table: DashMap<u32, IndexTableEntry>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh index bound to `peer`'s handshake
    pub fn new_index_for_handshake(&self, peer: &Arc<Peer>) -> Result<u32, HandshakeError> {
        self.new_index_with_rng(peer, &mut rand::thread_rng())
    }

    /// Allocation with an explicit random source
    pub fn new_index_with_rng<R: Rng + ?Sized>(
        &self,
        peer: &Arc<Peer>,
        rng: &mut R,
    ) -> Result<u32, HandshakeError> {
        for _ in 0..MAX_INDEX_ATTEMPTS {
            let index: u32 = rng.gen();
            if index == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.table.entry(index) {
                slot.insert(IndexTableEntry {
                    peer: Arc::clone(peer),
                    kind: IndexKind::Handshake,
                });
                tracing::trace!("Allocated index {:08x} for {}", index, peer);
                return Ok(index);
            }
        }
        Err(HandshakeError::IndexExhausted {
            attempts: MAX_INDEX_ATTEMPTS,
        })
    }

    /// Rebind a live handshake index to the keypair derived from it
    ///
    /// Unknown indices are left alone.
    pub fn swap_index_for_keypair(&self, index: u32, keypair: Arc<Keypair>) {
        if let Some(mut entry) = self.table.get_mut(&index) {
            entry.kind = IndexKind::Keypair(keypair);
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexTableEntry> {
        self.table.get(&index).map(|entry| entry.value().clone())
    }

    /// Remove an index; unknown or zero indices are a no-op
    pub fn delete(&self, index: u32) {
        if index == 0 {
            return;
        }
        self.table.remove(&index);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
