//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Cookie/DoS protection
//! - Index table and peer state
//! - Transport keypairs

pub mod cookie;
pub mod handshake;
pub mod index_table;
pub mod keypair;
pub mod messages;
pub mod peer;

pub use cookie::{CookieChecker, CookieGenerator, MacVerdict};
pub use handshake::{Handshake, HandshakeState};
pub use index_table::{IndexKind, IndexTable, IndexTableEntry};
pub use keypair::{Keypair, Keypairs};
pub use messages::{
    get_message_type, MessageCookieReply, MessageInitiation, MessageResponse, MessageTransport,
    MessageType,
};
pub use peer::Peer;
