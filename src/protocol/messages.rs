//! WireGuard message wire formats
//!
//! Defines the packet structures for:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16 byte header + sealed content)
//!
//! The type is an 8-bit tag followed by three zero bytes; read as a
//! little-endian `u32` the whole word must equal the tag.

use crate::crypto::aead::{TAG_LEN, XNONCE_LEN};
use crate::crypto::blake2s::MAC_LEN;
use crate::crypto::x25519::KEY_LEN;
use crate::error::ProtocolError;

/// Size of a TAI64N timestamp
pub const TIMESTAMP_LEN: usize = 12;

/// Size of the cookie carried in a cookie reply
pub const COOKIE_LEN: usize = 16;

/// WireGuard message types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

/// Check the type word, then the exact size of a handshake-family message
fn check_header(data: &[u8], expected: MessageType, size: usize) -> Result<(), ProtocolError> {
    let msg_type = get_message_type(data)?;
    if msg_type != expected {
        return Err(ProtocolError::InvalidMessageType {
            msg_type: msg_type as u32,
        });
    }
    if data.len() != size {
        return Err(ProtocolError::InvalidMessageLength {
            expected: size,
            got: data.len(),
        });
    }
    Ok(())
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(4) | sender(4) | ephemeral(32) | static(32+16) |
/// timestamp(12+16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInitiation {
    pub sender: u32,
    pub ephemeral: [u8; KEY_LEN],
    pub encrypted_static: [u8; KEY_LEN + TAG_LEN],
    pub encrypted_timestamp: [u8; TIMESTAMP_LEN + TAG_LEN],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl MessageInitiation {
    /// Size of the handshake initiation message
    pub const SIZE: usize = 148;
    /// Offset of the MAC1 field
    pub const MAC1_OFFSET: usize = 116;
    /// Offset of the MAC2 field
    pub const MAC2_OFFSET: usize = 132;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::HandshakeInitiation, Self::SIZE)?;

        Ok(Self {
            sender: read_u32(data, 4),
            ephemeral: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(4) | sender(4) | receiver(4) | ephemeral(32) |
/// empty(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; KEY_LEN],
    /// Just the auth tag over an empty payload
    pub encrypted_nothing: [u8; TAG_LEN],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl MessageResponse {
    /// Size of the handshake response message
    pub const SIZE: usize = 92;
    /// Offset of the MAC1 field
    pub const MAC1_OFFSET: usize = 60;
    /// Offset of the MAC2 field
    pub const MAC2_OFFSET: usize = 76;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::HandshakeResponse, Self::SIZE)?;

        Ok(Self {
            sender: read_u32(data, 4),
            receiver: read_u32(data, 8),
            ephemeral: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(4) | receiver(4) | nonce(24) | cookie(16+16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCookieReply {
    pub receiver: u32,
    pub nonce: [u8; XNONCE_LEN],
    pub encrypted_cookie: [u8; COOKIE_LEN + TAG_LEN],
}

impl MessageCookieReply {
    /// Size of the cookie reply message
    pub const SIZE: usize = 64;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::CookieReply, Self::SIZE)?;

        Ok(Self {
            receiver: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport Data message header (16 bytes, followed by sealed content)
///
/// ```text
/// type(4) | receiver(4) | counter(8) | content(n+16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTransport {
    pub receiver: u32,
    pub counter: u64,
}

impl MessageTransport {
    /// Size of the transport header (not including sealed content)
    pub const HEADER_SIZE: usize = 16;

    /// Minimum size of a transport message (header + auth tag); also the
    /// size of a keepalive
    pub const MIN_SIZE: usize = Self::HEADER_SIZE + TAG_LEN;

    /// Offset of the receiver index
    pub const OFFSET_RECEIVER: usize = 4;
    /// Offset of the counter
    pub const OFFSET_COUNTER: usize = 8;
    /// Offset of the sealed content
    pub const OFFSET_CONTENT: usize = 16;

    /// Build a transport message around already-sealed content
    pub fn build(&self, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + sealed.len());

        buf.extend_from_slice(&(MessageType::TransportData as u32).to_le_bytes());
        buf.extend_from_slice(&self.receiver.to_le_bytes());
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf.extend_from_slice(sealed);

        buf
    }

    /// Parse the header, returning it with the sealed content
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let msg_type = get_message_type(data)?;
        if msg_type != MessageType::TransportData {
            return Err(ProtocolError::InvalidMessageType {
                msg_type: msg_type as u32,
            });
        }
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }

        let header = Self {
            receiver: read_u32(data, Self::OFFSET_RECEIVER),
            counter: read_u64(data, Self::OFFSET_COUNTER),
        };
        Ok((header, &data[Self::OFFSET_CONTENT..]))
    }
}

/// Get the message type from a packet
pub fn get_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(read_u32(data, 0))
}
