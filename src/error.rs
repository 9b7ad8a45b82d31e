//! Error types for the SecureGuard handshake engine

use thiserror::Error;

use crate::protocol::handshake::HandshakeState;

/// Main error type for SecureGuard
#[derive(Error, Debug)]
pub enum SecureGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake state machine errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Duplicate peer: {public_key}")]
    DuplicatePeer { public_key: String },

    #[error("Peer public key equals the interface public key")]
    PeerIsSelf,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("DH computation produced a non-contributory result")]
    DiffieHellman,

    #[error("Random key generation failed")]
    KeyGeneration,
}

/// Wire format errors
///
/// These are raised before any handshake state is consulted.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,
}

/// Handshake processing errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// An AEAD field failed to open; which field is deliberately not reported
    #[error("Handshake authentication failed")]
    AuthenticationFailure,

    #[error("Replayed initiation: timestamp is not newer than the last accepted one")]
    ReplayDetected,

    #[error("Initiation received too soon after the previous one")]
    Flood,

    #[error("Initiation from unknown peer")]
    UnknownPeer,

    #[error("Peer is misconfigured: static-static secret is zero")]
    MisconfiguredPeer,

    #[error("Could not allocate a free index after {attempts} attempts")]
    IndexExhausted { attempts: usize },

    #[error("Invalid handshake state: expected {expected}, found {found}")]
    InvalidState {
        expected: HandshakeState,
        found: HandshakeState,
    },

    #[error("No handshake registered for index {index}")]
    UnknownIndex { index: u32 },

    #[error("Ephemeral key generation failed")]
    KeyGeneration,

    #[error("Peer has been removed from the device")]
    PeerRemoved,
}

impl SecureGuardError {
    /// Whether this error came from validating an inbound message.
    ///
    /// Such errors are never answered on the network; the caller only logs
    /// or counts them.
    pub fn is_silent(&self) -> bool {
        match self {
            Self::Protocol(_) => true,
            Self::Crypto(CryptoError::Decryption) => true,
            Self::Handshake(err) => matches!(
                err,
                HandshakeError::AuthenticationFailure
                    | HandshakeError::ReplayDetected
                    | HandshakeError::Flood
                    | HandshakeError::UnknownPeer
                    | HandshakeError::UnknownIndex { .. }
                    | HandshakeError::InvalidState { .. }
                    | HandshakeError::PeerRemoved
            ),
            _ => false,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Local configuration problems need operator attention
            Self::Config(_) => false,
            Self::Handshake(HandshakeError::MisconfiguredPeer) => false,

            // Retrying the operation may succeed
            Self::Handshake(HandshakeError::IndexExhausted { .. }) => true,
            Self::Handshake(HandshakeError::KeyGeneration) => true,
            Self::Crypto(CryptoError::KeyGeneration) => true,

            _ => self.is_silent(),
        }
    }
}

/// Result type alias for SecureGuard operations
pub type Result<T> = std::result::Result<T, SecureGuardError>;
