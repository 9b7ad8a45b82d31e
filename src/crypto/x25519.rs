//! X25519 Diffie-Hellman key exchange for WireGuard
//!
//! Provides the long-term key types, ephemeral key generation and DH with
//! rejection of non-contributory (low-order) results.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// A peer's long-term (or ephemeral) public key
pub type StaticPublicKey = [u8; KEY_LEN];

/// The device's long-term private key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticPrivateKey([u8; KEY_LEN]);

impl StaticPrivateKey {
    /// Generate a fresh private key from the OS random source
    pub fn generate() -> Result<Self, CryptoError> {
        generate_private().map(Self)
    }

    /// Public key matching this private key
    pub fn public_key(&self) -> StaticPublicKey {
        public_key(&self.0)
    }

    /// DH between this key and a peer's public key
    pub fn shared_secret(&self, public: &StaticPublicKey) -> Result<[u8; KEY_LEN], CryptoError> {
        dh(&self.0, public)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        is_zero(&self.0)
    }
}

impl From<[u8; KEY_LEN]> for StaticPrivateKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for StaticPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticPrivateKey(..)")
    }
}

/// Symmetric secret shared with one peer; all zeros when not configured
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_LEN]);

impl PresharedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for PresharedKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Option<[u8; KEY_LEN]>> for PresharedKey {
    fn from(bytes: Option<[u8; KEY_LEN]>) -> Self {
        Self(bytes.unwrap_or_default())
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

/// Generate a raw private key, surfacing RNG failure instead of panicking
pub fn generate_private() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| CryptoError::KeyGeneration)?;
    // Clamp so the stored bytes are the canonical scalar
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    Ok(bytes)
}

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CryptoError> {
    let private = generate_private()?;
    let public = public_key(&private);
    Ok((private, public))
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Perform X25519 Diffie-Hellman key exchange
///
/// An all-zero shared secret means the peer supplied a low-order point; it
/// is rejected rather than fed into the key schedule.
pub fn dh(
    private_key: &[u8; KEY_LEN],
    public_key: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN], CryptoError> {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    let shared = secret.diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(CryptoError::DiffieHellman);
    }
    Ok(shared.to_bytes())
}

/// True when every byte is zero
pub fn is_zero(key: &[u8]) -> bool {
    key.iter().fold(0u8, |acc, &b| acc | b) == 0
}
