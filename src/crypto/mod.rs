//! Cryptographic primitives for WireGuard
//!
//! This module provides all cryptographic operations needed for the handshake:
//! - BLAKE2s hashing, MAC, HMAC, and the KDF chain (blake2s)
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman and key types (x25519)
//! - Noise IKpsk2 transcript mixing (noise)

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;

pub use x25519::{PresharedKey, StaticPrivateKey, StaticPublicKey};
