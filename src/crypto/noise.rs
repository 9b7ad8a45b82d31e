//! Noise IKpsk2 symmetric state for WireGuard
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s
//!
//! [`Transcript`] carries the running hash `h` and chaining key `ck` through
//! a single create/consume operation. It is built from the process-wide
//! initial values (or from a peer's stored transcript), mutated step by
//! step, and only copied back into the peer's handshake once every check has
//! passed. It is zeroized when dropped.

use lazy_static::lazy_static;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

lazy_static! {
    /// HASH(CONSTRUCTION)
    pub static ref INITIAL_CHAIN_KEY: [u8; HASH_LEN] = blake2s::hash(CONSTRUCTION);

    /// HASH(INITIAL_CHAIN_KEY || IDENTIFIER)
    pub static ref INITIAL_HASH: [u8; HASH_LEN] =
        blake2s::hash_two(&*INITIAL_CHAIN_KEY, IDENTIFIER);
}

/// Running hash and chaining key of one handshake attempt
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Transcript {
    /// Hash accumulator (Noise `h`)
    pub hash: [u8; HASH_LEN],
    /// Chaining key (Noise `ck`)
    pub chain_key: [u8; HASH_LEN],
}

impl Transcript {
    /// Start from the protocol-wide initial values
    pub fn initial() -> Self {
        Self {
            hash: *INITIAL_HASH,
            chain_key: *INITIAL_CHAIN_KEY,
        }
    }

    /// Resume from a stored transcript
    pub fn resume(hash: &[u8; HASH_LEN], chain_key: &[u8; HASH_LEN]) -> Self {
        Self {
            hash: *hash,
            chain_key: *chain_key,
        }
    }

    /// MixHash: h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// MixKey: ck = KDF1(ck, data)
    pub fn mix_key(&mut self, data: &[u8]) {
        self.chain_key = blake2s::kdf1(&self.chain_key, data);
    }

    /// (ck, k) = KDF2(ck, input_key_material), returning `k`
    pub fn mix_key_derive(&mut self, input: &[u8]) -> Zeroizing<[u8; HASH_LEN]> {
        Zeroizing::new(blake2s::kdf2_in_place(&mut self.chain_key, input))
    }

    /// (ck, tau, k) = KDF3(ck, psk); h = HASH(h || tau), returning `k`
    pub fn mix_preshared_key(&mut self, psk: &[u8; HASH_LEN]) -> Zeroizing<[u8; HASH_LEN]> {
        let (chain_key, tau, key) = blake2s::kdf3(&self.chain_key, psk);
        let tau = Zeroizing::new(tau);
        self.chain_key = chain_key;
        self.mix_hash(&*tau);
        Zeroizing::new(key)
    }

    /// Seal `plaintext` into `out` with nonce 0 and AAD `h`, then mix `out`
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; HASH_LEN],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError> {
        aead::seal(key, 0, plaintext, &self.hash, out)?;
        self.mix_hash(out);
        Ok(())
    }

    /// Open `ciphertext` into `out` with nonce 0 and AAD `h`, then mix it
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; HASH_LEN],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError> {
        aead::open(key, 0, ciphertext, &self.hash, out)?;
        self.mix_hash(ciphertext);
        Ok(())
    }

    /// Split the chaining key into the two directional transport keys
    ///
    /// The first output is the initiator's sending key.
    pub fn split(&self) -> (Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>) {
        let (first, second) = blake2s::kdf2(&self.chain_key, &[]);
        (Zeroizing::new(first), Zeroizing::new(second))
    }
}

/// Compute the MAC1 key from the receiver's public key
///
/// mac1_key = HASH(LABEL_MAC1 || receiver_public_key)
pub fn mac1_key(public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, public)
}

/// Compute the cookie encryption key from the cookie sender's public key
///
/// cookie_key = HASH(LABEL_COOKIE || public_key)
pub fn cookie_key(public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, public)
}
