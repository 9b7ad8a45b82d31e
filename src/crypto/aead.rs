//! AEAD encryption for WireGuard
//!
//! ChaCha20-Poly1305 seals the handshake fields (nonce 0) and transport data
//! (nonce = counter); XChaCha20-Poly1305 seals cookie replies. All functions
//! write into caller-provided buffers so the fixed message layouts can be
//! filled without intermediate allocations.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// WireGuard nonce: 4 zero bytes followed by the little-endian counter
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    *Nonce::from_slice(&nonce_bytes)
}

fn check_sealed_len(plain_len: usize, sealed_len: usize) -> Result<(), CryptoError> {
    if sealed_len != plain_len + TAG_LEN {
        return Err(CryptoError::Encryption);
    }
    Ok(())
}

/// Seal `plaintext` into `out` (`plaintext.len() + TAG_LEN` bytes)
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    check_sealed_len(plaintext.len(), out.len())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let (body, tag_out) = out.split_at_mut(plaintext.len());
    body.copy_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(&counter_nonce(counter), aad, body)
        .map_err(|_| CryptoError::Encryption)?;
    tag_out.copy_from_slice(&tag);
    Ok(())
}

/// Open `ciphertext` (body followed by tag) into `out`
///
/// On failure `out` is zeroed so no unauthenticated plaintext escapes.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    if ciphertext.len() < TAG_LEN || out.len() != ciphertext.len() - TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let (body, tag) = ciphertext.split_at(out.len());
    out.copy_from_slice(body);
    cipher
        .decrypt_in_place_detached(&counter_nonce(counter), aad, out, Tag::from_slice(tag))
        .map_err(|_| {
            out.zeroize();
            CryptoError::Decryption
        })
}

/// Seal using XChaCha20-Poly1305 (cookie replies)
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    check_sealed_len(plaintext.len(), out.len())?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let (body, tag_out) = out.split_at_mut(plaintext.len());
    body.copy_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, body)
        .map_err(|_| CryptoError::Encryption)?;
    tag_out.copy_from_slice(&tag);
    Ok(())
}

/// Open using XChaCha20-Poly1305 (cookie replies)
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    if ciphertext.len() < TAG_LEN || out.len() != ciphertext.len() - TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let (body, tag) = ciphertext.split_at(out.len());
    out.copy_from_slice(body);
    cipher
        .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, out, Tag::from_slice(tag))
        .map_err(|_| {
            out.zeroize();
            CryptoError::Decryption
        })
}
