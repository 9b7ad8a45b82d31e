//! BLAKE2s cryptographic primitives for WireGuard
//!
//! Implements BLAKE2s hash, keyed MAC, HMAC, and the KDF1/KDF2/KDF3 chain
//! used by the Noise handshake.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of BLAKE2s MAC output (16 bytes for WireGuard)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// BLAKE2s keyed MAC (16 bytes output) with 32-byte key
/// Used for MAC1 and for cookie derivation
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("valid key length");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// BLAKE2s keyed MAC (16 bytes output) with 16-byte key
/// Used for MAC2 (keyed with cookie)
pub fn mac_with_cookie(key: &[u8; MAC_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("valid key length");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// Constant-time equality for MAC values
pub fn mac_eq(a: &[u8; MAC_LEN], b: &[u8]) -> bool {
    b.len() == MAC_LEN && bool::from(a.ct_eq(b))
}

/// HMAC-BLAKE2s using the standard RFC 2104 construction
///
/// Despite the WireGuard whitepaper notation, implementations use the
/// standard HMAC construction: H((K ⊕ opad) || H((K ⊕ ipad) || M))
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HMAC over `prev || counter`, the expansion step of the KDF chain
fn expand(prk: &[u8; HASH_LEN], prev: Option<&[u8; HASH_LEN]>, counter: u8) -> [u8; HASH_LEN] {
    let mut input = Zeroizing::new([0u8; HASH_LEN + 1]);
    let len = match prev {
        Some(prev) => {
            input[..HASH_LEN].copy_from_slice(prev);
            input[HASH_LEN] = counter;
            HASH_LEN + 1
        }
        None => {
            input[0] = counter;
            1
        }
    };
    hmac(prk, &input[..len])
}

/// KDF1: Single-output key derivation
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = Zeroizing::new(hmac(key, input));
    expand(&prk, None, 0x01)
}

/// KDF2: Two-output key derivation
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = Zeroizing::new(hmac(key, input));

    // T1 = HMAC(prk, 0x01)
    let t1 = expand(&prk, None, 0x01);
    // T2 = HMAC(prk, T1 || 0x02)
    let t2 = expand(&prk, Some(&t1), 0x02);

    (t1, t2)
}

/// KDF3: Three-output key derivation
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = Zeroizing::new(hmac(key, input));

    let t1 = expand(&prk, None, 0x01);
    let t2 = expand(&prk, Some(&t1), 0x02);
    // T3 = HMAC(prk, T2 || 0x03)
    let t3 = expand(&prk, Some(&t2), 0x03);

    (t1, t2, t3)
}

/// KDF2 into an existing chaining key, returning only the derived key
///
/// ck := T1, returns T2
pub fn kdf2_in_place(chain_key: &mut [u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let (mut t1, t2) = kdf2(chain_key, input);
    chain_key.copy_from_slice(&t1);
    t1.zeroize();
    t2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_empty() {
        // BLAKE2s-256("") from the reference implementation
        let expected =
            hex::decode("69217a3079908094e11121d042354a7c1f55b6482ca1a51e1b250dfd1ed0eef9")
                .unwrap();
        assert_eq!(hash(&[]).to_vec(), expected);
    }

    #[test]
    fn test_hash_two() {
        let a = b"hello";
        let b = b"world";

        let mut combined = Vec::new();
        combined.extend_from_slice(a);
        combined.extend_from_slice(b);

        assert_eq!(hash_two(a, b), hash(&combined));
    }

    #[test]
    fn test_mac_keys_differ() {
        let data = b"test data";
        assert_ne!(mac(&[0u8; 32], data), mac(&[1u8; 32], data));
        assert_ne!(mac_with_cookie(&[0u8; 16], data), mac_with_cookie(&[1u8; 16], data));
    }

    #[test]
    fn test_mac_eq() {
        let tag = mac(&[7u8; 32], b"payload");
        assert!(mac_eq(&tag, &tag));

        let mut other = tag;
        other[15] ^= 1;
        assert!(!mac_eq(&tag, &other));
        assert!(!mac_eq(&tag, &tag[..15]));
    }

    #[test]
    fn test_kdf_chain_prefix_consistency() {
        let key = [3u8; 32];
        let input = b"test input";

        let k1 = kdf1(&key, input);
        let (k2a, k2b) = kdf2(&key, input);
        let (k3a, k3b, k3c) = kdf3(&key, input);

        // Each KDF is a prefix of the longer ones
        assert_eq!(k1, k2a);
        assert_eq!(k2a, k3a);
        assert_eq!(k2b, k3b);

        assert_ne!(k3a, k3b);
        assert_ne!(k3b, k3c);
    }

    #[test]
    fn test_kdf3_known_answer() {
        let (t1, t2, t3) = kdf3(&[0u8; 32], b"input");
        assert_eq!(
            hex::encode(t1),
            "fbff6119f265251560576e82518f61aeb420cff55b5dcf649475b758a01f3951"
        );
        assert_eq!(
            hex::encode(t2),
            "a534dd2f7d3e7e614508dba7c675d5cf1008b383670cd8fd46231aa38bbfb618"
        );
        assert_eq!(
            hex::encode(t3),
            "618328297d2af9af1df2c2ef6bba1ab41ddfb8e0fd0ee8bdb7ef237790eba011"
        );
    }

    #[test]
    fn test_mac_known_answer() {
        assert_eq!(
            hex::encode(mac(&[7u8; 32], b"message")),
            "4a9967062e0f02091fba8ee2b1c43870"
        );
        assert_eq!(
            hex::encode(mac_with_cookie(&[7u8; 16], b"message")),
            "307eaa4dec5479ee032ca5a4ccea3fb5"
        );
    }

    #[test]
    fn test_kdf2_in_place() {
        let key = [9u8; 32];
        let (expected_ck, expected_key) = kdf2(&key, b"dh");

        let mut ck = key;
        let derived = kdf2_in_place(&mut ck, b"dh");
        assert_eq!(ck, expected_ck);
        assert_eq!(derived, expected_key);
    }

    #[test]
    fn test_kdf1_empty_input() {
        // Transport key split uses an empty input
        let ck = [0u8; 32];
        let (send, recv) = kdf2(&ck, &[]);
        assert_eq!(kdf1(&ck, &[]), send);
        assert_ne!(send, recv);
    }
}
