//! Message Stream Encryption: the Diffie-Hellman handshake and RC4 stream
//! ciphers that wrap the peer-wire protocol when MSE is in effect.
//!
//! Grounded on `libtransmission/crypto.c`'s `dh_P`/`dh_G` constants and
//! key-derivation sequence.

use num_bigint::BigUint;
use rand::RngCore;
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

use crate::metainfo::InfoHash;

/// 768-bit MSE prime, byte-for-byte `dh_P` from `libtransmission/crypto.c`.
const DH_P: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34,
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74,
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37,
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6,
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];
const DH_G: u8 = 2;

/// Length in bytes of a private exponent: 160 bits.
const PRIVATE_EXPONENT_LEN: usize = 20;
/// Length of the shared secret / public keys: the prime is 96 bytes.
pub const KEY_LEN: usize = 96;
/// RC4 bytes discarded from each direction before use.
const DISCARD_LEN: usize = 1024;

/// The 3-valued session preference negotiated before the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoPolicy {
    Required,
    Preferred,
    Allowed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MseError {
    #[error("peer's public key was {got} bytes, expected {KEY_LEN}")]
    WrongPublicKeyLength { got: usize },
}

/// One side's half of an MSE Diffie-Hellman exchange.
pub struct DiffieHellman {
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    /// Generates a fresh 160-bit private exponent with a CSPRNG and its
    /// corresponding public key `G^x mod P`.
    pub fn generate() -> Self {
        let mut private_bytes = [0u8; PRIVATE_EXPONENT_LEN];
        rand::thread_rng().fill_bytes(&mut private_bytes);
        let private = BigUint::from_bytes_be(&private_bytes);
        let p = BigUint::from_bytes_be(&DH_P);
        let g = BigUint::from(DH_G);
        let public = g.modpow(&private, &p);
        Self { private, public }
    }

    /// `Y = G^x mod P`, left-padded to [`KEY_LEN`] bytes.
    pub fn public_key_bytes(&self) -> [u8; KEY_LEN] {
        let raw = self.public.to_bytes_be();
        let mut out = [0u8; KEY_LEN];
        out[KEY_LEN - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// `S = Y_peer^x mod P`, left-padded to [`KEY_LEN`] bytes.
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> Result<[u8; KEY_LEN], MseError> {
        if peer_public_key.len() != KEY_LEN {
            return Err(MseError::WrongPublicKeyLength {
                got: peer_public_key.len(),
            });
        }
        let p = BigUint::from_bytes_be(&DH_P);
        let peer_public = BigUint::from_bytes_be(peer_public_key);
        let secret = peer_public.modpow(&self.private, &p);
        let raw = secret.to_bytes_be();
        let mut out = [0u8; KEY_LEN];
        out[KEY_LEN - raw.len()..].copy_from_slice(&raw);
        Ok(out)
    }
}

/// `SHA1("keyA" || S || info_hash)` and `SHA1("keyB" || S || info_hash)`.
fn derive_key(label: &[u8; 4], shared_secret: &[u8; KEY_LEN], info_hash: &InfoHash) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.update(info_hash.0);
    hasher.finalize().into()
}

/// A pair of RC4 stream ciphers, one per direction, with the first
/// [`DISCARD_LEN`] bytes of each already discarded.
pub struct MseCiphers {
    pub encrypt: Rc4<U20>,
    pub decrypt: Rc4<U20>,
}

impl MseCiphers {
    /// `we_initiated`: whether we opened the TCP connection. The
    /// initiator encrypts with `keyA` and decrypts with `keyB`; the
    /// remote end does the reverse.
    pub fn new(shared_secret: &[u8; KEY_LEN], info_hash: &InfoHash, we_initiated: bool) -> Self {
        let key_a = derive_key(b"keyA", shared_secret, info_hash);
        let key_b = derive_key(b"keyB", shared_secret, info_hash);

        let (encrypt_key, decrypt_key) = if we_initiated {
            (key_a, key_b)
        } else {
            (key_b, key_a)
        };

        let mut encrypt = Rc4::<U20>::new((&encrypt_key).into());
        let mut decrypt = Rc4::<U20>::new((&decrypt_key).into());

        let mut discard = [0u8; DISCARD_LEN];
        encrypt.apply_keystream(&mut discard);
        let mut discard = [0u8; DISCARD_LEN];
        decrypt.apply_keystream(&mut discard);

        Self { encrypt, decrypt }
    }

    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.encrypt.apply_keystream(buf);
    }

    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        self.decrypt.apply_keystream(buf);
    }
}

/// Length of the random salt appended to a stored `ssha1` digest.
const SSHA1_SALT_LEN: usize = 8;
const SSHA1_SALT_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Salted-SHA1 password hashing, grounded on `libtransmission/crypto.c`'s
/// `tr_ssha1`: `"{" + hex(SHA1(plaintext || salt)) + salt`, no closing
/// brace. Used to store e.g. a web-UI password without keeping it plaintext.
pub fn ssha1(plaintext: &str) -> String {
    let mut salt = [0u8; SSHA1_SALT_LEN];
    let mut rng = rand::thread_rng();
    for byte in salt.iter_mut() {
        *byte = SSHA1_SALT_CHARSET[(rng.next_u32() as usize) % SSHA1_SALT_CHARSET.len()];
    }
    ssha1_with_salt(plaintext, &salt)
}

fn ssha1_with_salt(plaintext: &str, salt: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(plaintext.as_bytes());
    hasher.update(salt);
    let digest: [u8; 20] = hasher.finalize().into();
    format!("{{{}{}", hex::encode(digest), String::from_utf8_lossy(salt))
}

/// Verifies `plaintext` against a stored `ssha1` digest, re-deriving the
/// digest with the stored salt and comparing (`tr_ssha1_matches`).
pub fn ssha1_matches(stored: &str, plaintext: &str) -> bool {
    let Some(rest) = stored.strip_prefix('{') else {
        return false;
    };
    if rest.len() < 40 {
        return false;
    }
    let (hex_digest, salt) = rest.split_at(40);
    ssha1_with_salt(plaintext, salt.as_bytes())
        .strip_prefix('{')
        .map(|r| &r[..40] == hex_digest)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_exchange_produces_matching_shared_secrets() {
        let a = DiffieHellman::generate();
        let b = DiffieHellman::generate();
        let secret_a = a.shared_secret(&b.public_key_bytes()).unwrap();
        let secret_b = b.shared_secret(&a.public_key_bytes()).unwrap();
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn wrong_length_public_key_is_rejected() {
        let a = DiffieHellman::generate();
        assert_eq!(
            a.shared_secret(&[0u8; 10]),
            Err(MseError::WrongPublicKeyLength { got: 10 })
        );
    }

    #[test]
    fn derived_ciphers_are_mirror_images_across_the_two_sides() {
        let a = DiffieHellman::generate();
        let b = DiffieHellman::generate();
        let secret = a.shared_secret(&b.public_key_bytes()).unwrap();
        let info_hash = InfoHash([5u8; 20]);

        let mut initiator = MseCiphers::new(&secret, &info_hash, true);
        let mut responder = MseCiphers::new(&secret, &info_hash, false);

        let plaintext = b"peer wire handshake payload".to_vec();
        let mut on_wire = plaintext.clone();
        initiator.encrypt_in_place(&mut on_wire);
        assert_ne!(on_wire, plaintext);

        responder.decrypt_in_place(&mut on_wire);
        assert_eq!(on_wire, plaintext);
    }

    #[test]
    fn ssha1_matches_known_vector() {
        let stored = "{15ad0621b259a84d24dcd4e75b09004e98a3627bAMbyRHJy";
        assert!(ssha1_matches(stored, "test"));
    }

    #[test]
    fn ssha1_matches_rejects_wrong_plaintext() {
        let stored = "{15ad0621b259a84d24dcd4e75b09004e98a3627bAMbyRHJy";
        assert!(!ssha1_matches(stored, "etst"));
    }

    /// A zero-length salt is a valid stored form (`rest.len() == 40`
    /// exactly), not a malformed one.
    #[test]
    fn ssha1_matches_accepts_a_zero_length_salt() {
        let stored = "{a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
        assert!(ssha1_matches(stored, "test"));
    }

    #[test]
    fn freshly_hashed_password_matches_itself() {
        let stored = ssha1("hunter2");
        assert!(ssha1_matches(&stored, "hunter2"));
        assert!(!ssha1_matches(&stored, "hunter3"));
    }
}
