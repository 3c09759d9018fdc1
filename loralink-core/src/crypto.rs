//! Crypto primitives: P-256 ECDH, session key derivation, AES-128-CTR, random bytes.

use std::fmt;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const SESSION_KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 16;
pub const IV_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];
pub type Iv = [u8; IV_LEN];

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// 128-bit symmetric key shared by a paired couple of devices. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// An all-zero key is what an erased key store yields; never a usable key.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// SEC1-encoded P-256 public key as carried in bind packets (uncompressed, 65 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPublicKey(Vec<u8>);

impl EncodedPublicKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EncodedPublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One handshake's ephemeral key pair. The secret never leaves this struct.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: EncodedPublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = EncodedPublicKey(
            secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        );
        Self { secret, public }
    }

    pub fn public_key(&self) -> &EncodedPublicKey {
        &self.public
    }

    /// ECDH with the peer's SEC1 public key. Returns the x-coordinate, big-endian,
    /// with leading zero bytes stripped (at least one byte kept).
    pub fn shared_secret(
        &self,
        peer_public: &EncodedPublicKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = self.secret.diffie_hellman(&peer);
        let x = shared.raw_secret_bytes();
        let first = x.iter().position(|&b| b != 0).unwrap_or(x.len() - 1);
        Ok(Zeroizing::new(x[first..].to_vec()))
    }
}

/// Session key = SHA-256(shared_secret || nonce_a || nonce_b)[..16].
pub fn derive_session_key(shared_secret: &[u8], nonce_a: &Nonce, nonce_b: &Nonce) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(nonce_a);
    hasher.update(nonce_b);
    let digest = hasher.finalize();
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&digest[..SESSION_KEY_LEN]);
    SessionKey(key)
}

/// AES-128-CTR with a full 128-bit big-endian counter starting at `iv`.
/// Encryption and decryption are the same operation.
pub fn aes128_ctr(key: &SessionKey, iv: &Iv, data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), iv.into());
    cipher.apply_keystream(&mut out);
    out
}

/// Fill `buf` from the OS RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::Random)
}

pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    fill_random(&mut out)?;
    Ok(out)
}

pub fn random_nonce() -> Result<Nonce, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

pub fn random_iv() -> Result<Iv, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;
    Ok(iv)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid peer public key")]
    InvalidPublicKey,
    #[error("random generator failure")]
    Random,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_uncompressed_sec1() {
        let kp = EphemeralKeypair::generate();
        assert_eq!(kp.public_key().len(), 65);
        assert_eq!(kp.public_key().as_bytes()[0], 0x04);
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let secret_a = a.shared_secret(b.public_key()).unwrap();
        let secret_b = b.shared_secret(a.public_key()).unwrap();
        assert_eq!(*secret_a, *secret_b);
        assert!(!secret_a.is_empty() && secret_a.len() <= 32);
        assert_ne!(secret_a[0], 0);
    }

    #[test]
    fn derived_key_matches_on_both_sides() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let nonce_i = random_nonce().unwrap();
        let nonce_r = random_nonce().unwrap();
        let ka = derive_session_key(&a.shared_secret(b.public_key()).unwrap(), &nonce_i, &nonce_r);
        let kb = derive_session_key(&b.shared_secret(a.public_key()).unwrap(), &nonce_i, &nonce_r);
        assert_eq!(ka, kb);
        assert!(!ka.is_zero());
    }

    #[test]
    fn nonce_order_matters() {
        let secret = [7u8; 32];
        let n1 = [1u8; NONCE_LEN];
        let n2 = [2u8; NONCE_LEN];
        assert_ne!(
            derive_session_key(&secret, &n1, &n2),
            derive_session_key(&secret, &n2, &n1)
        );
    }

    #[test]
    fn invalid_peer_key_rejected() {
        let kp = EphemeralKeypair::generate();
        let garbage = EncodedPublicKey::from_bytes(vec![0x04; 65]);
        assert!(matches!(
            kp.shared_secret(&garbage),
            Err(CryptoError::InvalidPublicKey)
        ));
        let empty = EncodedPublicKey::from_bytes(Vec::new());
        assert!(kp.shared_secret(&empty).is_err());
    }

    #[test]
    fn ctr_is_an_involution() {
        let key = SessionKey::from_bytes([9u8; SESSION_KEY_LEN]);
        let iv = random_iv().unwrap();
        let plain = b"hello over the air, longer than one block of sixteen bytes";
        let cipher = aes128_ctr(&key, &iv, plain);
        assert_eq!(cipher.len(), plain.len());
        assert_ne!(cipher.as_slice(), plain.as_slice());
        assert_eq!(aes128_ctr(&key, &iv, &cipher).as_slice(), plain.as_slice());
    }

    #[test]
    fn ctr_known_answer() {
        // NIST SP 800-38A F.5.1, first block.
        let key = SessionKey::from_bytes([
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ]);
        let iv: Iv = [
            0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd,
            0xfe, 0xff,
        ];
        let plain = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expected = [
            0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, 0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d,
            0xb6, 0xce,
        ];
        assert_eq!(aes128_ctr(&key, &iv, &plain), expected);
    }

    #[test]
    fn random_bytes_length() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(33).unwrap().len(), 33);
    }

    #[test]
    fn zero_key_detection() {
        assert!(SessionKey::from_bytes([0u8; SESSION_KEY_LEN]).is_zero());
        assert!(!SessionKey::from_bytes([1u8; SESSION_KEY_LEN]).is_zero());
    }
}
