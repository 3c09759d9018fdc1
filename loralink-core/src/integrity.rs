//! Integrity: keyed tag over packet bytes, verify on receive.
//!
//! The tag is SHA-256(key || message) truncated to 16 bytes. This is not HMAC;
//! it is kept bit-for-bit compatible with deployed peers.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::SessionKey;

pub const TAG_LEN: usize = 16;

pub type Tag = [u8; TAG_LEN];

/// Keyed tag: first 16 bytes of SHA-256(key || message).
pub fn keyed_tag(key: &SessionKey, message: &[u8]) -> Tag {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(message);
    let digest = hasher.finalize();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

/// Verify `tag` against `message`. Constant-time in the tag contents.
pub fn verify_tag(key: &SessionKey, message: &[u8], tag: &Tag) -> bool {
    let expected = keyed_tag(key, message);
    expected[..].ct_eq(&tag[..]).into()
}

/// Append the keyed tag of `packet` to itself.
pub fn seal(key: &SessionKey, mut packet: Vec<u8>) -> Vec<u8> {
    let tag = keyed_tag(key, &packet);
    packet.extend_from_slice(&tag);
    packet
}
