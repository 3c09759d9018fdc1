//! LoRaLink wire protocol: packet types and per-packet structures.
//!
//! Byte layouts live in the wire module. Multi-byte fields are big-endian.

use crate::crypto::{EncodedPublicKey, Iv, Nonce, SessionKey};
use crate::identity::DeviceId;
use crate::integrity::{self, Tag};

/// Largest packet the radio transport accepts.
pub const MAX_PACKET_SIZE: usize = 200;

/// Largest ciphertext slice carried by one DATA fragment.
pub const MAX_FRAGMENT_PAYLOAD: usize = 156;

/// Fragments needed by the largest framed message (2-byte length + 65535 bytes).
pub const MAX_FRAGMENTS: u16 = (2 + u16::MAX as usize).div_ceil(MAX_FRAGMENT_PAYLOAD) as u16;

/// Packet type byte. First byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x10,
    Ack = 0x11,
    BindRequest = 0x20,
    BindResponse = 0x21,
    BindConfirm = 0x22,
    Beacon = 0x30,
    Heartbeat = 0x31,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x10 => Some(PacketType::Data),
            0x11 => Some(PacketType::Ack),
            0x20 => Some(PacketType::BindRequest),
            0x21 => Some(PacketType::BindResponse),
            0x22 => Some(PacketType::BindConfirm),
            0x30 => Some(PacketType::Beacon),
            0x31 => Some(PacketType::Heartbeat),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Handshake packets are processed whatever the pairing state.
    pub fn is_bind(self) -> bool {
        matches!(
            self,
            PacketType::BindRequest | PacketType::BindResponse | PacketType::BindConfirm
        )
    }
}

/// Initiator -> target: start a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub target: DeviceId,
    pub initiator: DeviceId,
    pub nonce: Nonce,
    pub public_key: EncodedPublicKey,
}

/// Responder -> initiator, sent after local accept. `tag` covers the "RESP" transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub initiator: DeviceId,
    pub responder: DeviceId,
    pub nonce: Nonce,
    pub public_key: EncodedPublicKey,
    pub tag: Tag,
}

/// Initiator -> responder. `tag` covers the "CONF" transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfirm {
    pub tag: Tag,
}

/// One encrypted fragment of an application message. Fragment 0 carries the IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    pub seq: u32,
    pub frag_id: u16,
    pub total_frags: u16,
    pub iv: Option<Iv>,
    pub ciphertext: Vec<u8>,
    pub tag: Tag,
}

impl DataFragment {
    /// Build a fragment and tag it under the session key.
    pub fn sealed(
        key: &SessionKey,
        seq: u32,
        frag_id: u16,
        total_frags: u16,
        iv: Option<Iv>,
        ciphertext: Vec<u8>,
    ) -> Self {
        let mut frag = DataFragment {
            seq,
            frag_id,
            total_frags,
            iv,
            ciphertext,
            tag: [0u8; integrity::TAG_LEN],
        };
        frag.tag = integrity::keyed_tag(key, &frag.signed_bytes());
        frag
    }

    pub fn verify(&self, key: &SessionKey) -> bool {
        integrity::verify_tag(key, &self.signed_bytes(), &self.tag)
    }
}

/// Acknowledges one DATA fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub seq: u32,
    pub frag_id: u16,
    pub tag: Tag,
}

impl Ack {
    pub fn sealed(key: &SessionKey, seq: u32, frag_id: u16) -> Self {
        let mut ack = Ack {
            seq,
            frag_id,
            tag: [0u8; integrity::TAG_LEN],
        };
        ack.tag = integrity::keyed_tag(key, &ack.signed_bytes());
        ack
    }

    pub fn verify(&self, key: &SessionKey) -> bool {
        integrity::verify_tag(key, &self.signed_bytes(), &self.tag)
    }
}

/// Unauthenticated presence announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub device_id: DeviceId,
}

/// Authenticated liveness signal between paired devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub device_id: DeviceId,
    pub tag: Tag,
}

impl Heartbeat {
    pub fn sealed(key: &SessionKey, device_id: DeviceId) -> Self {
        let mut hb = Heartbeat {
            device_id,
            tag: [0u8; integrity::TAG_LEN],
        };
        hb.tag = integrity::keyed_tag(key, &hb.signed_bytes());
        hb
    }

    pub fn verify(&self, key: &SessionKey) -> bool {
        integrity::verify_tag(key, &self.signed_bytes(), &self.tag)
    }
}

/// All wire packets. Decoded from the leading type byte (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    BindConfirm(BindConfirm),
    Data(DataFragment),
    Ack(Ack),
    Beacon(Beacon),
    Heartbeat(Heartbeat),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::BindRequest(_) => PacketType::BindRequest,
            Packet::BindResponse(_) => PacketType::BindResponse,
            Packet::BindConfirm(_) => PacketType::BindConfirm,
            Packet::Data(_) => PacketType::Data,
            Packet::Ack(_) => PacketType::Ack,
            Packet::Beacon(_) => PacketType::Beacon,
            Packet::Heartbeat(_) => PacketType::Heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bytes_match_wire_constants() {
        for (b, t) in [
            (0x10, PacketType::Data),
            (0x11, PacketType::Ack),
            (0x20, PacketType::BindRequest),
            (0x21, PacketType::BindResponse),
            (0x22, PacketType::BindConfirm),
            (0x30, PacketType::Beacon),
            (0x31, PacketType::Heartbeat),
        ] {
            assert_eq!(PacketType::from_byte(b), Some(t));
            assert_eq!(t.as_byte(), b);
        }
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0xFF), None);
    }

    #[test]
    fn largest_message_fragment_count() {
        assert_eq!(MAX_FRAGMENTS, 421);
    }

    #[test]
    fn bind_types_flagged() {
        assert!(PacketType::BindRequest.is_bind());
        assert!(PacketType::BindConfirm.is_bind());
        assert!(!PacketType::Data.is_bind());
        assert!(!PacketType::Beacon.is_bind());
    }

    #[test]
    fn sealed_fragment_verifies_and_rejects_field_changes() {
        let key = SessionKey::from_bytes([3u8; 16]);
        let frag = DataFragment::sealed(&key, 7, 0, 2, Some([1u8; 16]), vec![9u8; 20]);
        assert!(frag.verify(&key));

        let mut other = frag.clone();
        other.seq = 8;
        assert!(!other.verify(&key));

        let mut other = frag.clone();
        other.ciphertext[19] ^= 0x80;
        assert!(!other.verify(&key));

        let mut other = frag;
        other.iv = Some([2u8; 16]);
        assert!(!other.verify(&key));
    }

    #[test]
    fn sealed_ack_and_heartbeat_verify() {
        let key = SessionKey::from_bytes([4u8; 16]);
        let ack = Ack::sealed(&key, 1, 2);
        assert!(ack.verify(&key));
        assert!(!Ack { frag_id: 3, ..ack }.verify(&key));

        let hb = Heartbeat::sealed(&key, DeviceId::new(0x1111_2222));
        assert!(hb.verify(&key));
        assert!(!hb.verify(&SessionKey::from_bytes([5u8; 16])));
    }
}
