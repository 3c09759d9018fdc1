//! Wire codec: locate the packet inside a raw transport read, then decode by type byte.

use crate::crypto::{EncodedPublicKey, IV_LEN, NONCE_LEN};
use crate::identity::DeviceId;
use crate::integrity::TAG_LEN;
use crate::protocol::{
    Ack, Beacon, BindConfirm, BindRequest, BindResponse, DataFragment, Heartbeat, Packet,
    PacketType, MAX_FRAGMENTS,
};

/// How many leading bytes may be transport noise before the type byte.
pub const TYPE_SCAN_WINDOW: usize = 5;

const ID_LEN: usize = 4;
const BIND_FIXED_LEN: usize = 1 + ID_LEN + ID_LEN + NONCE_LEN + 1;
const DATA_HEADER_LEN: usize = 1 + 4 + 2 + 2;
const ACK_LEN: usize = 1 + 4 + 2 + TAG_LEN;
const BEACON_LEN: usize = 1 + ID_LEN;
const HEARTBEAT_LEN: usize = 1 + ID_LEN + TAG_LEN;
const CONFIRM_LEN: usize = 1 + TAG_LEN;

/// Find the first known type byte within the scan window and return the buffer from there.
pub fn locate_packet(buf: &[u8]) -> Option<&[u8]> {
    buf.iter()
        .take(TYPE_SCAN_WINDOW)
        .position(|&b| PacketType::from_byte(b).is_some())
        .map(|offset| &buf[offset..])
}

/// Decode a packet whose first byte is the type byte. Trailing bytes after a
/// fixed-size packet are ignored; DATA uses the last 16 bytes as its tag.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::Empty)?;
    let ptype = PacketType::from_byte(first).ok_or(DecodeError::UnknownType(first))?;
    let need = |min: usize| -> Result<(), DecodeError> {
        if bytes.len() < min {
            Err(DecodeError::Truncated {
                packet: ptype,
                len: bytes.len(),
            })
        } else {
            Ok(())
        }
    };
    match ptype {
        PacketType::BindRequest => {
            need(BIND_FIXED_LEN)?;
            let pub_len = bytes[BIND_FIXED_LEN - 1] as usize;
            need(BIND_FIXED_LEN + pub_len)?;
            Ok(Packet::BindRequest(BindRequest {
                target: read_id(bytes, 1),
                initiator: read_id(bytes, 5),
                nonce: read_array(bytes, 9),
                public_key: EncodedPublicKey::from_bytes(
                    bytes[BIND_FIXED_LEN..BIND_FIXED_LEN + pub_len].to_vec(),
                ),
            }))
        }
        PacketType::BindResponse => {
            need(BIND_FIXED_LEN + TAG_LEN)?;
            let pub_len = bytes[BIND_FIXED_LEN - 1] as usize;
            need(BIND_FIXED_LEN + pub_len + TAG_LEN)?;
            let pub_end = BIND_FIXED_LEN + pub_len;
            Ok(Packet::BindResponse(BindResponse {
                initiator: read_id(bytes, 1),
                responder: read_id(bytes, 5),
                nonce: read_array(bytes, 9),
                public_key: EncodedPublicKey::from_bytes(bytes[BIND_FIXED_LEN..pub_end].to_vec()),
                tag: read_array(bytes, pub_end),
            }))
        }
        PacketType::BindConfirm => {
            need(CONFIRM_LEN)?;
            Ok(Packet::BindConfirm(BindConfirm {
                tag: read_array(bytes, 1),
            }))
        }
        PacketType::Data => {
            need(DATA_HEADER_LEN + TAG_LEN)?;
            let seq = u32::from_be_bytes(read_array(bytes, 1));
            let frag_id = u16::from_be_bytes(read_array(bytes, 5));
            let total_frags = u16::from_be_bytes(read_array(bytes, 7));
            if total_frags == 0 {
                return Err(DecodeError::Inconsistent("zero fragment count"));
            }
            if total_frags > MAX_FRAGMENTS {
                return Err(DecodeError::Inconsistent("fragment count exceeds largest message"));
            }
            if frag_id >= total_frags {
                return Err(DecodeError::Inconsistent("fragment index out of range"));
            }
            let tag_at = bytes.len() - TAG_LEN;
            let (iv, body_start) = if frag_id == 0 {
                need(DATA_HEADER_LEN + IV_LEN + TAG_LEN)?;
                (Some(read_array(bytes, DATA_HEADER_LEN)), DATA_HEADER_LEN + IV_LEN)
            } else {
                (None, DATA_HEADER_LEN)
            };
            Ok(Packet::Data(DataFragment {
                seq,
                frag_id,
                total_frags,
                iv,
                ciphertext: bytes[body_start..tag_at].to_vec(),
                tag: read_array(bytes, tag_at),
            }))
        }
        PacketType::Ack => {
            need(ACK_LEN)?;
            Ok(Packet::Ack(Ack {
                seq: u32::from_be_bytes(read_array(bytes, 1)),
                frag_id: u16::from_be_bytes(read_array(bytes, 5)),
                tag: read_array(bytes, 7),
            }))
        }
        PacketType::Beacon => {
            need(BEACON_LEN)?;
            Ok(Packet::Beacon(Beacon {
                device_id: read_id(bytes, 1),
            }))
        }
        PacketType::Heartbeat => {
            need(HEARTBEAT_LEN)?;
            Ok(Packet::Heartbeat(Heartbeat {
                device_id: read_id(bytes, 1),
                tag: read_array(bytes, 5),
            }))
        }
    }
}

/// Encode a packet into its exact wire bytes.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let out = match packet {
        Packet::BindRequest(p) => {
            let pub_len = public_key_len(&p.public_key)?;
            let mut out = Vec::with_capacity(BIND_FIXED_LEN + p.public_key.len());
            out.push(PacketType::BindRequest.as_byte());
            out.extend_from_slice(&p.target.to_be_bytes());
            out.extend_from_slice(&p.initiator.to_be_bytes());
            out.extend_from_slice(&p.nonce);
            out.push(pub_len);
            out.extend_from_slice(p.public_key.as_bytes());
            out
        }
        Packet::BindResponse(p) => {
            let pub_len = public_key_len(&p.public_key)?;
            let mut out = Vec::with_capacity(BIND_FIXED_LEN + p.public_key.len() + TAG_LEN);
            out.push(PacketType::BindResponse.as_byte());
            out.extend_from_slice(&p.initiator.to_be_bytes());
            out.extend_from_slice(&p.responder.to_be_bytes());
            out.extend_from_slice(&p.nonce);
            out.push(pub_len);
            out.extend_from_slice(p.public_key.as_bytes());
            out.extend_from_slice(&p.tag);
            out
        }
        Packet::BindConfirm(p) => {
            let mut out = Vec::with_capacity(CONFIRM_LEN);
            out.push(PacketType::BindConfirm.as_byte());
            out.extend_from_slice(&p.tag);
            out
        }
        Packet::Data(p) => {
            if p.iv.is_some() != (p.frag_id == 0) {
                return Err(EncodeError::IvPlacement);
            }
            let mut out = p.signed_bytes();
            out.extend_from_slice(&p.tag);
            out
        }
        Packet::Ack(p) => {
            let mut out = p.signed_bytes();
            out.extend_from_slice(&p.tag);
            out
        }
        Packet::Beacon(p) => {
            let mut out = Vec::with_capacity(BEACON_LEN);
            out.push(PacketType::Beacon.as_byte());
            out.extend_from_slice(&p.device_id.to_be_bytes());
            out
        }
        Packet::Heartbeat(p) => {
            let mut out = p.signed_bytes();
            out.extend_from_slice(&p.tag);
            out
        }
    };
    Ok(out)
}

impl DataFragment {
    /// Every byte the tag covers: header, IV (fragment 0 only), ciphertext.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let iv_len = if self.iv.is_some() { IV_LEN } else { 0 };
        let mut out = Vec::with_capacity(DATA_HEADER_LEN + iv_len + self.ciphertext.len() + TAG_LEN);
        out.push(PacketType::Data.as_byte());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.frag_id.to_be_bytes());
        out.extend_from_slice(&self.total_frags.to_be_bytes());
        if let Some(iv) = &self.iv {
            out.extend_from_slice(iv);
        }
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

impl Ack {
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACK_LEN);
        out.push(PacketType::Ack.as_byte());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.frag_id.to_be_bytes());
        out
    }
}

impl Heartbeat {
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEARTBEAT_LEN);
        out.push(PacketType::Heartbeat.as_byte());
        out.extend_from_slice(&self.device_id.to_be_bytes());
        out
    }
}

fn public_key_len(key: &EncodedPublicKey) -> Result<u8, EncodeError> {
    u8::try_from(key.len()).map_err(|_| EncodeError::PublicKeyTooLong(key.len()))
}

fn read_id(bytes: &[u8], at: usize) -> DeviceId {
    DeviceId::from_be_bytes(read_array(bytes, at))
}

/// Caller has already checked the length.
fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// Error decoding a packet (empty, unknown type, short, or inconsistent fields).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty buffer")]
    Empty,
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),
    #[error("{packet:?} packet truncated ({len} bytes)")]
    Truncated { packet: PacketType, len: usize },
    #[error("inconsistent packet: {0}")]
    Inconsistent(&'static str),
}

/// Error encoding a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("public key too long ({0} bytes)")]
    PublicKeyTooLong(usize),
    #[error("IV must be present exactly on fragment 0")]
    IvPlacement,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    fn key() -> SessionKey {
        SessionKey::from_bytes([0x11; 16])
    }

    fn sample_request() -> BindRequest {
        BindRequest {
            target: DeviceId::new(0x3333_4444),
            initiator: DeviceId::new(0x1111_2222),
            nonce: [0xAB; 16],
            public_key: EncodedPublicKey::from_bytes(vec![0x04; 65]),
        }
    }

    #[test]
    fn bind_request_layout() {
        let bytes = encode_packet(&Packet::BindRequest(sample_request())).unwrap();
        assert_eq!(bytes.len(), 1 + 4 + 4 + 16 + 1 + 65);
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[1..5], &[0x33, 0x33, 0x44, 0x44]);
        assert_eq!(&bytes[5..9], &[0x11, 0x11, 0x22, 0x22]);
        assert_eq!(bytes[25], 65);
        assert_eq!(
            decode_packet(&bytes).unwrap(),
            Packet::BindRequest(sample_request())
        );
    }

    #[test]
    fn bind_response_tag_position() {
        let resp = BindResponse {
            initiator: DeviceId::new(1),
            responder: DeviceId::new(2),
            nonce: [0x01; 16],
            public_key: EncodedPublicKey::from_bytes(vec![0x04; 65]),
            tag: [0xEE; 16],
        };
        let bytes = encode_packet(&Packet::BindResponse(resp.clone())).unwrap();
        assert_eq!(bytes.len(), 26 + 65 + 16);
        assert_eq!(&bytes[bytes.len() - 16..], &[0xEE; 16]);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::BindResponse(resp));
    }

    #[test]
    fn bind_request_declared_key_longer_than_buffer() {
        let mut bytes = encode_packet(&Packet::BindRequest(sample_request())).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::Truncated {
                packet: PacketType::BindRequest,
                ..
            })
        ));
    }

    #[test]
    fn data_fragment_zero_carries_iv() {
        let frag = DataFragment::sealed(&key(), 0x0102_0304, 0, 3, Some([0x55; 16]), vec![1; 156]);
        let bytes = encode_packet(&Packet::Data(frag.clone())).unwrap();
        assert_eq!(bytes.len(), 9 + 16 + 156 + 16);
        assert!(bytes.len() <= crate::protocol::MAX_PACKET_SIZE);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[9..25], &[0x55; 16]);
        match decode_packet(&bytes).unwrap() {
            Packet::Data(d) => {
                assert_eq!(d, frag);
                assert!(d.verify(&key()));
            }
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn data_fragment_later_has_no_iv() {
        let frag = DataFragment::sealed(&key(), 9, 2, 3, None, vec![7; 88]);
        let bytes = encode_packet(&Packet::Data(frag.clone())).unwrap();
        assert_eq!(bytes.len(), 9 + 88 + 16);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::Data(frag));
    }

    #[test]
    fn data_iv_placement_enforced_on_encode() {
        let mut frag = DataFragment::sealed(&key(), 9, 1, 3, None, vec![7; 8]);
        frag.iv = Some([0; 16]);
        assert_eq!(
            encode_packet(&Packet::Data(frag)),
            Err(EncodeError::IvPlacement)
        );
    }

    #[test]
    fn data_inconsistent_counts_rejected() {
        let mut bytes = vec![0x10, 0, 0, 0, 1, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            decode_packet(&bytes),
            Err(DecodeError::Inconsistent("zero fragment count"))
        );
        let mut bytes = vec![0x10, 0, 0, 0, 1, 0, 2, 0, 2];
        bytes.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            decode_packet(&bytes),
            Err(DecodeError::Inconsistent("fragment index out of range"))
        );
    }

    #[test]
    fn data_fragment_count_capped() {
        let header = |total: u16| {
            let mut bytes = vec![0x10, 0, 0, 0, 1, 0, 1];
            bytes.extend_from_slice(&total.to_be_bytes());
            bytes.extend_from_slice(&[0u8; 32]);
            bytes
        };
        assert!(matches!(
            decode_packet(&header(MAX_FRAGMENTS)),
            Ok(Packet::Data(_))
        ));
        assert_eq!(
            decode_packet(&header(MAX_FRAGMENTS + 1)),
            Err(DecodeError::Inconsistent("fragment count exceeds largest message"))
        );
        assert_eq!(
            decode_packet(&header(u16::MAX)),
            Err(DecodeError::Inconsistent("fragment count exceeds largest message"))
        );
    }

    #[test]
    fn data_fragment_zero_without_room_for_iv() {
        let mut bytes = vec![0x10, 0, 0, 0, 1, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0u8; 20]);
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn fixed_size_packets() {
        let ack = Ack::sealed(&key(), 5, 1);
        let bytes = encode_packet(&Packet::Ack(ack)).unwrap();
        assert_eq!(bytes.len(), 23);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::Ack(ack));

        let beacon = Beacon {
            device_id: DeviceId::new(0xCAFE_BABE),
        };
        let bytes = encode_packet(&Packet::Beacon(beacon)).unwrap();
        assert_eq!(bytes, vec![0x30, 0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::Beacon(beacon));

        let hb = Heartbeat::sealed(&key(), DeviceId::new(3));
        let bytes = encode_packet(&Packet::Heartbeat(hb)).unwrap();
        assert_eq!(bytes.len(), 21);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::Heartbeat(hb));

        let conf = BindConfirm { tag: [0x42; 16] };
        let bytes = encode_packet(&Packet::BindConfirm(conf.clone())).unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(decode_packet(&bytes).unwrap(), Packet::BindConfirm(conf));
    }

    #[test]
    fn short_packets_rejected() {
        assert_eq!(decode_packet(&[]), Err(DecodeError::Empty));
        assert!(matches!(
            decode_packet(&[0x30, 1, 2]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode_packet(&[0x11, 0, 0, 0, 0, 0, 0]),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(decode_packet(&[0x99]), Err(DecodeError::UnknownType(0x99)));
    }

    #[test]
    fn locate_skips_leading_noise() {
        let beacon = [0x30, 0, 0, 0, 7];
        assert_eq!(locate_packet(&beacon), Some(&beacon[..]));

        let mut noisy = vec![0x00, 0xFF, 0x7E, 0x01];
        noisy.extend_from_slice(&beacon);
        assert_eq!(locate_packet(&noisy), Some(&beacon[..]));
    }

    #[test]
    fn locate_gives_up_after_window() {
        let mut noisy = vec![0x00; TYPE_SCAN_WINDOW];
        noisy.extend_from_slice(&[0x30, 0, 0, 0, 7]);
        assert_eq!(locate_packet(&noisy), None);
        assert_eq!(locate_packet(&[]), None);
    }
}
