//! LoRaLink protocol reference implementation: pairing, reliable delivery, liveness
//! and discovery over a small-packet, half-duplex radio link.
//! Host-driven: no I/O of its own; the host feeds packets and a millisecond clock
//! and performs the returned actions (or hands a `Transport` to `LinkCore::run_once`).

pub mod config;
pub mod core;
pub mod crypto;
pub mod discovery;
pub mod fragment;
pub mod identity;
pub mod integrity;
pub mod keystore;
pub mod liveness;
pub mod messenger;
pub mod pairing;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use crate::config::ProtocolConfig;
pub use crate::core::{perform, Action, Event, LinkCore, Status};
pub use crate::crypto::{CryptoError, SessionKey};
pub use crate::discovery::DiscoveredPeer;
pub use crate::identity::DeviceId;
pub use crate::keystore::{FileKeyStore, KeyStore, KeyStoreError, MemoryKeyStore, StoredPairing};
pub use crate::messenger::SendError;
pub use crate::pairing::{PairingError, PairingState};
pub use crate::protocol::{Packet, PacketType, MAX_PACKET_SIZE};
pub use crate::transport::{Transport, TransportError};
pub use crate::wire::{decode_packet, encode_packet, locate_packet, DecodeError, EncodeError};
