//! Transport seam: the radio (or anything emulating it) that moves opaque packets.

use crate::protocol::MAX_PACKET_SIZE;

/// Half-duplex packet transport with no reliability, ordering or security.
pub trait Transport {
    /// Send one packet. Packets larger than [`MAX_PACKET_SIZE`] are refused.
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    fn has_data(&mut self) -> bool;

    /// One received packet, or `None` when nothing (or an empty read) is pending.
    fn receive(&mut self) -> Option<Vec<u8>>;
}

/// Reject packets the radio cannot carry. Implementations call this first in `send`.
pub fn check_packet_size(packet: &[u8]) -> Result<(), TransportError> {
    if packet.is_empty() {
        return Err(TransportError::Empty);
    }
    if packet.len() > MAX_PACKET_SIZE {
        return Err(TransportError::Oversize(packet.len()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("empty packet")]
    Empty,
    #[error("packet of {0} bytes exceeds the transport limit")]
    Oversize(usize),
    #[error("transport busy")]
    Busy,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}
