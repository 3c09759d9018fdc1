//! Reliable messenger: encrypt, fragment, pace, retransmit, acknowledge, reassemble.

use rand::Rng;

use crate::config::ProtocolConfig;
use crate::core::{Action, Event};
use crate::crypto::{self, CryptoError, SessionKey};
use crate::fragment::{self, Reassembler, Reassembly};
use crate::protocol::{Ack, DataFragment, Packet};
use crate::scheduler::ReleaseScheduler;
use crate::wire::{self, EncodeError};

#[derive(Debug)]
struct PendingPacket {
    frag_id: u16,
    bytes: Vec<u8>,
    /// `None` while waiting in the release queue, first send or resend.
    last_sent: Option<u64>,
    retries: u8,
    acked: bool,
}

#[derive(Debug)]
struct PendingMessage {
    seq: u32,
    packets: Vec<PendingPacket>,
}

impl PendingMessage {
    fn fully_acked(&self) -> bool {
        self.packets.iter().all(|p| p.acked)
    }
}

pub struct Messenger {
    next_seq: u32,
    pending: Vec<PendingMessage>,
    scheduler: ReleaseScheduler,
    reassembler: Reassembler,
    ack_timeout_ms: u64,
    max_retries: u8,
    max_pending: usize,
}

impl Messenger {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            next_seq: rand::thread_rng().gen(),
            pending: Vec::new(),
            scheduler: ReleaseScheduler::new(config.ack_fast_window_ms, config.inter_fragment_gap_ms),
            reassembler: Reassembler::new(config.max_reassembly_buffers, config.fragment_timeout_ms),
            ack_timeout_ms: config.ack_timeout_ms,
            max_retries: config.max_retries,
            max_pending: config.max_pending_messages,
        }
    }

    /// Encrypt and fragment `payload`, queueing every fragment for release.
    /// Returns the message sequence number.
    pub fn send(&mut self, key: &SessionKey, payload: &[u8]) -> Result<u32, SendError> {
        if self.pending.len() >= self.max_pending {
            return Err(SendError::Busy);
        }
        let framed = fragment::frame_message(payload).ok_or(SendError::TooLarge(payload.len()))?;
        let iv = crypto::random_iv()?;
        let ciphertext = crypto::aes128_ctr(key, &iv, &framed);
        let total = u16::try_from(fragment::fragment_count(ciphertext.len()))
            .map_err(|_| SendError::TooLarge(payload.len()))?;
        let parts = fragment::split_ciphertext(&ciphertext);

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut packets = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let frag_id = i as u16;
            let frag = DataFragment::sealed(
                key,
                seq,
                frag_id,
                total,
                (frag_id == 0).then_some(iv),
                part.to_vec(),
            );
            packets.push(PendingPacket {
                frag_id,
                bytes: wire::encode_packet(&Packet::Data(frag))?,
                last_sent: None,
                retries: 0,
                acked: false,
            });
            self.scheduler.enqueue(seq, frag_id);
        }
        tracing::debug!(seq, fragments = total, len = payload.len(), "message queued");
        self.pending.push(PendingMessage { seq, packets });
        Ok(seq)
    }

    /// Release the next fragment if the pacing gate allows it.
    pub fn release_due(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(f) = self.scheduler.next_due(now) {
            let packet = self
                .pending
                .iter_mut()
                .find(|m| m.seq == f.seq)
                .and_then(|m| m.packets.iter_mut().find(|p| p.frag_id == f.frag_id));
            if let Some(p) = packet {
                p.last_sent = Some(now);
                tracing::debug!(seq = f.seq, frag = f.frag_id, "fragment sent");
                actions.push(Action::Transmit(p.bytes.clone()));
                break;
            }
        }
        actions
    }

    /// Handle an inbound DATA fragment. Nothing is sent back unless the tag verifies.
    pub fn on_data(&mut self, key: &SessionKey, frag: DataFragment, now: u64) -> Vec<Action> {
        if !frag.verify(key) {
            tracing::warn!(seq = frag.seq, frag = frag.frag_id, "DATA tag mismatch, dropped");
            return Vec::new();
        }
        let mut actions = Vec::new();
        match wire::encode_packet(&Packet::Ack(Ack::sealed(key, frag.seq, frag.frag_id))) {
            Ok(bytes) => actions.push(Action::Transmit(bytes)),
            Err(e) => tracing::warn!("failed to encode ACK: {}", e),
        }

        match self.reassembler.accept(&frag, now) {
            Reassembly::Complete { ciphertext, iv } => {
                let plain = crypto::aes128_ctr(key, &iv, &ciphertext);
                match fragment::unframe_message(&plain) {
                    Some(payload) => {
                        tracing::info!(seq = frag.seq, len = payload.len(), "message received");
                        actions.push(Action::Notify(Event::MessageReceived {
                            seq: frag.seq,
                            payload: payload.to_vec(),
                        }));
                    }
                    None => tracing::warn!(seq = frag.seq, "decrypted frame has invalid length"),
                }
            }
            Reassembly::Pending => {
                tracing::debug!(seq = frag.seq, frag = frag.frag_id, total = frag.total_frags, "fragment stored");
            }
            other => {
                tracing::debug!(seq = frag.seq, frag = frag.frag_id, "fragment not stored: {:?}", other);
            }
        }
        actions
    }

    /// Handle an inbound ACK. Raises `MessageDelivered` once every fragment is acknowledged.
    pub fn on_ack(&mut self, key: &SessionKey, ack: Ack, now: u64) -> Vec<Action> {
        if !ack.verify(key) {
            tracing::warn!(seq = ack.seq, frag = ack.frag_id, "ACK tag mismatch, dropped");
            return Vec::new();
        }
        self.scheduler.on_ack(ack.seq, ack.frag_id, now);
        let Some(idx) = self.pending.iter().position(|m| m.seq == ack.seq) else {
            tracing::debug!(seq = ack.seq, "ACK for unknown message");
            return Vec::new();
        };
        let msg = &mut self.pending[idx];
        match msg.packets.iter_mut().find(|p| p.frag_id == ack.frag_id) {
            Some(p) if !p.acked => {
                p.acked = true;
                self.scheduler.withdraw(ack.seq, ack.frag_id);
            }
            _ => {
                tracing::debug!(seq = ack.seq, frag = ack.frag_id, "duplicate ACK");
                return Vec::new();
            }
        }
        if !msg.fully_acked() {
            return Vec::new();
        }
        self.pending.remove(idx);
        tracing::info!(seq = ack.seq, "message delivered");
        vec![Action::Notify(Event::MessageDelivered { seq: ack.seq })]
    }

    /// Queue fragments unacknowledged past the retry timeout for resending through the
    /// release gate; abandon messages whose retries are exhausted.
    pub fn sweep_retries(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut failed = Vec::new();
        for msg in &mut self.pending {
            for p in msg.packets.iter_mut().filter(|p| !p.acked) {
                let Some(sent) = p.last_sent else { continue };
                if now.saturating_sub(sent) < self.ack_timeout_ms {
                    continue;
                }
                if p.retries >= self.max_retries {
                    failed.push(msg.seq);
                    break;
                }
                p.retries += 1;
                p.last_sent = None;
                self.scheduler.requeue(msg.seq, p.frag_id);
                tracing::info!(seq = msg.seq, frag = p.frag_id, retry = p.retries, "retransmitting fragment");
            }
        }
        for seq in failed {
            self.pending.retain(|m| m.seq != seq);
            self.scheduler.cancel(seq);
            tracing::warn!(seq, "delivery failed, retries exhausted");
            actions.push(Action::Notify(Event::DeliveryFailed { seq }));
        }
        actions
    }

    /// Purge stale reassembly buffers.
    pub fn purge(&mut self, now: u64) {
        let dropped = self.reassembler.purge(now);
        if dropped > 0 {
            tracing::debug!(dropped, "incomplete messages timed out");
        }
    }

    /// True while fragments of an outbound message are still being paced out.
    pub fn is_transmitting(&self, now: u64) -> bool {
        self.scheduler.is_transmitting(now)
    }

    /// Sequence numbers of messages not yet fully acknowledged.
    pub fn pending_messages(&self) -> Vec<u32> {
        self.pending.iter().map(|m| m.seq).collect()
    }

    /// Drop all outbound and inbound message state.
    /// Drop all session state. Returns the sequence numbers of outbound messages
    /// abandoned unacknowledged.
    pub fn reset(&mut self) -> Vec<u32> {
        let abandoned: Vec<u32> = self.pending.drain(..).map(|m| m.seq).collect();
        self.scheduler.clear();
        self.reassembler.clear();
        abandoned
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not paired")]
    NotPaired,
    #[error("message of {0} bytes is too large")]
    TooLarge(usize),
    #[error("too many messages awaiting acknowledgement")]
    Busy,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
