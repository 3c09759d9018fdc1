//! Message framing, ciphertext fragmentation, and inbound reassembly.

use std::collections::{HashMap, VecDeque};

use crate::crypto::Iv;
use crate::protocol::{DataFragment, MAX_FRAGMENTS, MAX_FRAGMENT_PAYLOAD};

/// Delivered (seq, total) pairs remembered at most.
const DELIVERED_MEMORY: usize = 32;

/// Plaintext framing: 2-byte big-endian length, then the payload.
pub fn frame_message(payload: &[u8]) -> Option<Vec<u8>> {
    let len = u16::try_from(payload.len()).ok()?;
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

/// Recover the payload from a decrypted frame. Bytes past the declared length are ignored.
pub fn unframe_message(plain: &[u8]) -> Option<&[u8]> {
    if plain.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
    plain.get(2..2 + len)
}

/// Number of fragments a ciphertext of `len` bytes needs. At least one.
pub fn fragment_count(len: usize) -> usize {
    len.div_ceil(MAX_FRAGMENT_PAYLOAD).max(1)
}

/// Split a ciphertext into fragment-sized slices.
pub fn split_ciphertext(ciphertext: &[u8]) -> Vec<&[u8]> {
    if ciphertext.is_empty() {
        return vec![ciphertext];
    }
    ciphertext.chunks(MAX_FRAGMENT_PAYLOAD).collect()
}

/// Reassembly state for one multi-fragment message.
#[derive(Debug)]
struct FragmentBuffer {
    iv: Option<Iv>,
    slots: Vec<Option<Vec<u8>>>,
    first_seen: u64,
    last_progress: u64,
}

impl FragmentBuffer {
    fn new(total: u16, now: u64) -> Self {
        Self {
            iv: None,
            slots: vec![None; total as usize],
            first_seen: now,
            last_progress: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.iv.is_some() && self.slots.iter().all(Option::is_some)
    }

    fn concat(&self) -> Vec<u8> {
        self.slots.iter().flatten().flatten().copied().collect()
    }
}

/// What happened to an inbound fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// All fragments present: whole ciphertext and its IV.
    Complete { ciphertext: Vec<u8>, iv: Iv },
    Pending,
    /// Slot already holds this exact fragment.
    Duplicate,
    /// Slot already holds different bytes; the stored fragment wins.
    Conflict,
    /// Fragment 0 with an IV different from the one already captured.
    IvMismatch,
    /// The message was delivered recently.
    AlreadyDelivered,
    /// A single-fragment message arrived without its IV.
    MissingIv,
    /// Index past the declared count, or a count no message can need.
    OutOfRange,
}

/// Inbound reassembly table keyed by (seq, total fragments).
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<(u32, u16), FragmentBuffer>,
    delivered: VecDeque<((u32, u16), u64)>,
    max_buffers: usize,
    timeout_ms: u64,
}

impl Reassembler {
    pub fn new(max_buffers: usize, timeout_ms: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            delivered: VecDeque::new(),
            max_buffers: max_buffers.max(1),
            timeout_ms,
        }
    }

    /// Feed an authenticated fragment.
    pub fn accept(&mut self, frag: &DataFragment, now: u64) -> Reassembly {
        let key = (frag.seq, frag.total_frags);
        if self.was_delivered(key) {
            return Reassembly::AlreadyDelivered;
        }

        if frag.total_frags == 0
            || frag.total_frags > MAX_FRAGMENTS
            || frag.frag_id >= frag.total_frags
        {
            return Reassembly::OutOfRange;
        }

        if frag.total_frags == 1 {
            let Some(iv) = frag.iv else {
                return Reassembly::MissingIv;
            };
            self.remember_delivered(key, now);
            return Reassembly::Complete {
                ciphertext: frag.ciphertext.clone(),
                iv,
            };
        }

        if !self.buffers.contains_key(&key) {
            self.make_room();
            self.buffers
                .insert(key, FragmentBuffer::new(frag.total_frags, now));
        }
        let Some(buf) = self.buffers.get_mut(&key) else {
            return Reassembly::Pending;
        };

        if let Some(iv) = frag.iv {
            match buf.iv {
                Some(existing) if existing != iv => return Reassembly::IvMismatch,
                Some(_) => {}
                None => buf.iv = Some(iv),
            }
        }

        let Some(slot) = buf.slots.get_mut(frag.frag_id as usize) else {
            return Reassembly::OutOfRange;
        };
        match slot.as_deref() {
            Some(existing) if existing == frag.ciphertext.as_slice() => {
                return Reassembly::Duplicate
            }
            Some(_) => return Reassembly::Conflict,
            None => {}
        }
        *slot = Some(frag.ciphertext.clone());
        buf.last_progress = now;

        if !buf.is_complete() {
            return Reassembly::Pending;
        }
        let Some(buf) = self.buffers.remove(&key) else {
            return Reassembly::Pending;
        };
        self.remember_delivered(key, now);
        match buf.iv {
            Some(iv) => Reassembly::Complete {
                ciphertext: buf.concat(),
                iv,
            },
            None => Reassembly::Pending,
        }
    }

    /// Drop buffers without progress for the timeout and expired delivery records.
    /// Returns the number of partial messages discarded.
    pub fn purge(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, b| now.saturating_sub(b.last_progress) <= timeout);
        while let Some(&(_, at)) = self.delivered.front() {
            if now.saturating_sub(at) > timeout {
                self.delivered.pop_front();
            } else {
                break;
            }
        }
        before - self.buffers.len()
    }

    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.delivered.clear();
    }

    fn was_delivered(&self, key: (u32, u16)) -> bool {
        self.delivered.iter().any(|(k, _)| *k == key)
    }

    fn remember_delivered(&mut self, key: (u32, u16), now: u64) {
        if self.delivered.len() >= DELIVERED_MEMORY {
            self.delivered.pop_front();
        }
        self.delivered.push_back((key, now));
    }

    /// Evict the oldest buffer when the table is full.
    fn make_room(&mut self) {
        if self.buffers.len() < self.max_buffers {
            return;
        }
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, b)| b.first_seen)
            .map(|(k, _)| *k);
        if let Some(k) = oldest {
            tracing::debug!(seq = k.0, "reassembly table full, evicting oldest message");
            self.buffers.remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(seq: u32, id: u16, total: u16, iv: Option<Iv>, body: &[u8]) -> DataFragment {
        DataFragment {
            seq,
            frag_id: id,
            total_frags: total,
            iv,
            ciphertext: body.to_vec(),
            tag: [0; 16],
        }
    }

    #[test]
    fn framing() {
        let framed = frame_message(b"hi").unwrap();
        assert_eq!(framed, vec![0, 2, b'h', b'i']);
        assert_eq!(unframe_message(&framed), Some(&b"hi"[..]));
        assert_eq!(unframe_message(&[0, 5, 1]), None);
        assert_eq!(unframe_message(&[0]), None);
        assert_eq!(unframe_message(&[0, 1, 7, 99]), Some(&[7u8][..]));
        assert!(frame_message(&vec![0u8; 70_000]).is_none());
    }

    #[test]
    fn fragment_counts() {
        assert_eq!(fragment_count(0), 1);
        assert_eq!(fragment_count(1), 1);
        assert_eq!(fragment_count(156), 1);
        assert_eq!(fragment_count(157), 2);
        assert_eq!(fragment_count(402), 3);
        let ct = vec![0u8; 402];
        let parts = split_ciphertext(&ct);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![156, 156, 90]
        );
    }

    #[test]
    fn reassembles_in_any_order() {
        let mut r = Reassembler::new(8, 15_000);
        let iv = [3u8; 16];
        assert_eq!(r.accept(&frag(1, 2, 3, None, b"cc"), 0), Reassembly::Pending);
        assert_eq!(r.accept(&frag(1, 0, 3, Some(iv), b"aa"), 1), Reassembly::Pending);
        assert_eq!(
            r.accept(&frag(1, 1, 3, None, b"bb"), 2),
            Reassembly::Complete {
                ciphertext: b"aabbcc".to_vec(),
                iv
            }
        );
        assert_eq!(r.in_progress(), 0);
    }

    #[test]
    fn completion_waits_for_iv() {
        let mut r = Reassembler::new(8, 15_000);
        assert_eq!(r.accept(&frag(4, 1, 2, None, b"b"), 0), Reassembly::Pending);
        assert_eq!(r.in_progress(), 1);
        assert!(matches!(
            r.accept(&frag(4, 0, 2, Some([1; 16]), b"a"), 0),
            Reassembly::Complete { .. }
        ));
    }

    #[test]
    fn duplicates_and_conflicts_keep_first_content() {
        let mut r = Reassembler::new(8, 15_000);
        let iv = [1u8; 16];
        r.accept(&frag(2, 0, 2, Some(iv), b"xx"), 0);
        assert_eq!(r.accept(&frag(2, 0, 2, Some(iv), b"xx"), 1), Reassembly::Duplicate);
        assert_eq!(r.accept(&frag(2, 0, 2, Some(iv), b"yy"), 1), Reassembly::Conflict);
        assert_eq!(
            r.accept(&frag(2, 0, 2, Some([9; 16]), b"xx"), 1),
            Reassembly::IvMismatch
        );
        match r.accept(&frag(2, 1, 2, None, b"zz"), 2) {
            Reassembly::Complete { ciphertext, iv: got } => {
                assert_eq!(ciphertext, b"xxzz");
                assert_eq!(got, iv);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn completed_message_not_redelivered() {
        let mut r = Reassembler::new(8, 15_000);
        let iv = [1u8; 16];
        r.accept(&frag(5, 0, 2, Some(iv), b"a"), 0);
        assert!(matches!(
            r.accept(&frag(5, 1, 2, None, b"b"), 0),
            Reassembly::Complete { .. }
        ));
        assert_eq!(r.accept(&frag(5, 1, 2, None, b"b"), 10), Reassembly::AlreadyDelivered);

        assert!(matches!(
            r.accept(&frag(6, 0, 1, Some(iv), b"s"), 0),
            Reassembly::Complete { .. }
        ));
        assert_eq!(r.accept(&frag(6, 0, 1, Some(iv), b"s"), 5), Reassembly::AlreadyDelivered);

        r.purge(20_000);
        assert!(matches!(
            r.accept(&frag(6, 0, 1, Some(iv), b"s"), 20_000),
            Reassembly::Complete { .. }
        ));
    }

    #[test]
    fn stale_buffers_purged() {
        let mut r = Reassembler::new(8, 15_000);
        r.accept(&frag(7, 0, 3, Some([0; 16]), b"a"), 0);
        r.accept(&frag(7, 1, 3, None, b"b"), 10_000);
        assert_eq!(r.purge(20_000), 0);
        assert_eq!(r.purge(25_001), 1);
        assert_eq!(r.in_progress(), 0);
        // The late fragment starts a fresh buffer; earlier data is gone.
        assert_eq!(r.accept(&frag(7, 2, 3, None, b"c"), 25_002), Reassembly::Pending);
        assert_eq!(r.in_progress(), 1);
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mut r = Reassembler::new(2, 15_000);
        r.accept(&frag(1, 0, 2, Some([0; 16]), b"a"), 0);
        r.accept(&frag(2, 0, 2, Some([0; 16]), b"a"), 1);
        r.accept(&frag(3, 0, 2, Some([0; 16]), b"a"), 2);
        assert_eq!(r.in_progress(), 2);
        // seq 1 was evicted; its second fragment starts over.
        assert_eq!(r.accept(&frag(1, 1, 2, None, b"b"), 3), Reassembly::Pending);
    }

    #[test]
    fn oversized_fragment_count_never_buffered() {
        let mut r = Reassembler::new(8, 15_000);
        assert_eq!(
            r.accept(&frag(1, 0, u16::MAX, Some([0; 16]), b"a"), 0),
            Reassembly::OutOfRange
        );
        assert_eq!(
            r.accept(&frag(1, 3, 2, None, b"a"), 0),
            Reassembly::OutOfRange
        );
        assert_eq!(r.in_progress(), 0);
        assert_eq!(
            r.accept(&frag(2, 0, MAX_FRAGMENTS, Some([0; 16]), b"a"), 0),
            Reassembly::Pending
        );
        assert_eq!(r.in_progress(), 1);
    }

    #[test]
    fn single_fragment_requires_iv() {
        let mut r = Reassembler::new(8, 15_000);
        assert_eq!(r.accept(&frag(1, 0, 1, None, b"a"), 0), Reassembly::MissingIv);
    }
}
