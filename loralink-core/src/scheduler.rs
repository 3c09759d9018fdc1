//! Outbound release scheduler: paces fragment transmissions without blocking.
//!
//! After a fragment goes out the gate stays closed until its ACK arrives or the
//! fast window runs out, then for the inter-fragment gap. Only one fragment is
//! released per opening. Retransmissions go through the same gate, ahead of
//! fragments never sent.

use std::collections::VecDeque;

/// One queued fragment, identified by message sequence and fragment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentRef {
    pub seq: u32,
    pub frag_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    AwaitingAck { fragment: FragmentRef, sent_at: u64 },
    Gap { until: u64 },
}

#[derive(Debug)]
pub struct ReleaseScheduler {
    queue: VecDeque<FragmentRef>,
    gate: Gate,
    fast_window_ms: u64,
    gap_ms: u64,
}

impl ReleaseScheduler {
    pub fn new(fast_window_ms: u64, gap_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            gate: Gate::Open,
            fast_window_ms,
            gap_ms,
        }
    }

    pub fn enqueue(&mut self, seq: u32, frag_id: u16) {
        self.queue.push_back(FragmentRef { seq, frag_id });
    }

    /// Queue a retransmission ahead of first transmissions.
    pub fn requeue(&mut self, seq: u32, frag_id: u16) {
        let fragment = FragmentRef { seq, frag_id };
        if !self.queue.contains(&fragment) {
            self.queue.push_front(fragment);
        }
    }

    /// Drop one queued fragment, e.g. acknowledged while waiting for a resend.
    pub fn withdraw(&mut self, seq: u32, frag_id: u16) {
        let fragment = FragmentRef { seq, frag_id };
        self.queue.retain(|f| *f != fragment);
    }

    /// Time at which the gate opens (0 when already open).
    fn opens_at(&self) -> u64 {
        match self.gate {
            Gate::Open => 0,
            Gate::AwaitingAck { sent_at, .. } => sent_at + self.fast_window_ms + self.gap_ms,
            Gate::Gap { until } => until,
        }
    }

    /// Fragment to transmit now, if the gate is open. Closes the gate behind it.
    pub fn next_due(&mut self, now: u64) -> Option<FragmentRef> {
        if now < self.opens_at() {
            return None;
        }
        self.gate = Gate::Open;
        let fragment = self.queue.pop_front()?;
        self.gate = Gate::AwaitingAck {
            fragment,
            sent_at: now,
        };
        Some(fragment)
    }

    /// An ACK for the fragment the gate is waiting on shortens the wait to the gap.
    pub fn on_ack(&mut self, seq: u32, frag_id: u16, now: u64) {
        if let Gate::AwaitingAck { fragment, .. } = self.gate {
            if fragment == (FragmentRef { seq, frag_id }) {
                self.gate = Gate::Gap {
                    until: now + self.gap_ms,
                };
            }
        }
    }

    /// Forget queued fragments of a message.
    pub fn cancel(&mut self, seq: u32) {
        self.queue.retain(|f| f.seq != seq);
    }

    /// True while fragments are queued or the gate is still closed.
    pub fn is_transmitting(&self, now: u64) -> bool {
        !self.queue.is_empty() || now < self.opens_at()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.gate = Gate::Open;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(seq: u32, frag_id: u16) -> FragmentRef {
        FragmentRef { seq, frag_id }
    }

    #[test]
    fn releases_one_at_a_time_after_window_and_gap() {
        let mut s = ReleaseScheduler::new(350, 40);
        s.enqueue(1, 0);
        s.enqueue(1, 1);
        assert_eq!(s.next_due(0), Some(f(1, 0)));
        assert_eq!(s.next_due(100), None);
        assert_eq!(s.next_due(389), None);
        assert_eq!(s.next_due(390), Some(f(1, 1)));
        assert_eq!(s.next_due(10_000), None);
    }

    #[test]
    fn ack_opens_gate_after_gap() {
        let mut s = ReleaseScheduler::new(350, 40);
        s.enqueue(1, 0);
        s.enqueue(1, 1);
        assert_eq!(s.next_due(0), Some(f(1, 0)));
        s.on_ack(1, 0, 50);
        assert_eq!(s.next_due(89), None);
        assert_eq!(s.next_due(90), Some(f(1, 1)));
    }

    #[test]
    fn unrelated_ack_ignored() {
        let mut s = ReleaseScheduler::new(350, 40);
        s.enqueue(1, 0);
        s.enqueue(1, 1);
        s.next_due(0);
        s.on_ack(9, 0, 10);
        assert_eq!(s.next_due(60), None);
    }

    #[test]
    fn transmitting_until_gate_reopens() {
        let mut s = ReleaseScheduler::new(350, 40);
        assert!(!s.is_transmitting(0));
        s.enqueue(3, 0);
        assert!(s.is_transmitting(0));
        s.next_due(0);
        assert!(s.is_transmitting(389));
        assert!(!s.is_transmitting(390));
    }

    #[test]
    fn retransmission_waits_for_gate_then_jumps_queue() {
        let mut s = ReleaseScheduler::new(350, 40);
        s.enqueue(1, 0);
        s.enqueue(1, 1);
        assert_eq!(s.next_due(0), Some(f(1, 0)));
        s.requeue(7, 2);
        s.requeue(7, 2);
        assert_eq!(s.queued(), 2);
        assert_eq!(s.next_due(100), None);
        assert_eq!(s.next_due(390), Some(f(7, 2)));
        assert_eq!(s.next_due(780), Some(f(1, 1)));
    }

    #[test]
    fn withdrawn_fragment_not_released() {
        let mut s = ReleaseScheduler::new(0, 0);
        s.requeue(4, 1);
        s.enqueue(5, 0);
        s.withdraw(4, 1);
        assert_eq!(s.next_due(0), Some(f(5, 0)));
        assert_eq!(s.next_due(1), None);
    }

    #[test]
    fn cancel_drops_queued_fragments() {
        let mut s = ReleaseScheduler::new(0, 0);
        s.enqueue(1, 0);
        s.enqueue(2, 0);
        s.enqueue(1, 1);
        s.cancel(1);
        assert_eq!(s.queued(), 1);
        assert_eq!(s.next_due(0), Some(f(2, 0)));
    }
}
