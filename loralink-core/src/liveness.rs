//! Liveness monitor: authenticated heartbeats and online/offline tracking of the paired peer.

use crate::config::ProtocolConfig;
use crate::core::Event;
use crate::crypto::SessionKey;
use crate::identity::DeviceId;
use crate::protocol::{Heartbeat, Packet};
use crate::wire;

/// Result of an inbound heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted { events: Vec<Event> },
    /// Tag did not verify under the session key.
    Rejected,
    /// Carried our own device id (echo).
    OwnId,
}

pub struct LivenessMonitor {
    interval_ms: u64,
    timeout_ms: u64,
    check_interval_ms: u64,
    last_sent: Option<u64>,
    last_heard: Option<u64>,
    last_check: Option<u64>,
    /// Device the last valid heartbeat came from.
    heard_from: Option<DeviceId>,
    online: bool,
}

impl LivenessMonitor {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            interval_ms: config.heartbeat_interval_ms,
            timeout_ms: config.heartbeat_timeout_ms,
            check_interval_ms: config.status_check_interval_ms,
            last_sent: None,
            last_heard: None,
            last_check: None,
            heard_from: None,
            online: false,
        }
    }

    /// Heartbeat packet when one is due. Deferred (not dropped) while `transmitting`.
    pub fn due_heartbeat(
        &mut self,
        key: &SessionKey,
        local_id: DeviceId,
        transmitting: bool,
        now: u64,
    ) -> Option<Vec<u8>> {
        if let Some(sent) = self.last_sent {
            if now.saturating_sub(sent) < self.interval_ms {
                return None;
            }
        }
        if transmitting {
            tracing::debug!("heartbeat deferred, transmission in flight");
            return None;
        }
        match wire::encode_packet(&Packet::Heartbeat(Heartbeat::sealed(key, local_id))) {
            Ok(bytes) => {
                self.last_sent = Some(now);
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!("failed to encode heartbeat: {}", e);
                None
            }
        }
    }

    /// Verify and record a heartbeat. A peer coming back raises `PeerOnline` at once.
    pub fn on_heartbeat(
        &mut self,
        key: &SessionKey,
        local_id: DeviceId,
        hb: Heartbeat,
        now: u64,
    ) -> HeartbeatOutcome {
        if !hb.verify(key) {
            tracing::warn!(from = %hb.device_id, "heartbeat tag mismatch, dropped");
            return HeartbeatOutcome::Rejected;
        }
        if hb.device_id == local_id {
            tracing::debug!("own heartbeat ignored");
            return HeartbeatOutcome::OwnId;
        }
        self.last_heard = Some(now);
        self.heard_from = Some(hb.device_id);
        let mut events = Vec::new();
        if !self.online {
            self.online = true;
            tracing::info!(peer = %hb.device_id, "peer online");
            events.push(Event::PeerOnline { peer: hb.device_id });
        }
        HeartbeatOutcome::Accepted { events }
    }

    /// Periodic online/offline recheck. Emits only on transitions.
    pub fn check_status(&mut self, now: u64) -> Option<Event> {
        if let Some(checked) = self.last_check {
            if now.saturating_sub(checked) < self.check_interval_ms {
                return None;
            }
        }
        self.last_check = Some(now);
        let online = self
            .last_heard
            .is_some_and(|t| now.saturating_sub(t) < self.timeout_ms);
        if online == self.online {
            return None;
        }
        self.online = online;
        let peer = self.heard_from?;
        if online {
            tracing::info!(peer = %peer, "peer online");
            Some(Event::PeerOnline { peer })
        } else {
            tracing::info!(peer = %peer, "peer offline");
            Some(Event::PeerOffline { peer })
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Milliseconds since the last valid heartbeat.
    pub fn since_last_heard(&self, now: u64) -> Option<u64> {
        self.last_heard.map(|t| now.saturating_sub(t))
    }

    /// Forget everything; the next heartbeat goes out immediately.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.last_heard = None;
        self.last_check = None;
        self.heard_from = None;
        self.online = false;
    }
}
