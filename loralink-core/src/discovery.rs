//! Neighbor discovery: unauthenticated beacons and a time-bounded table of seen peers.

use std::collections::HashMap;

use crate::config::ProtocolConfig;
use crate::core::Event;
use crate::identity::DeviceId;
use crate::protocol::{Beacon, Packet};
use crate::wire;

/// A peer heard beaconing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: DeviceId,
    pub last_seen: u64,
}

pub struct NeighborDiscovery {
    enabled: bool,
    last_beacon: Option<u64>,
    peers: HashMap<DeviceId, u64>,
    interval_ms: u64,
    ttl_ms: u64,
    max_peers: usize,
}

impl NeighborDiscovery {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            enabled: false,
            last_beacon: None,
            peers: HashMap::new(),
            interval_ms: config.beacon_interval_ms,
            ttl_ms: config.discovery_ttl_ms,
            max_peers: config.max_discovered_peers.max(1),
        }
    }

    /// Turn discovery mode on or off. Turning it on beacons on the next check.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.last_beacon = None;
        }
        self.enabled = enabled;
        tracing::info!(enabled, "discovery mode");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Beacon packet when discovery mode is on and the interval has elapsed.
    pub fn due_beacon(&mut self, local_id: DeviceId, now: u64) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        if let Some(last) = self.last_beacon {
            if now.saturating_sub(last) < self.interval_ms {
                return None;
            }
        }
        match wire::encode_packet(&Packet::Beacon(Beacon { device_id: local_id })) {
            Ok(bytes) => {
                self.last_beacon = Some(now);
                Some(bytes)
            }
            Err(e) => {
                tracing::warn!("failed to encode beacon: {}", e);
                None
            }
        }
    }

    /// Record a beacon. Own beacons are ignored; a first sighting raises `PeerDiscovered`.
    pub fn on_beacon(&mut self, local_id: DeviceId, beacon: Beacon, now: u64) -> Option<Event> {
        let id = beacon.device_id;
        if id == local_id {
            return None;
        }
        if let Some(seen) = self.peers.get_mut(&id) {
            *seen = now;
            return None;
        }
        if self.peers.len() >= self.max_peers {
            let stalest = self
                .peers
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(&k, _)| k);
            if let Some(k) = stalest {
                self.peers.remove(&k);
            }
        }
        self.peers.insert(id, now);
        tracing::info!(peer = %id, "peer discovered");
        Some(Event::PeerDiscovered { peer: id })
    }

    /// Remove peers not refreshed within the TTL. Returns how many were removed.
    pub fn purge(&mut self, now: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.peers.len();
        self.peers.retain(|_, &mut seen| now.saturating_sub(seen) <= ttl);
        before - self.peers.len()
    }

    /// Current table, ordered by device id.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut out: Vec<DiscoveredPeer> = self
            .peers
            .iter()
            .map(|(&device_id, &last_seen)| DiscoveredPeer {
                device_id,
                last_seen,
            })
            .collect();
        out.sort_by_key(|p| p.device_id);
        out
    }
}
