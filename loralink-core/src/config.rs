//! Protocol timing and bounds. All durations in milliseconds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Beacon period while discovery mode is on.
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval_ms: u64,
    /// Discovered peers not refreshed within this window are purged.
    #[serde(default = "default_discovery_ttl")]
    pub discovery_ttl_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Peer is offline when no valid heartbeat arrived within this window.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_status_check_interval")]
    pub status_check_interval_ms: u64,
    /// A handshake left pending longer than this is discarded.
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_ms: u64,
    /// Reassembly buffers with no progress within this window are purged.
    #[serde(default = "default_fragment_timeout")]
    pub fragment_timeout_ms: u64,
    /// Unacknowledged fragments are resent after this long.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// How long the next fragment waits for the previous fragment's ACK.
    #[serde(default = "default_ack_fast_window")]
    pub ack_fast_window_ms: u64,
    #[serde(default = "default_inter_fragment_gap")]
    pub inter_fragment_gap_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    #[serde(default = "default_max_reassembly_buffers")]
    pub max_reassembly_buffers: usize,
    #[serde(default = "default_max_discovered_peers")]
    pub max_discovered_peers: usize,
}

fn default_beacon_interval() -> u64 {
    3_000
}
fn default_discovery_ttl() -> u64 {
    15_000
}
fn default_heartbeat_interval() -> u64 {
    10_000
}
fn default_heartbeat_timeout() -> u64 {
    30_000
}
fn default_status_check_interval() -> u64 {
    500
}
fn default_pairing_timeout() -> u64 {
    30_000
}
fn default_fragment_timeout() -> u64 {
    15_000
}
fn default_ack_timeout() -> u64 {
    2_000
}
fn default_ack_fast_window() -> u64 {
    350
}
fn default_inter_fragment_gap() -> u64 {
    40
}
fn default_max_retries() -> u8 {
    3
}
fn default_max_pending_messages() -> usize {
    4
}
fn default_max_reassembly_buffers() -> usize {
    8
}
fn default_max_discovered_peers() -> usize {
    32
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: default_beacon_interval(),
            discovery_ttl_ms: default_discovery_ttl(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            status_check_interval_ms: default_status_check_interval(),
            pairing_timeout_ms: default_pairing_timeout(),
            fragment_timeout_ms: default_fragment_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            ack_fast_window_ms: default_ack_fast_window(),
            inter_fragment_gap_ms: default_inter_fragment_gap(),
            max_retries: default_max_retries(),
            max_pending_messages: default_max_pending_messages(),
            max_reassembly_buffers: default_max_reassembly_buffers(),
            max_discovered_peers: default_max_discovered_peers(),
        }
    }
}
