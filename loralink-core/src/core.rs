//! Host-driven device context: LinkCore owns every component, classifies inbound
//! packets and runs the periodic tasks. The host passes bytes and a clock in and
//! gets actions back.

use crate::config::ProtocolConfig;
use crate::discovery::{DiscoveredPeer, NeighborDiscovery};
use crate::identity::DeviceId;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::liveness::{HeartbeatOutcome, LivenessMonitor};
use crate::messenger::{Messenger, SendError};
use crate::pairing::{PairingEngine, PairingError, PairingState};
use crate::protocol::Packet;
use crate::transport::Transport;
use crate::wire;

/// Something the host must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send these bytes over the transport.
    Transmit(Vec<u8>),
    /// Surface an event to the application.
    Notify(Event),
}

/// Application-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An inbound bind request waits for local accept.
    BindRequested { initiator: DeviceId },
    Paired { peer: DeviceId },
    BindCancelled,
    BindExpired,
    MessageReceived { seq: u32, payload: Vec<u8> },
    /// Every fragment of an outbound message was acknowledged.
    MessageDelivered { seq: u32 },
    /// Retries exhausted; the message was abandoned.
    DeliveryFailed { seq: u32 },
    PeerOnline { peer: DeviceId },
    PeerOffline { peer: DeviceId },
    /// The paired peer's id was learned from its heartbeat.
    PeerIdentified { peer: DeviceId },
    PeerDiscovered { peer: DeviceId },
}

/// Point-in-time view of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub device_id: DeviceId,
    pub state: PairingState,
    pub paired: bool,
    pub peer: Option<DeviceId>,
    pub peer_online: bool,
    pub last_heartbeat_ago_ms: Option<u64>,
    pub discovery_enabled: bool,
    pub pending_initiator: Option<DeviceId>,
    pub pending_messages: Vec<u32>,
    pub discovered: Vec<DiscoveredPeer>,
}

pub struct LinkCore {
    device_id: DeviceId,
    pairing: PairingEngine,
    messenger: Messenger,
    liveness: LivenessMonitor,
    discovery: NeighborDiscovery,
}

impl LinkCore {
    /// Load (or generate) the device id and restore any persisted pairing.
    pub fn new(mut keystore: Box<dyn KeyStore>, config: ProtocolConfig) -> Result<Self, KeyStoreError> {
        let device_id = keystore.load_device_id()?;
        let mut pairing = PairingEngine::new(device_id, keystore, config.pairing_timeout_ms);
        pairing.restore();
        tracing::info!(device_id = %device_id, paired = pairing.is_paired(), "link core ready");
        Ok(Self {
            device_id,
            messenger: Messenger::new(&config),
            liveness: LivenessMonitor::new(&config),
            discovery: NeighborDiscovery::new(&config),
            pairing,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn is_paired(&self) -> bool {
        self.pairing.is_paired()
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.state()
    }

    pub fn peer(&self) -> Option<DeviceId> {
        self.pairing.peer()
    }

    /// Classify one raw transport read and route it. Never fails: malformed,
    /// unauthenticated and ungated packets are dropped.
    pub fn on_packet_received(&mut self, raw: &[u8], now: u64) -> Vec<Action> {
        let Some(bytes) = wire::locate_packet(raw) else {
            tracing::debug!(len = raw.len(), "no packet type in read, dropped");
            return Vec::new();
        };
        let packet = match wire::decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("malformed packet dropped: {}", e);
                return Vec::new();
            }
        };

        if packet.packet_type().is_bind() {
            return self.on_bind_packet(packet, now);
        }
        match packet {
            Packet::Beacon(beacon) => self
                .discovery
                .on_beacon(self.device_id, beacon, now)
                .map(Action::Notify)
                .into_iter()
                .collect(),
            gated => self.on_session_packet(gated, now),
        }
    }

    /// BIND_*: processed whatever the pairing state, so a paired device can re-pair.
    fn on_bind_packet(&mut self, packet: Packet, now: u64) -> Vec<Action> {
        let mut actions = match packet {
            Packet::BindRequest(req) => return self.pairing.on_bind_request(req, now),
            Packet::BindResponse(resp) => self.pairing.on_bind_response(resp),
            Packet::BindConfirm(conf) => self.pairing.on_bind_confirm(conf),
            _ => return Vec::new(),
        };
        if actions
            .iter()
            .any(|a| matches!(a, Action::Notify(Event::Paired { .. })))
        {
            actions.extend(self.reset_session_state());
        }
        actions
    }

    /// HEARTBEAT, DATA and ACK: only meaningful under an established session.
    fn on_session_packet(&mut self, packet: Packet, now: u64) -> Vec<Action> {
        let Some(key) = self.pairing.session_key() else {
            tracing::info!(packet = ?packet.packet_type(), "not paired, packet dropped");
            return Vec::new();
        };
        match packet {
            Packet::Data(frag) => self.messenger.on_data(key, frag, now),
            Packet::Ack(ack) => self.messenger.on_ack(key, ack, now),
            Packet::Heartbeat(hb) => {
                let from = hb.device_id;
                match self.liveness.on_heartbeat(key, self.device_id, hb, now) {
                    HeartbeatOutcome::Accepted { events } => {
                        let mut actions: Vec<Action> = Vec::new();
                        if self.pairing.peer().is_none() {
                            self.pairing.learn_peer(from);
                            actions.push(Action::Notify(Event::PeerIdentified { peer: from }));
                        }
                        actions.extend(events.into_iter().map(Action::Notify));
                        actions
                    }
                    HeartbeatOutcome::Rejected | HeartbeatOutcome::OwnId => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// One pass of the periodic tasks, in loop order.
    pub fn tick(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(event) = self.pairing.expire(now) {
            actions.push(Action::Notify(event));
        }
        if let Some(beacon) = self.discovery.due_beacon(self.device_id, now) {
            actions.push(Action::Transmit(beacon));
        }
        if self.pairing.is_paired() {
            actions.extend(self.messenger.release_due(now));
        }
        if let Some(key) = self.pairing.session_key() {
            let transmitting = self.messenger.is_transmitting(now);
            if let Some(hb) = self.liveness.due_heartbeat(key, self.device_id, transmitting, now) {
                actions.push(Action::Transmit(hb));
            }
        }
        actions.extend(self.messenger.sweep_retries(now));
        self.messenger.purge(now);
        let gone = self.discovery.purge(now);
        if gone > 0 {
            tracing::debug!(gone, "stale discovered peers purged");
        }
        if self.pairing.is_paired() {
            if let Some(event) = self.liveness.check_status(now) {
                actions.push(Action::Notify(event));
            }
        }
        actions
    }

    /// Queue an application message for the paired peer. Returns its sequence number.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<u32, SendError> {
        let key = self.pairing.session_key().ok_or(SendError::NotPaired)?;
        self.messenger.send(key, payload)
    }

    /// Start a handshake with `target`. Any current session is discarded.
    pub fn request_bind(&mut self, target: DeviceId, now: u64) -> Result<Vec<Action>, PairingError> {
        let mut actions = self.pairing.request_bind(target, now)?;
        actions.extend(self.reset_session_state());
        Ok(actions)
    }

    pub fn accept_bind(&mut self, now: u64) -> Result<Vec<Action>, PairingError> {
        self.pairing.accept_bind(now)
    }

    pub fn cancel_bind(&mut self) -> Vec<Action> {
        if self.pairing.cancel() {
            vec![Action::Notify(Event::BindCancelled)]
        } else {
            Vec::new()
        }
    }

    /// Forget the pairing everywhere: key store, pending messages, reassembly, liveness.
    /// Messages still awaiting acknowledgement are reported as `DeliveryFailed`.
    pub fn unpair(&mut self) -> Vec<Action> {
        self.pairing.unpair();
        let actions = self.reset_session_state();
        tracing::info!("unpaired");
        actions
    }

    pub fn set_discovery(&mut self, enabled: bool) {
        self.discovery.set_enabled(enabled);
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.peers()
    }

    pub fn status(&self, now: u64) -> Status {
        let paired = self.pairing.is_paired();
        Status {
            device_id: self.device_id,
            state: self.pairing.state(),
            paired,
            peer: self.pairing.peer(),
            peer_online: paired && self.liveness.is_online(),
            last_heartbeat_ago_ms: self.liveness.since_last_heard(now),
            discovery_enabled: self.discovery.is_enabled(),
            pending_initiator: self.pairing.pending_initiator(),
            pending_messages: self.messenger.pending_messages(),
            discovered: self.discovery.peers(),
        }
    }

    /// One cooperative loop iteration: at most one receive and dispatch, then the
    /// periodic tasks. Transmits go straight to `transport`; events are returned.
    pub fn run_once<T: Transport + ?Sized>(&mut self, transport: &mut T, now: u64) -> Vec<Event> {
        let mut actions = Vec::new();
        if transport.has_data() {
            if let Some(raw) = transport.receive() {
                if !raw.is_empty() {
                    actions.extend(self.on_packet_received(&raw, now));
                }
            }
        }
        actions.extend(self.tick(now));
        perform(transport, actions)
    }

    /// Message and liveness state belongs to one session. Outbound messages of the
    /// old session can no longer be acknowledged and fail.
    fn reset_session_state(&mut self) -> Vec<Action> {
        self.liveness.reset();
        self.messenger
            .reset()
            .into_iter()
            .map(|seq| {
                tracing::warn!(seq, "session reset, message abandoned");
                Action::Notify(Event::DeliveryFailed { seq })
            })
            .collect()
    }
}

/// Send every `Transmit` over `transport` and return the events. Send failures are
/// logged; fragment retries cover lost DATA.
pub fn perform<T: Transport + ?Sized>(transport: &mut T, actions: Vec<Action>) -> Vec<Event> {
    let mut events = Vec::new();
    for action in actions {
        match action {
            Action::Transmit(bytes) => {
                if let Err(e) = transport.send(&bytes) {
                    tracing::warn!(len = bytes.len(), "transport send failed: {}", e);
                }
            }
            Action::Notify(event) => events.push(event),
        }
    }
    events
}
