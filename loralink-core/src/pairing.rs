//! Pairing engine: three-message authenticated ECDH handshake and session ownership.
//!
//! Initiator sends BIND_REQUEST; the responder waits for a local accept, then answers
//! with BIND_RESPONSE tagged under the derived key; the initiator checks that tag,
//! installs the key and sends BIND_CONFIRM; the responder checks the confirm tag and
//! installs the same key. A key is installed only after the peer's tag verifies.

use crate::core::{Action, Event};
use crate::crypto::{self, CryptoError, EncodedPublicKey, EphemeralKeypair, Nonce, SessionKey};
use crate::identity::DeviceId;
use crate::integrity::{self, Tag};
use crate::keystore::{KeyStore, StoredPairing};
use crate::protocol::{BindConfirm, BindRequest, BindResponse, Packet};
use crate::wire::{self, EncodeError};

const RESPONSE_LABEL: &[u8; 4] = b"RESP";
const CONFIRM_LABEL: &[u8; 4] = b"CONF";

/// Externally visible handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    /// BIND_REQUEST sent, waiting for BIND_RESPONSE.
    RequestSent,
    /// Inbound request held until the operator accepts or cancels.
    AwaitingLocalAccept,
    /// BIND_RESPONSE sent, waiting for BIND_CONFIRM.
    AwaitingConfirm,
    Paired,
}

/// Transient handshake state. At most one exists.
enum PendingBind {
    Initiator {
        target: DeviceId,
        keypair: EphemeralKeypair,
        nonce_i: Nonce,
        started_at: u64,
    },
    AwaitingAccept {
        initiator: DeviceId,
        pub_i: EncodedPublicKey,
        nonce_i: Nonce,
        started_at: u64,
    },
    AwaitingConfirm {
        initiator: DeviceId,
        pub_i: EncodedPublicKey,
        pub_r: EncodedPublicKey,
        nonce_i: Nonce,
        nonce_r: Nonce,
        temp_key: SessionKey,
        started_at: u64,
    },
}

impl PendingBind {
    fn started_at(&self) -> u64 {
        match self {
            PendingBind::Initiator { started_at, .. }
            | PendingBind::AwaitingAccept { started_at, .. }
            | PendingBind::AwaitingConfirm { started_at, .. } => *started_at,
        }
    }

    fn state(&self) -> PairingState {
        match self {
            PendingBind::Initiator { .. } => PairingState::RequestSent,
            PendingBind::AwaitingAccept { .. } => PairingState::AwaitingLocalAccept,
            PendingBind::AwaitingConfirm { .. } => PairingState::AwaitingConfirm,
        }
    }
}

/// The established session: key plus the peer it was agreed with.
struct Session {
    key: SessionKey,
    peer: Option<DeviceId>,
}

pub struct PairingEngine {
    local_id: DeviceId,
    keystore: Box<dyn KeyStore>,
    session: Option<Session>,
    pending: Option<PendingBind>,
    timeout_ms: u64,
}

/// Handshake transcript: label || nonceI || nonceR || pubI || pubR.
fn transcript(
    label: &[u8; 4],
    nonce_i: &Nonce,
    nonce_r: &Nonce,
    pub_i: &EncodedPublicKey,
    pub_r: &EncodedPublicKey,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 + pub_i.len() + pub_r.len());
    out.extend_from_slice(label);
    out.extend_from_slice(nonce_i);
    out.extend_from_slice(nonce_r);
    out.extend_from_slice(pub_i.as_bytes());
    out.extend_from_slice(pub_r.as_bytes());
    out
}

impl PairingEngine {
    pub fn new(local_id: DeviceId, keystore: Box<dyn KeyStore>, timeout_ms: u64) -> Self {
        Self {
            local_id,
            keystore,
            session: None,
            pending: None,
            timeout_ms,
        }
    }

    /// Load a previously persisted pairing. Returns true when one was restored.
    pub fn restore(&mut self) -> bool {
        match self.keystore.load_pairing() {
            Some(stored) => {
                tracing::info!(peer = ?stored.peer_id, "restored pairing from key store");
                self.session = Some(Session {
                    key: stored.session_key,
                    peer: stored.peer_id,
                });
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> PairingState {
        match (&self.pending, &self.session) {
            (Some(p), _) => p.state(),
            (None, Some(_)) => PairingState::Paired,
            (None, None) => PairingState::Idle,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session.as_ref().map(|s| &s.key)
    }

    pub fn peer(&self) -> Option<DeviceId> {
        self.session.as_ref().and_then(|s| s.peer)
    }

    /// Initiator of the request awaiting local accept, if any.
    pub fn pending_initiator(&self) -> Option<DeviceId> {
        match &self.pending {
            Some(PendingBind::AwaitingAccept { initiator, .. }) => Some(*initiator),
            _ => None,
        }
    }

    /// Record the paired peer's identity when it was not known (e.g. restored key).
    pub fn learn_peer(&mut self, peer: DeviceId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.peer.is_some() {
            return;
        }
        session.peer = Some(peer);
        tracing::info!(peer = %peer, "paired peer identified");
        self.persist();
    }

    /// Start a handshake with `target`. Discards any current session and pending bind.
    pub fn request_bind(&mut self, target: DeviceId, now: u64) -> Result<Vec<Action>, PairingError> {
        if target == self.local_id {
            return Err(PairingError::SelfTarget);
        }
        let nonce_i = crypto::random_nonce()?;
        let keypair = EphemeralKeypair::generate();
        let request = BindRequest {
            target,
            initiator: self.local_id,
            nonce: nonce_i,
            public_key: keypair.public_key().clone(),
        };
        let bytes = wire::encode_packet(&Packet::BindRequest(request))?;

        self.drop_session();
        self.pending = Some(PendingBind::Initiator {
            target,
            keypair,
            nonce_i,
            started_at: now,
        });
        tracing::info!(peer = %target, "bind request sent");
        Ok(vec![Action::Transmit(bytes)])
    }

    /// Accept the pending inbound request: derive the key and answer with BIND_RESPONSE.
    pub fn accept_bind(&mut self, now: u64) -> Result<Vec<Action>, PairingError> {
        if !matches!(self.pending, Some(PendingBind::AwaitingAccept { .. })) {
            return Err(PairingError::NothingToAccept);
        }
        let Some(PendingBind::AwaitingAccept {
            initiator,
            pub_i,
            nonce_i,
            ..
        }) = self.pending.take()
        else {
            return Err(PairingError::NothingToAccept);
        };

        let nonce_r = crypto::random_nonce()?;
        let keypair = EphemeralKeypair::generate();
        let shared = keypair.shared_secret(&pub_i)?;
        let temp_key = crypto::derive_session_key(&shared, &nonce_i, &nonce_r);
        let pub_r = keypair.public_key().clone();
        let tag = integrity::keyed_tag(
            &temp_key,
            &transcript(RESPONSE_LABEL, &nonce_i, &nonce_r, &pub_i, &pub_r),
        );
        let response = BindResponse {
            initiator,
            responder: self.local_id,
            nonce: nonce_r,
            public_key: pub_r.clone(),
            tag,
        };
        let bytes = wire::encode_packet(&Packet::BindResponse(response))?;

        self.pending = Some(PendingBind::AwaitingConfirm {
            initiator,
            pub_i,
            pub_r,
            nonce_i,
            nonce_r,
            temp_key,
            started_at: now,
        });
        tracing::info!(initiator = %initiator, "bind accepted, response sent");
        Ok(vec![Action::Transmit(bytes)])
    }

    /// Discard the pending handshake. Returns true if there was one.
    pub fn cancel(&mut self) -> bool {
        let had = self.pending.take().is_some();
        if had {
            tracing::info!("pending bind cancelled");
        }
        had
    }

    /// Discard a pending handshake older than the pairing timeout.
    pub fn expire(&mut self, now: u64) -> Option<Event> {
        let started = self.pending.as_ref()?.started_at();
        if now.saturating_sub(started) <= self.timeout_ms {
            return None;
        }
        self.pending = None;
        tracing::info!("pending bind expired");
        Some(Event::BindExpired)
    }

    /// Forget the session and pending bind, and erase the key store record.
    pub fn unpair(&mut self) {
        self.pending = None;
        self.drop_session();
    }

    pub fn on_bind_request(&mut self, req: BindRequest, now: u64) -> Vec<Action> {
        if req.target != self.local_id {
            tracing::debug!(addressed_to = %req.target, "bind request for another device");
            return Vec::new();
        }
        if req.initiator == self.local_id {
            tracing::debug!("bind request from own id ignored");
            return Vec::new();
        }
        if self.pending.is_some() {
            tracing::info!("new bind request supersedes pending handshake");
        }
        tracing::info!(initiator = %req.initiator, "bind request received, awaiting accept");
        self.pending = Some(PendingBind::AwaitingAccept {
            initiator: req.initiator,
            pub_i: req.public_key,
            nonce_i: req.nonce,
            started_at: now,
        });
        vec![Action::Notify(Event::BindRequested {
            initiator: req.initiator,
        })]
    }

    pub fn on_bind_response(&mut self, resp: BindResponse) -> Vec<Action> {
        let Some(PendingBind::Initiator {
            target,
            keypair,
            nonce_i,
            ..
        }) = &self.pending
        else {
            tracing::debug!("unexpected bind response");
            return Vec::new();
        };
        if resp.initiator != self.local_id || resp.responder != *target {
            tracing::debug!(responder = %resp.responder, "bind response not for our request");
            return Vec::new();
        }
        let shared = match keypair.shared_secret(&resp.public_key) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("bind response key agreement failed: {}", e);
                return Vec::new();
            }
        };
        let temp_key = crypto::derive_session_key(&shared, nonce_i, &resp.nonce);
        let pub_i = keypair.public_key();
        if !integrity::verify_tag(
            &temp_key,
            &transcript(RESPONSE_LABEL, nonce_i, &resp.nonce, pub_i, &resp.public_key),
            &resp.tag,
        ) {
            tracing::warn!(responder = %resp.responder, "bind response tag mismatch");
            return Vec::new();
        }
        let confirm_tag: Tag = integrity::keyed_tag(
            &temp_key,
            &transcript(CONFIRM_LABEL, nonce_i, &resp.nonce, pub_i, &resp.public_key),
        );
        let confirm = match wire::encode_packet(&Packet::BindConfirm(BindConfirm { tag: confirm_tag })) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("failed to encode bind confirm: {}", e);
                return Vec::new();
            }
        };

        self.pending = None;
        self.install(temp_key, resp.responder);
        vec![
            Action::Transmit(confirm),
            Action::Notify(Event::Paired {
                peer: resp.responder,
            }),
        ]
    }

    pub fn on_bind_confirm(&mut self, conf: BindConfirm) -> Vec<Action> {
        let Some(PendingBind::AwaitingConfirm {
            initiator,
            pub_i,
            pub_r,
            nonce_i,
            nonce_r,
            temp_key,
            ..
        }) = &self.pending
        else {
            tracing::debug!("unexpected bind confirm");
            return Vec::new();
        };
        if !integrity::verify_tag(
            temp_key,
            &transcript(CONFIRM_LABEL, nonce_i, nonce_r, pub_i, pub_r),
            &conf.tag,
        ) {
            tracing::warn!(initiator = %initiator, "bind confirm tag mismatch");
            return Vec::new();
        }
        let peer = *initiator;
        let key = temp_key.clone();
        self.pending = None;
        self.install(key, peer);
        vec![Action::Notify(Event::Paired { peer })]
    }

    /// Install a verified key and persist it.
    fn install(&mut self, key: SessionKey, peer: DeviceId) {
        self.session = Some(Session {
            key,
            peer: Some(peer),
        });
        tracing::info!(peer = %peer, "pairing established");
        self.persist();
    }

    fn persist(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let record = StoredPairing {
            session_key: session.key.clone(),
            paired: true,
            peer_id: session.peer,
        };
        if let Err(e) = self.keystore.save_pairing(&record) {
            tracing::warn!("failed to persist pairing: {}", e);
        }
    }

    fn drop_session(&mut self) {
        if self.session.take().is_some() {
            tracing::info!("session cleared");
        }
        if let Err(e) = self.keystore.clear_pairing() {
            tracing::warn!("failed to clear key store: {}", e);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("no bind request to accept")]
    NothingToAccept,
    #[error("cannot bind to own device id")]
    SelfTarget,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
