//! Pairing session state.
//!
//! At most one active partner per session. Transitions are validated so a
//! late dial result or a duplicate Connect cannot move the session backwards.

use tracing::{debug, warn};

use crate::types::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected, no attempt in progress
    Disconnected,
    /// Attempting to establish connection
    Connecting,
    /// Successfully connected to the partner
    Connected,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// The two-party pairing for this registration session.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub local_peer_id: PeerId,
    pub partner_peer_id: Option<PeerId>,
    state: SessionState,
    /// Whether our own Connect has gone out (reply-once bookkeeping)
    pub sent_connect: bool,
}

impl PeerSession {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            partner_peer_id: None,
            state: SessionState::Disconnected,
            sent_connect: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Try to move to `new_state`. Returns false (state unchanged) on an
    /// invalid transition.
    pub fn try_transition(&mut self, new_state: SessionState) -> bool {
        let valid = matches!(
            (self.state, new_state),
            (SessionState::Disconnected, SessionState::Connecting)
                | (SessionState::Connecting, SessionState::Connected)
                | (SessionState::Connecting, SessionState::Disconnected)
                | (SessionState::Connected, SessionState::Disconnected)
                // Inbound Connect while idle: the partner dialed us
                | (SessionState::Disconnected, SessionState::Connected)
        );

        if valid {
            debug!(
                "session state: {:?} -> {:?} (partner: {:?})",
                self.state, new_state, self.partner_peer_id
            );
            self.state = new_state;
        } else {
            warn!(
                "invalid session transition {:?} -> {:?}",
                self.state, new_state
            );
        }
        valid
    }

    /// Record the partner. A second, different partner is rejected while the
    /// first is still paired.
    pub fn set_partner(&mut self, partner: PeerId) -> bool {
        match &self.partner_peer_id {
            Some(existing) if *existing != partner => {
                warn!(
                    "rejecting partner {} while paired with {}",
                    partner, existing
                );
                false
            }
            _ => {
                self.partner_peer_id = Some(partner);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.partner_peer_id = None;
        self.state = SessionState::Disconnected;
        self.sent_connect = false;
    }
}
