// src/server/session.rs

//! Per-session server state: the pending (pre-upgrade) entry, the full
//! session entry, and the route acceptance state machine fed by relays.

use crate::address::Address;
use crate::constants::{KEY_BYTES, SLICE_SECONDS, sequence_greater_than, sequence_less_than};
use crate::crypto::{KxKeypair, SessionKeys};
use crate::protocol::backend::SessionData;
use crate::protocol::packets::{ClientStatsPacket, UPGRADE_TOKEN_BYTES};
use crate::protocol::tokens::{ContinueToken, RouteToken};
use crate::replay::ReplayProtection;
use crate::server::session_table::TableEntry;
use crate::stats::{BandwidthLimiter, JitterTracker, OutOfOrderTracker, PacketLossTracker};
use tracing::debug;

/// Pre-upgrade state. Promoted to a [`ServerSessionEntry`] when a valid
/// upgrade response echoes the token back.
pub struct PendingSessionEntry {
    pub address: Address,
    pub session_id: u64,
    pub user_hash: u64,
    pub upgrade_token: [u8; UPGRADE_TOKEN_BYTES],
    pub server_kx: KxKeypair,
    pub upgrade_time: f64,
    pub last_packet_send_time: f64,
}

impl TableEntry for PendingSessionEntry {
    fn entry_address(&self) -> Address {
        self.address
    }
    fn entry_session_id(&self) -> u64 {
        self.session_id
    }
}

/// One accepted route (pending, current or previous).
#[derive(Debug, Clone, Copy)]
pub struct SessionRoute {
    pub session_version: u8,
    pub expire_timestamp: u64,
    pub expire_time: f64,
    pub kbps_up: u32,
    pub kbps_down: u32,
    /// Relay the server sends through for this route.
    pub send_address: Address,
    pub private_key: [u8; KEY_BYTES],
}

/// Outstanding session update exchange with the backend.
#[derive(Debug, Default)]
pub struct SessionUpdateState {
    /// Next slice number to send. The backend response for slice N is only
    /// accepted while this equals N + 1 and we are waiting.
    pub update_sequence: u64,
    pub waiting_for_response: bool,
    pub first_send_time: f64,
    pub last_send_time: f64,
    pub retry_number: u32,
    /// Latched when a session update times out: no more updates, the session
    /// runs direct from then on.
    pub timed_out: bool,
}

#[derive(Debug)]
pub struct MatchDataState {
    pub match_id: u64,
    pub match_values: Vec<f64>,
    pub retry_number: u32,
    pub last_send_time: f64,
    pub sent: bool,
    pub acked: bool,
}

pub struct ServerSessionEntry {
    pub address: Address,
    pub session_id: u64,
    pub most_recent_session_version: u8,
    pub session_keys: SessionKeys,
    pub client_route_public_key: [u8; KEY_BYTES],
    pub server_kx: KxKeypair,
    pub client_open_session_sequence: u8,
    pub user_hash: u64,
    pub platform_id: u8,
    pub connection_type: u8,

    pub pending_route: Option<SessionRoute>,
    pub current_route: Option<SessionRoute>,
    pub previous_route: Option<SessionRoute>,

    pub internal_send_sequence: u64,
    pub special_send_sequence: u64,

    pub payload_replay: ReplayProtection,
    pub internal_replay: ReplayProtection,
    pub special_replay: ReplayProtection,

    pub start_time: f64,
    /// Last time any authenticated packet arrived from the client.
    pub last_packet_receive_time: f64,
    /// Last time a direct ping arrived; drives `client_ping_timed_out`.
    pub last_client_ping_time: f64,

    pub client_stats: ClientStatsPacket,
    pub loss_tracker: PacketLossTracker,
    pub ooo_tracker: OutOfOrderTracker,
    pub jitter_tracker: JitterTracker,
    pub direct_down: BandwidthLimiter,
    pub next_down: BandwidthLimiter,

    pub update: SessionUpdateState,
    pub next_session_update_time: f64,
    pub session_data: SessionData,
    pub session_events: u64,
    pub internal_events: u64,

    /// Route update pushed to the client after each backend response.
    pub route_update_sequence: u64,
    pub route_update_packet: Option<Vec<u8>>,
    pub route_update_acked: bool,
    pub last_route_update_send_time: f64,

    pub match_data: Option<MatchDataState>,

    pub multipath: bool,
    pub flush_update_sent: bool,
    pub flush_update_done: bool,
}

impl TableEntry for ServerSessionEntry {
    fn entry_address(&self) -> Address {
        self.address
    }
    fn entry_session_id(&self) -> u64 {
        self.session_id
    }
}

impl ServerSessionEntry {
    pub fn new(pending: PendingSessionEntry, keys: SessionKeys, client_route_public_key: [u8; KEY_BYTES], client_open_session_sequence: u8, platform_id: u8, connection_type: u8, now: f64) -> Self {
        Self {
            address: pending.address,
            session_id: pending.session_id,
            most_recent_session_version: 0,
            session_keys: keys,
            client_route_public_key,
            server_kx: pending.server_kx,
            client_open_session_sequence,
            user_hash: pending.user_hash,
            platform_id,
            connection_type,
            pending_route: None,
            current_route: None,
            previous_route: None,
            internal_send_sequence: 0,
            special_send_sequence: 0,
            payload_replay: ReplayProtection::new(),
            internal_replay: ReplayProtection::new(),
            special_replay: ReplayProtection::new(),
            start_time: now,
            last_packet_receive_time: now,
            last_client_ping_time: now,
            client_stats: ClientStatsPacket::default(),
            loss_tracker: PacketLossTracker::new(),
            ooo_tracker: OutOfOrderTracker::new(),
            jitter_tracker: JitterTracker::new(),
            direct_down: BandwidthLimiter::new(),
            next_down: BandwidthLimiter::new(),
            update: SessionUpdateState::default(),
            next_session_update_time: now + SLICE_SECONDS,
            session_data: SessionData::default(),
            session_events: 0,
            internal_events: 0,
            route_update_sequence: 0,
            route_update_packet: None,
            route_update_acked: true,
            last_route_update_send_time: 0.0,
            match_data: None,
            multipath: false,
            flush_update_sent: false,
            flush_update_done: false,
        }
    }

    pub fn next_internal_sequence(&mut self) -> u64 {
        self.internal_send_sequence += 1;
        self.internal_send_sequence
    }

    pub fn next_special_sequence(&mut self) -> u64 {
        self.special_send_sequence += 1;
        self.special_send_sequence
    }

    /// Route request from a relay. Returns the private key to authenticate
    /// the route response with, or `None` if the token is rejected.
    pub fn handle_route_token(
        &mut self,
        token: &RouteToken,
        from: Address,
        now: f64,
    ) -> Option<[u8; KEY_BYTES]> {
        // A token older than the route we are already on is a replay.
        if let Some(current) = &self.current_route {
            if token.expire_timestamp < current.expire_timestamp {
                debug!("rejected route token older than current route");
                return None;
            }
        }
        if sequence_less_than(token.session_version, self.most_recent_session_version) {
            debug!(
                "rejected route token with stale session version {} (most recent {})",
                token.session_version, self.most_recent_session_version
            );
            return None;
        }

        match &self.pending_route {
            Some(pending) if pending.session_version == token.session_version => {
                // Resent request: answer again with the same key.
                Some(pending.private_key)
            }
            Some(pending)
                if !sequence_greater_than(token.session_version, pending.session_version) =>
            {
                None
            }
            _ => {
                let route = SessionRoute {
                    session_version: token.session_version,
                    expire_timestamp: token.expire_timestamp,
                    expire_time: now + SLICE_SECONDS * 2.0,
                    kbps_up: token.kbps_up,
                    kbps_down: token.kbps_down,
                    send_address: from,
                    private_key: token.private_key,
                };
                self.pending_route = Some(route);
                self.most_recent_session_version = token.session_version;
                debug!(
                    "session {:016x} pending route version {} via {from}",
                    self.session_id, token.session_version
                );
                Some(route.private_key)
            }
        }
    }

    /// A payload or ping packet authenticated under the pending route key:
    /// the client is on the new route, commit to it.
    pub fn promote_pending_route(&mut self) -> bool {
        let Some(pending) = self.pending_route.take() else {
            return false;
        };
        self.previous_route = self.current_route.replace(pending);
        debug!(
            "session {:016x} promoted route version {}",
            self.session_id, pending.session_version
        );
        true
    }

    /// Continue request from a relay. Returns the current route key for the
    /// continue response if the token checks out. Every accepted token
    /// extends the route by one slice, matching what the client does when
    /// the continue response lands.
    pub fn handle_continue_token(
        &mut self,
        token: &ContinueToken,
        _now: f64,
    ) -> Option<[u8; KEY_BYTES]> {
        let current = self.current_route.as_mut()?;
        if token.session_version != current.session_version {
            debug!("rejected continue token for wrong session version");
            return None;
        }
        if token.expire_timestamp < current.expire_timestamp {
            debug!("rejected continue token older than current route");
            return None;
        }
        current.expire_timestamp = token.expire_timestamp;
        current.expire_time += SLICE_SECONDS;
        self.previous_route = None;
        Some(current.private_key)
    }

    /// Expire routes whose window has passed.
    pub fn expire_routes(&mut self, now: f64) {
        if self.current_route.is_some_and(|r| now >= r.expire_time) {
            debug!("session {:016x} current route expired", self.session_id);
            self.current_route = None;
            self.previous_route = None;
        }
        if self.pending_route.is_some_and(|r| now >= r.expire_time) {
            self.pending_route = None;
        }
    }

    /// Keys a client packet may authenticate under, pending first so route
    /// promotion is detected.
    pub fn route_keys(&self) -> Vec<(RouteKeyKind, [u8; KEY_BYTES])> {
        let mut keys = Vec::with_capacity(3);
        if let Some(route) = &self.pending_route {
            keys.push((RouteKeyKind::Pending, route.private_key));
        }
        if let Some(route) = &self.current_route {
            keys.push((RouteKeyKind::Current, route.private_key));
        }
        if let Some(route) = &self.previous_route {
            keys.push((RouteKeyKind::Previous, route.private_key));
        }
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKeyKind {
    Pending,
    Current,
    Previous,
}
