// src/server/backend.rs

//! Server-to-backend protocol state: init handshake, the periodic server
//! update, magic rotation, and flush accounting. Per-session update timers
//! live on the session entries; this tracks everything server-wide.

use crate::address::Address;
use crate::constants::{
    SECONDS_BETWEEN_SERVER_UPDATES, SERVER_FLUSH_TIMEOUT, SERVER_INIT_RESEND_TIME,
    SERVER_INIT_TIMEOUT, SERVER_UPDATE_TIMEOUT,
};
use crate::magic::MagicSet;
use crate::protocol::backend::{InitResponseCode, ServerInitResponsePacket, ServerUpdateResponsePacket};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Waiting on hostname resolution (and the datacenter name).
    Resolving,
    /// Sending init requests until the backend answers.
    Initializing,
    /// Normal operation: server updates flow.
    Ready,
    /// Latched: the backend refused us or stopped answering. Passthrough and
    /// direct traffic continue, the overlay does not.
    DirectOnly,
}

/// What the update loop should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendAction {
    SendInitRequest,
    SendServerUpdate,
    InitTimedOut,
    UpdateTimedOut,
}

#[derive(Debug)]
pub struct BackendClient {
    pub state: BackendState,
    pub backend_address: Option<Address>,
    pub magic: MagicSet,
    pub init_request_id: u64,
    init_start_time: f64,
    last_init_send_time: f64,
    last_server_update_time: f64,
    last_server_update_response_time: f64,

    pub flushing: bool,
    pub flush_start_time: f64,
    pub flush_finished: bool,
    pub num_session_updates_to_flush: u64,
    pub num_flushed_session_updates: u64,
    pub num_match_data_to_flush: u64,
    pub num_flushed_match_data: u64,
}

impl BackendClient {
    pub fn new() -> Self {
        Self {
            state: BackendState::Resolving,
            backend_address: None,
            magic: MagicSet::default(),
            init_request_id: 0,
            init_start_time: 0.0,
            last_init_send_time: 0.0,
            last_server_update_time: 0.0,
            last_server_update_response_time: 0.0,
            flushing: false,
            flush_start_time: 0.0,
            flush_finished: false,
            num_session_updates_to_flush: 0,
            num_flushed_session_updates: 0,
            num_match_data_to_flush: 0,
            num_flushed_match_data: 0,
        }
    }

    pub fn ready(&self) -> bool {
        self.state == BackendState::Ready
    }

    pub fn direct_only(&self) -> bool {
        self.state == BackendState::DirectOnly
    }

    /// Hostname resolution finished.
    pub fn resolved(&mut self, address: Option<Address>, request_id: u64, now: f64) {
        match address {
            Some(address) => {
                info!("backend address is {address}");
                self.backend_address = Some(address);
                self.state = BackendState::Initializing;
                self.init_request_id = request_id;
                self.init_start_time = now;
                // Send the first init immediately.
                self.last_init_send_time = now - SERVER_INIT_RESEND_TIME;
            }
            None => {
                error!("could not resolve backend hostname, direct only");
                self.state = BackendState::DirectOnly;
            }
        }
    }

    /// Drive init resends, init timeout, the periodic server update, and the
    /// server update timeout.
    pub fn update(&mut self, now: f64) -> Vec<BackendAction> {
        let mut actions = Vec::new();
        match self.state {
            BackendState::Resolving | BackendState::DirectOnly => {}
            BackendState::Initializing => {
                if now - self.init_start_time >= SERVER_INIT_TIMEOUT {
                    error!("server init timed out, direct only");
                    self.state = BackendState::DirectOnly;
                    actions.push(BackendAction::InitTimedOut);
                } else if now - self.last_init_send_time >= SERVER_INIT_RESEND_TIME {
                    self.last_init_send_time = now;
                    actions.push(BackendAction::SendInitRequest);
                }
            }
            BackendState::Ready => {
                if now - self.last_server_update_response_time >= SERVER_UPDATE_TIMEOUT {
                    error!("server update timed out, direct only");
                    self.state = BackendState::DirectOnly;
                    actions.push(BackendAction::UpdateTimedOut);
                } else if now - self.last_server_update_time >= SECONDS_BETWEEN_SERVER_UPDATES {
                    self.last_server_update_time = now;
                    actions.push(BackendAction::SendServerUpdate);
                }
            }
        }
        actions
    }

    /// Returns true when the magic set changed.
    pub fn handle_init_response(&mut self, response: &ServerInitResponsePacket, now: f64) -> bool {
        if self.state != BackendState::Initializing {
            return false;
        }
        if response.request_id != self.init_request_id {
            return false;
        }
        if response.response_code != InitResponseCode::Ok {
            error!("server init failed: {}, direct only", response.response_code.describe());
            self.state = BackendState::DirectOnly;
            return false;
        }
        info!("server initialized with backend");
        self.state = BackendState::Ready;
        self.last_server_update_response_time = now;
        // First server update goes out on the next tick.
        self.last_server_update_time = now - SECONDS_BETWEEN_SERVER_UPDATES;
        self.magic.apply(response.magic_upcoming, response.magic_current, response.magic_previous)
    }

    /// Returns true when the magic set changed.
    pub fn handle_server_update_response(
        &mut self,
        response: &ServerUpdateResponsePacket,
        now: f64,
    ) -> bool {
        if self.state != BackendState::Ready {
            return false;
        }
        self.last_server_update_response_time = now;
        self.magic.apply(response.magic_upcoming, response.magic_current, response.magic_previous)
    }

    // -- flush ------------------------------------------------------------

    pub fn begin_flush(&mut self, num_sessions: u64, num_match_data: u64, now: f64) {
        if self.flushing {
            return;
        }
        info!(
            "flushing {num_sessions} session updates and {num_match_data} match data submissions"
        );
        self.flushing = true;
        self.flush_start_time = now;
        self.num_session_updates_to_flush = num_sessions;
        self.num_match_data_to_flush = num_match_data;
    }

    pub fn session_update_flushed(&mut self) {
        if self.flushing {
            self.num_flushed_session_updates += 1;
        }
    }

    pub fn match_data_flushed(&mut self) {
        if self.flushing {
            self.num_flushed_match_data += 1;
        }
    }

    /// Returns true exactly once, when every flush counter has caught up or
    /// the flush timeout passed.
    pub fn flush_complete(&mut self, now: f64) -> bool {
        if !self.flushing || self.flush_finished {
            return false;
        }
        let done = self.num_flushed_session_updates >= self.num_session_updates_to_flush
            && self.num_flushed_match_data >= self.num_match_data_to_flush;
        let timed_out = now - self.flush_start_time >= SERVER_FLUSH_TIMEOUT;
        if timed_out && !done {
            warn!(
                "flush timed out with {}/{} session updates and {}/{} match data flushed",
                self.num_flushed_session_updates,
                self.num_session_updates_to_flush,
                self.num_flushed_match_data,
                self.num_match_data_to_flush
            );
        }
        if done || timed_out {
            self.flush_finished = true;
            return true;
        }
        false
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_response(request_id: u64, code: InitResponseCode) -> ServerInitResponsePacket {
        ServerInitResponsePacket {
            request_id,
            response_code: code,
            magic_upcoming: [1; 8],
            magic_current: [2; 8],
            magic_previous: [3; 8],
        }
    }

    #[test]
    fn test_init_flow() {
        let mut backend = BackendClient::new();
        assert!(backend.update(0.0).is_empty());

        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 77, 0.0);
        assert_eq!(backend.update(0.0), vec![BackendAction::SendInitRequest]);
        // Resend after one second, not before.
        assert!(backend.update(0.5).is_empty());
        assert_eq!(backend.update(1.1), vec![BackendAction::SendInitRequest]);

        assert!(backend.handle_init_response(&init_response(77, InitResponseCode::Ok), 1.2));
        assert!(backend.ready());
        assert_eq!(backend.magic.current, [2; 8]);

        // First server update fires immediately once ready.
        assert_eq!(backend.update(1.3), vec![BackendAction::SendServerUpdate]);
    }

    #[test]
    fn test_init_rejects_wrong_request_id() {
        let mut backend = BackendClient::new();
        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 77, 0.0);
        assert!(!backend.handle_init_response(&init_response(78, InitResponseCode::Ok), 0.1));
        assert!(!backend.ready());
    }

    #[test]
    fn test_negative_init_response_is_terminal() {
        let mut backend = BackendClient::new();
        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 77, 0.0);
        backend.handle_init_response(&init_response(77, InitResponseCode::UnknownCustomer), 0.1);
        assert!(backend.direct_only());
        assert!(backend.update(10.0).is_empty());
    }

    #[test]
    fn test_init_timeout() {
        let mut backend = BackendClient::new();
        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 77, 0.0);
        backend.update(0.0);
        let actions = backend.update(SERVER_INIT_TIMEOUT + 0.1);
        assert_eq!(actions, vec![BackendAction::InitTimedOut]);
        assert!(backend.direct_only());
    }

    #[test]
    fn test_resolve_failure_is_direct_only() {
        let mut backend = BackendClient::new();
        backend.resolved(None, 1, 0.0);
        assert!(backend.direct_only());
    }

    #[test]
    fn test_server_update_timeout() {
        let mut backend = BackendClient::new();
        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 77, 0.0);
        backend.update(0.0);
        backend.handle_init_response(&init_response(77, InitResponseCode::Ok), 0.1);
        // Updates keep flowing while responses arrive.
        backend.update(0.2);
        let response = ServerUpdateResponsePacket {
            magic_upcoming: [1; 8],
            magic_current: [2; 8],
            magic_previous: [3; 8],
        };
        backend.handle_server_update_response(&response, 5.0);
        assert!(backend.ready());
        // Silence for the whole timeout latches direct only.
        let actions = backend.update(5.0 + SERVER_UPDATE_TIMEOUT + 0.1);
        assert_eq!(actions, vec![BackendAction::UpdateTimedOut]);
        assert!(backend.direct_only());
    }

    #[test]
    fn test_magic_rotation_detected() {
        let mut backend = BackendClient::new();
        backend.resolved(Some("127.0.0.1:40000".parse().unwrap()), 1, 0.0);
        assert!(backend.handle_init_response(&init_response(1, InitResponseCode::Ok), 0.1));
        let response = ServerUpdateResponsePacket {
            magic_upcoming: [1; 8],
            magic_current: [2; 8],
            magic_previous: [3; 8],
        };
        // Same triple: no change.
        assert!(!backend.handle_server_update_response(&response, 1.0));
        let rotated = ServerUpdateResponsePacket {
            magic_upcoming: [9; 8],
            magic_current: [1; 8],
            magic_previous: [2; 8],
        };
        assert!(backend.handle_server_update_response(&rotated, 2.0));
        assert_eq!(backend.magic.current, [1; 8]);
    }

    #[test]
    fn test_flush_accounting() {
        let mut backend = BackendClient::new();
        backend.begin_flush(2, 1, 0.0);
        assert!(!backend.flush_complete(0.1));
        backend.session_update_flushed();
        backend.session_update_flushed();
        assert!(!backend.flush_complete(0.2));
        backend.match_data_flushed();
        assert!(backend.flush_complete(0.3));
        // Only reported once.
        assert!(!backend.flush_complete(0.4));
    }

    #[test]
    fn test_flush_timeout() {
        let mut backend = BackendClient::new();
        backend.begin_flush(5, 0, 0.0);
        assert!(!backend.flush_complete(1.0));
        assert!(backend.flush_complete(SERVER_FLUSH_TIMEOUT + 0.1));
    }
}
