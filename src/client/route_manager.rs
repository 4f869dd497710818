// src/client/route_manager.rs

//! Client route state machine.
//!
//! Tracks up to three routes per session: the `current` route payloads ride
//! on, a `previous` route kept briefly so in-flight packets still decode
//! after a switch, and a `pending` route or continue being negotiated with
//! the first relay. Any failure latches `fallback_to_direct`; after that the
//! session never touches the overlay again.

use crate::address::Address;
use crate::constants::{
    CONTINUE_REQUEST_SEND_TIME, CONTINUE_REQUEST_TIMEOUT, FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT,
    FALLBACK_FLAG_ROUTE_EXPIRED, FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT, KEY_BYTES,
    ROUTE_REQUEST_SEND_TIME, ROUTE_REQUEST_TIMEOUT, SLICE_SECONDS,
};
use crate::constants::sequence_greater_than;
use crate::protocol::packet_type::{CONTINUE_REQUEST_PACKET, ROUTE_REQUEST_PACKET};
use crate::protocol::tokens::{
    self, ENCRYPTED_CONTINUE_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES,
};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteData {
    pub session_id: u64,
    pub session_version: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_address: Address,
    pub private_key: [u8; KEY_BYTES],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Route,
    Continue,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: PendingKind,
    route: RouteData,
    expire_timestamp: u64,
    start_time: f64,
    last_request_time: f64,
    /// Sealed tokens for the rest of the chain, forwarded to the first hop.
    request_tokens: Vec<u8>,
}

/// Something the owning runtime must put on the wire or act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// Send (or resend) a route/continue request: packet type, token bytes,
    /// destination.
    SendRequest { packet_type: u8, tokens: Vec<u8>, to: Address },
    /// Fallback just latched, with the flag that caused it.
    FallbackToDirect { flag: u64 },
}

#[derive(Debug, Default)]
pub struct RouteManager {
    current: Option<RouteData>,
    current_expire_time: f64,
    previous: Option<RouteData>,
    pending: Option<Pending>,
    fallback_to_direct: bool,
    fallback_flags: u64,
}

impl RouteManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_route(&self) -> Option<&RouteData> {
        self.current.as_ref()
    }

    pub fn previous_route(&self) -> Option<&RouteData> {
        self.previous.as_ref()
    }

    pub fn pending_route_key(&self) -> Option<[u8; KEY_BYTES]> {
        self.pending.as_ref().map(|p| p.route.private_key)
    }

    pub fn fallback_to_direct(&self) -> bool {
        self.fallback_to_direct
    }

    pub fn fallback_flags(&self) -> u64 {
        self.fallback_flags
    }

    fn fallback(&mut self, flag: u64) -> Vec<RouteEvent> {
        if self.fallback_to_direct {
            return Vec::new();
        }
        self.fallback_to_direct = true;
        self.fallback_flags |= flag;
        self.current = None;
        self.previous = None;
        self.pending = None;
        debug!("client fallback to direct, flag {flag:#x}");
        vec![RouteEvent::FallbackToDirect { flag }]
    }

    /// Explicit fallback from outside the state machine (pong timeouts, route
    /// update timeout).
    pub fn force_fallback(&mut self, flag: u64) -> Vec<RouteEvent> {
        self.fallback(flag)
    }

    /// Apply a DIRECT route command: drop off the overlay without fallback.
    /// The demoted route sticks around so in-flight packets still decode.
    pub fn direct(&mut self) {
        if let Some(current) = self.current.take() {
            self.previous = Some(current);
        }
        self.pending = None;
    }

    /// Apply a ROUTE command carrying a sealed token array. The first token
    /// is ours; the rest go to the first relay in the route request.
    pub fn begin_route(
        &mut self,
        tokens: &[u8],
        num_tokens: u8,
        router_public: &PublicKey,
        route_secret: &StaticSecret,
        now: f64,
        unix_now: u64,
    ) -> Vec<RouteEvent> {
        if self.fallback_to_direct {
            return Vec::new();
        }
        if num_tokens == 0
            || tokens.len() != num_tokens as usize * ENCRYPTED_ROUTE_TOKEN_BYTES
        {
            debug!("ignoring route command with malformed token array");
            return Vec::new();
        }
        let token = match tokens::open_route_token(
            &tokens[..ENCRYPTED_ROUTE_TOKEN_BYTES],
            router_public,
            route_secret,
        ) {
            Ok(token) => token,
            Err(_) => {
                debug!("could not decrypt route token");
                return Vec::new();
            }
        };
        if unix_now >= token.expire_timestamp {
            debug!("route token already expired");
            return Vec::new();
        }
        if let Some(pending) = &self.pending {
            // A newer session version replaces the pending route outright.
            if !sequence_greater_than(token.session_version, pending.route.session_version) {
                return Vec::new();
            }
        }
        let request_tokens = tokens[ENCRYPTED_ROUTE_TOKEN_BYTES..].to_vec();
        let route = RouteData {
            session_id: token.session_id,
            session_version: token.session_version,
            kbps_up: token.kbps_up,
            kbps_down: token.kbps_down,
            next_address: token.next_address,
            private_key: token.private_key,
        };
        self.pending = Some(Pending {
            kind: PendingKind::Route,
            route,
            expire_timestamp: token.expire_timestamp,
            start_time: now,
            last_request_time: now,
            request_tokens: request_tokens.clone(),
        });
        vec![RouteEvent::SendRequest {
            packet_type: ROUTE_REQUEST_PACKET,
            tokens: request_tokens,
            to: route.next_address,
        }]
    }

    /// Apply a CONTINUE command. Requires a current route; the continue
    /// token must match its session version.
    pub fn begin_continue(
        &mut self,
        tokens: &[u8],
        num_tokens: u8,
        router_public: &PublicKey,
        route_secret: &StaticSecret,
        now: f64,
        unix_now: u64,
    ) -> Vec<RouteEvent> {
        if self.fallback_to_direct {
            return Vec::new();
        }
        let Some(current) = self.current else {
            debug!("ignoring continue command with no current route");
            return Vec::new();
        };
        if num_tokens == 0
            || tokens.len() != num_tokens as usize * ENCRYPTED_CONTINUE_TOKEN_BYTES
        {
            debug!("ignoring continue command with malformed token array");
            return Vec::new();
        }
        let token = match tokens::open_continue_token(
            &tokens[..ENCRYPTED_CONTINUE_TOKEN_BYTES],
            router_public,
            route_secret,
        ) {
            Ok(token) => token,
            Err(_) => {
                debug!("could not decrypt continue token");
                return Vec::new();
            }
        };
        if unix_now >= token.expire_timestamp
            || token.session_id != current.session_id
            || token.session_version != current.session_version
        {
            debug!("continue token does not match current route");
            return Vec::new();
        }
        if self.pending.as_ref().is_some_and(|p| p.kind == PendingKind::Continue) {
            return Vec::new();
        }
        let request_tokens = tokens[ENCRYPTED_CONTINUE_TOKEN_BYTES..].to_vec();
        self.pending = Some(Pending {
            kind: PendingKind::Continue,
            route: current,
            expire_timestamp: token.expire_timestamp,
            start_time: now,
            last_request_time: now,
            request_tokens: request_tokens.clone(),
        });
        vec![RouteEvent::SendRequest {
            packet_type: CONTINUE_REQUEST_PACKET,
            tokens: request_tokens,
            to: current.next_address,
        }]
    }

    /// A route response verified under the pending route key: promote it.
    pub fn route_established(&mut self, now: f64) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if pending.kind != PendingKind::Route {
            self.pending = Some(pending);
            return false;
        }
        self.previous = self.current.replace(pending.route);
        self.current_expire_time = now + SLICE_SECONDS * 2.0;
        debug!(
            "route established to {} (session version {})",
            pending.route.next_address, pending.route.session_version
        );
        true
    }

    /// A continue response verified under the current route key: extend the
    /// route one slice and drop the previous route.
    pub fn route_continued(&mut self, _now: f64) -> bool {
        if !self.pending.as_ref().is_some_and(|p| p.kind == PendingKind::Continue) {
            return false;
        }
        self.pending = None;
        self.previous = None;
        self.current_expire_time += SLICE_SECONDS;
        debug!("route continued, expires at {:.1}", self.current_expire_time);
        true
    }

    /// Drive timers: request resends, request timeouts, route expiry.
    pub fn update(&mut self, now: f64) -> Vec<RouteEvent> {
        if self.fallback_to_direct {
            return Vec::new();
        }
        let mut events = Vec::new();

        if let Some(pending) = &mut self.pending {
            let (timeout, send_time, flag) = match pending.kind {
                PendingKind::Route => (
                    ROUTE_REQUEST_TIMEOUT,
                    ROUTE_REQUEST_SEND_TIME,
                    FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT,
                ),
                PendingKind::Continue => (
                    CONTINUE_REQUEST_TIMEOUT,
                    CONTINUE_REQUEST_SEND_TIME,
                    FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT,
                ),
            };
            if now - pending.start_time >= timeout {
                return self.fallback(flag);
            }
            if now - pending.last_request_time >= send_time {
                pending.last_request_time = now;
                let packet_type = match pending.kind {
                    PendingKind::Route => ROUTE_REQUEST_PACKET,
                    PendingKind::Continue => CONTINUE_REQUEST_PACKET,
                };
                events.push(RouteEvent::SendRequest {
                    packet_type,
                    tokens: pending.request_tokens.clone(),
                    to: pending.route.next_address,
                });
            }
        }

        if self.current.is_some() && now >= self.current_expire_time {
            return self.fallback(FALLBACK_FLAG_ROUTE_EXPIRED);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KxKeypair;
    use crate::protocol::tokens::{RouteToken, seal_route_token};

    struct Keys {
        router: KxKeypair,
        route: KxKeypair,
    }

    fn keys() -> Keys {
        Keys { router: KxKeypair::generate(), route: KxKeypair::generate() }
    }

    fn sealed_route_tokens(keys: &Keys, session_version: u8, count: usize) -> Vec<u8> {
        let token = RouteToken {
            expire_timestamp: 2_000_000_000,
            session_id: 0xDEAD,
            session_version,
            kbps_up: 256,
            kbps_down: 256,
            next_address: "10.0.0.1:40001".parse().unwrap(),
            private_key: [0x33; KEY_BYTES],
        };
        let mut out = Vec::new();
        for _ in 0..count {
            out.extend(seal_route_token(&token, [7; 12], &keys.router.secret, &keys.route.public));
        }
        out
    }

    #[test]
    fn test_route_install_and_promote() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let tokens = sealed_route_tokens(&keys, 1, 3);

        let events =
            manager.begin_route(&tokens, 3, &keys.router.public, &keys.route.secret, 0.0, 1_000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RouteEvent::SendRequest { packet_type, tokens: request, to } => {
                assert_eq!(*packet_type, ROUTE_REQUEST_PACKET);
                assert_eq!(request.len(), 2 * ENCRYPTED_ROUTE_TOKEN_BYTES);
                assert_eq!(*to, "10.0.0.1:40001".parse().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(manager.current_route().is_none());
        assert!(manager.pending_route_key().is_some());

        assert!(manager.route_established(1.0));
        let current = manager.current_route().unwrap();
        assert_eq!(current.session_version, 1);
        assert_eq!(current.private_key, [0x33; KEY_BYTES]);
        assert!(manager.pending_route_key().is_none());
    }

    #[test]
    fn test_request_resends_then_times_out() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let tokens = sealed_route_tokens(&keys, 1, 2);
        manager.begin_route(&tokens, 2, &keys.router.public, &keys.route.secret, 0.0, 1_000);

        // Resend after the send interval.
        let events = manager.update(ROUTE_REQUEST_SEND_TIME + 0.01);
        assert!(matches!(events.as_slice(), [RouteEvent::SendRequest { .. }]));

        // Timeout latches fallback.
        let events = manager.update(ROUTE_REQUEST_TIMEOUT + 0.01);
        assert!(matches!(
            events.as_slice(),
            [RouteEvent::FallbackToDirect { flag: FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT }]
        ));
        assert!(manager.fallback_to_direct());
        // Latched: nothing more ever happens.
        assert!(manager.update(100.0).is_empty());
    }

    #[test]
    fn test_newer_session_version_replaces_pending() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let old = sealed_route_tokens(&keys, 5, 1);
        let new = sealed_route_tokens(&keys, 6, 1);
        manager.begin_route(&old, 1, &keys.router.public, &keys.route.secret, 0.0, 1_000);
        let events =
            manager.begin_route(&new, 1, &keys.router.public, &keys.route.secret, 0.5, 1_000);
        assert!(!events.is_empty());
        manager.route_established(1.0);
        assert_eq!(manager.current_route().unwrap().session_version, 6);

        // An older version does not replace pending.
        let stale = sealed_route_tokens(&keys, 4, 1);
        let events =
            manager.begin_route(&stale, 1, &keys.router.public, &keys.route.secret, 1.5, 1_000);
        assert!(events.is_empty());
    }

    #[test]
    fn test_route_expires_without_continue() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let tokens = sealed_route_tokens(&keys, 1, 1);
        manager.begin_route(&tokens, 1, &keys.router.public, &keys.route.secret, 0.0, 1_000);
        manager.route_established(0.5);

        let events = manager.update(0.5 + SLICE_SECONDS * 2.0 + 0.1);
        assert!(matches!(
            events.as_slice(),
            [RouteEvent::FallbackToDirect { flag: FALLBACK_FLAG_ROUTE_EXPIRED }]
        ));
    }

    #[test]
    fn test_continue_extends_route() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let tokens = sealed_route_tokens(&keys, 1, 1);
        manager.begin_route(&tokens, 1, &keys.router.public, &keys.route.secret, 0.0, 1_000);
        manager.route_established(0.0);

        let continue_token = crate::protocol::tokens::ContinueToken {
            expire_timestamp: 2_000_000_000,
            session_id: 0xDEAD,
            session_version: 1,
        };
        let sealed = crate::protocol::tokens::seal_continue_token(
            &continue_token,
            [3; 12],
            &keys.router.secret,
            &keys.route.public,
        );
        let mut array = sealed.clone();
        array.extend(sealed);

        let events =
            manager.begin_continue(&array, 2, &keys.router.public, &keys.route.secret, 5.0, 1_000);
        assert!(matches!(
            events.as_slice(),
            [RouteEvent::SendRequest { packet_type: CONTINUE_REQUEST_PACKET, .. }]
        ));
        assert!(manager.route_continued(5.5));
        // Still alive past the original two-slice expiry.
        assert!(manager.update(SLICE_SECONDS * 2.0 + 1.0).is_empty());
        assert!(manager.current_route().is_some());
    }

    #[test]
    fn test_continue_requires_current_route() {
        let keys = keys();
        let mut manager = RouteManager::new();
        let events =
            manager.begin_continue(&[0u8; 45], 1, &keys.router.public, &keys.route.secret, 0.0, 0);
        assert!(events.is_empty());
    }
}
