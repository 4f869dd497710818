// src/client/client.rs

//! Client runtime.
//!
//! A background task owns the UDP socket: it receives and classifies
//! packets, answers the upgrade handshake, keeps the direct / next / relay
//! ping timelines warm, applies route updates, and reports stats. The
//! application-facing [`Client`] posts commands over a bounded queue and
//! reads notifications back; `send_packet` runs on the caller's thread and
//! only touches a mutex-guarded send snapshot the worker publishes.

use crate::address::Address;
use crate::config::ClientConfig;
use crate::constants::*;
use crate::crypto::{self, KxKeypair, SessionKeys};
use crate::magic::MagicSet;
use crate::protocol::{self, packet_type::*, packets::*};
use crate::replay::ReplayProtection;
use crate::stats::{
    BandwidthLimiter, JitterTracker, OutOfOrderTracker, PacketLossTracker, PingHistory, RouteStats,
};
use crate::utils::binary::{BitReader, BitWriter};
use crate::utils::time::{Clock, unix_time};
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use x25519_dalek::PublicKey;

pub const CLIENT_COUNTER_OPEN_SESSION: usize = 0;
pub const CLIENT_COUNTER_CLOSE_SESSION: usize = 1;
pub const CLIENT_COUNTER_UPGRADED: usize = 2;
pub const CLIENT_COUNTER_FALLBACK_TO_DIRECT: usize = 3;
pub const CLIENT_COUNTER_PACKETS_SENT_PASSTHROUGH: usize = 4;
pub const CLIENT_COUNTER_PACKETS_SENT_DIRECT: usize = 5;
pub const CLIENT_COUNTER_PACKETS_SENT_NEXT: usize = 6;
pub const CLIENT_COUNTER_PACKETS_RECEIVED_PASSTHROUGH: usize = 7;
pub const CLIENT_COUNTER_PACKETS_RECEIVED_DIRECT: usize = 8;
pub const CLIENT_COUNTER_PACKETS_RECEIVED_NEXT: usize = 9;
pub const CLIENT_COUNTER_PACKETS_DROPPED_FILTER: usize = 10;
pub const CLIENT_COUNTER_PACKETS_DROPPED_REPLAY: usize = 11;
pub const CLIENT_COUNTER_ROUTE_UPDATES: usize = 12;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("no session is open")]
    NoSession,

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone)]
pub enum ClientNotify {
    PacketReceived { from: Address, payload: Bytes },
    StatsUpdated(ClientStatsSnapshot),
    MagicUpdated,
    FallbackToDirect { flags: u64 },
}

/// Point-in-time view of session health, refreshed ten times a second.
#[derive(Debug, Clone, Default)]
pub struct ClientStatsSnapshot {
    pub session_id: u64,
    pub upgraded: bool,
    pub fallback_to_direct: bool,
    pub fallback_flags: u64,
    pub multipath: bool,
    pub next: bool,
    pub next_bandwidth_over_limit: bool,
    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,
    pub direct_kbps_up: f32,
    pub direct_kbps_down: f32,
    pub next_kbps_up: f32,
    pub next_kbps_down: f32,
    pub packets_sent_client_to_server: u64,
    pub packets_lost_server_to_client: u64,
    pub packets_out_of_order_server_to_client: u64,
    pub jitter_server_to_client: f32,
    pub near_relays: Vec<NearRelayStats>,
}

enum ClientCommand {
    OpenSession { server_address: Address },
    CloseSession,
    Quit,
}

use super::route_manager::{RouteData, RouteEvent, RouteManager};
use super::relay_manager::RelayManager;

/// Snapshot the user thread reads under the mutex to send a packet. The
/// worker is the sole writer of everything except the send sequence and the
/// bandwidth accounting, which advance on the send path itself.
#[derive(Default)]
struct SendState {
    session_open: bool,
    server_address: Address,
    client_address: Address,
    upgraded: bool,
    fallback_to_direct: bool,
    multipath: bool,
    session_id: u64,
    open_session_sequence: u8,
    send_sequence: u64,
    magic: MagicSet,
    route: Option<RouteData>,
    next_bandwidth_over_limit: bool,
    direct_up: BandwidthLimiter,
    next_up: BandwidthLimiter,
}

struct SharedState {
    send: Mutex<SendState>,
    stats: Mutex<ClientStatsSnapshot>,
    counters: [AtomicU64; CLIENT_COUNTER_MAX],
}

impl SharedState {
    fn bump(&self, counter: usize) {
        self.counters[counter].fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Client {
    socket: Arc<UdpSocket>,
    shared: Arc<SharedState>,
    clock: Clock,
    disabled: bool,
    command_tx: mpsc::Sender<ClientCommand>,
    notify_rx: mpsc::Receiver<ClientNotify>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Bind the overlay socket and start the background worker. `bind_address`
    /// is usually `0.0.0.0:0`.
    pub async fn new(config: ClientConfig, bind_address: &str) -> Result<Self, ClientError> {
        let bind: Address =
            bind_address.parse().map_err(|_| ClientError::BadAddress(bind_address.to_string()))?;
        let bind_sock =
            bind.to_socket_addr().ok_or_else(|| ClientError::BadAddress(bind_address.to_string()))?;
        let socket = Arc::new(UdpSocket::bind(bind_sock).await?);
        info!("client socket bound to {}", socket.local_addr()?);

        let shared = Arc::new(SharedState {
            send: Mutex::new(SendState::default()),
            stats: Mutex::new(ClientStatsSnapshot::default()),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        });
        let clock = Clock::new();
        let disabled = config.disable_network_next;

        let (command_tx, command_rx) = mpsc::channel(256);
        let (notify_tx, notify_rx) = mpsc::channel(4096);

        let worker = ClientWorker {
            socket: socket.clone(),
            shared: shared.clone(),
            config,
            clock,
            notify_tx,
            command_rx,
            session: None,
        };
        let handle = tokio::spawn(worker.run());

        Ok(Self { socket, shared, clock, disabled, command_tx, notify_rx, worker: Some(handle) })
    }

    pub fn open_session(&self, server_address: &str) -> Result<(), ClientError> {
        let address: Address = server_address
            .parse()
            .map_err(|_| ClientError::BadAddress(server_address.to_string()))?;
        if address.to_socket_addr().is_none() || address.port() == 0 {
            return Err(ClientError::BadAddress(server_address.to_string()));
        }
        self.shared.bump(CLIENT_COUNTER_OPEN_SESSION);
        let _ = self.command_tx.try_send(ClientCommand::OpenSession { server_address: address });
        Ok(())
    }

    pub fn close_session(&self) {
        self.shared.bump(CLIENT_COUNTER_CLOSE_SESSION);
        let _ = self.command_tx.try_send(ClientCommand::CloseSession);
    }

    /// Send a payload to the server over the best available path. Falls back
    /// to passthrough whenever the overlay cannot carry it.
    pub fn send_packet(&self, payload: &[u8]) -> Result<(), ClientError> {
        if payload.is_empty() || payload.len() > MAX_PACKET_BYTES - 1 {
            return Err(ClientError::PayloadTooLarge(payload.len()));
        }
        let now = self.clock.now();
        let mut send = self.shared.send.lock().expect("send mutex poisoned");
        if !send.session_open {
            return Err(ClientError::NoSession);
        }
        let server = send.server_address;

        let passthrough = self.disabled
            || !send.upgraded
            || send.fallback_to_direct
            || payload.len() > MTU;
        if passthrough {
            let packet = protocol::write_passthrough_packet(payload);
            self.try_send(&packet, &server);
            self.shared.bump(CLIENT_COUNTER_PACKETS_SENT_PASSTHROUGH);
            return Ok(());
        }

        send.send_sequence += 1;
        let sequence = send.send_sequence;
        let magic = send.magic.current;
        let from = send.client_address;
        let open_session_sequence = send.open_session_sequence;
        let multipath = send.multipath;

        let mut sent_on_next = false;
        if let Some(route) = send.route {
            if !send.next_bandwidth_over_limit {
                let packet_bits = ((payload.len() + HEADER_BYTES + MIN_PACKET_BYTES) * 8) as u64;
                if send.next_up.add_packet(now, packet_bits, route.kbps_up) {
                    send.next_bandwidth_over_limit = true;
                    debug!("next path over bandwidth envelope, sending direct");
                } else if let Ok(packet) = protocol::write_session_packet(
                    CLIENT_TO_SERVER_PACKET,
                    sequence,
                    route.session_id,
                    route.session_version,
                    &route.private_key,
                    payload,
                    &from,
                    &route.next_address,
                    &magic,
                ) {
                    self.try_send(&packet, &route.next_address);
                    self.shared.bump(CLIENT_COUNTER_PACKETS_SENT_NEXT);
                    sent_on_next = true;
                }
            }
        }

        if !sent_on_next || multipath {
            if let Ok(packet) = protocol::write_direct_packet(
                open_session_sequence,
                sequence,
                payload,
                &from,
                &server,
                &magic,
            ) {
                send.direct_up.add_packet_unlimited(now, (packet.len() * 8) as u64);
                self.try_send(&packet, &server);
                self.shared.bump(CLIENT_COUNTER_PACKETS_SENT_DIRECT);
            }
        }
        Ok(())
    }

    fn try_send(&self, packet: &[u8], to: &Address) {
        if let Some(addr) = to.to_socket_addr() {
            if let Err(error) = self.socket.try_send_to(packet, addr) {
                debug!("client send to {to} failed: {error}");
            }
        }
    }

    /// Drain pending notifications. Call once per frame.
    pub fn update(&mut self) -> Vec<ClientNotify> {
        let mut notifications = Vec::new();
        while let Ok(notify) = self.notify_rx.try_recv() {
            notifications.push(notify);
        }
        notifications
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.shared.stats.lock().expect("stats mutex poisoned").clone()
    }

    pub fn session_id(&self) -> u64 {
        self.shared.send.lock().expect("send mutex poisoned").session_id
    }

    pub fn fallback_to_direct(&self) -> bool {
        self.shared.send.lock().expect("send mutex poisoned").fallback_to_direct
    }

    pub fn counters(&self) -> [u64; CLIENT_COUNTER_MAX] {
        std::array::from_fn(|i| self.shared.counters[i].load(Ordering::Relaxed))
    }

    /// Stop the worker and release the socket.
    pub async fn destroy(mut self) {
        let _ = self.command_tx.send(ClientCommand::Quit).await;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct UpgradeResponseResend {
    packet: Vec<u8>,
    first_send_time: f64,
    last_send_time: f64,
}

struct WorkerSession {
    server_address: Address,
    client_address: Address,
    session_id: u64,
    upgraded: bool,
    open_session_sequence: u8,
    kx: KxKeypair,
    route_kx: KxKeypair,
    session_keys: Option<SessionKeys>,
    magic: MagicSet,
    route_manager: RouteManager,
    relay_manager: RelayManager,
    multipath: bool,
    internal_send_sequence: u64,
    special_send_sequence: u64,
    payload_replay: ReplayProtection,
    internal_replay: ReplayProtection,
    direct_ping_history: PingHistory,
    next_ping_history: PingHistory,
    loss_tracker: PacketLossTracker,
    ooo_tracker: OutOfOrderTracker,
    jitter_tracker: JitterTracker,
    direct_down: BandwidthLimiter,
    next_down: BandwidthLimiter,
    last_direct_ping_time: f64,
    last_next_ping_time: f64,
    last_stats_snapshot_time: f64,
    last_stats_packet_time: f64,
    last_direct_pong_time: f64,
    last_next_pong_time: f64,
    last_route_update_time: f64,
    last_route_update_sequence: u64,
    cached_upgrade_token: Option<[u8; UPGRADE_TOKEN_BYTES]>,
    upgrade_response: Option<UpgradeResponseResend>,
}

impl WorkerSession {
    fn new(server_address: Address, open_session_sequence: u8) -> Self {
        Self {
            server_address,
            client_address: Address::None,
            session_id: 0,
            upgraded: false,
            open_session_sequence,
            kx: KxKeypair::generate(),
            route_kx: KxKeypair::generate(),
            session_keys: None,
            magic: MagicSet::default(),
            route_manager: RouteManager::new(),
            relay_manager: RelayManager::new(),
            multipath: false,
            internal_send_sequence: 0,
            special_send_sequence: 0,
            payload_replay: ReplayProtection::new(),
            internal_replay: ReplayProtection::new(),
            direct_ping_history: PingHistory::new(),
            next_ping_history: PingHistory::new(),
            loss_tracker: PacketLossTracker::new(),
            ooo_tracker: OutOfOrderTracker::new(),
            jitter_tracker: JitterTracker::new(),
            direct_down: BandwidthLimiter::new(),
            next_down: BandwidthLimiter::new(),
            last_direct_ping_time: 0.0,
            last_next_ping_time: 0.0,
            last_stats_snapshot_time: 0.0,
            last_stats_packet_time: 0.0,
            last_direct_pong_time: 0.0,
            last_next_pong_time: 0.0,
            last_route_update_time: 0.0,
            last_route_update_sequence: 0,
            cached_upgrade_token: None,
            upgrade_response: None,
        }
    }

    fn next_internal_sequence(&mut self) -> u64 {
        self.internal_send_sequence += 1;
        self.internal_send_sequence
    }

    fn next_special_sequence(&mut self) -> u64 {
        self.special_send_sequence += 1;
        self.special_send_sequence
    }
}

struct ClientWorker {
    socket: Arc<UdpSocket>,
    shared: Arc<SharedState>,
    config: ClientConfig,
    clock: Clock,
    notify_tx: mpsc::Sender<ClientNotify>,
    command_rx: mpsc::Receiver<ClientCommand>,
    session: Option<WorkerSession>,
}

impl ClientWorker {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs_f64(CLIENT_UPDATE_INTERVAL));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buffer = vec![0u8; MAX_PACKET_BYTES];
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = self.clock.now();
                    self.update(now);
                }
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((length, from)) => {
                            let now = self.clock.now();
                            let data = buffer[..length].to_vec();
                            self.process_packet(&data, Address::from(from), now);
                        }
                        Err(error) => {
                            debug!("client socket receive error: {error}");
                        }
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ClientCommand::OpenSession { server_address }) => {
                            self.open_session(server_address);
                        }
                        Some(ClientCommand::CloseSession) => {
                            self.close_session();
                        }
                        Some(ClientCommand::Quit) | None => break,
                    }
                }
            }
        }
        debug!("client worker stopped");
    }

    fn open_session(&mut self, server_address: Address) {
        let open_session_sequence = self
            .session
            .as_ref()
            .map(|s| s.open_session_sequence.wrapping_add(1))
            .unwrap_or(1);
        info!("client opened session to {server_address}");
        self.session = Some(WorkerSession::new(server_address, open_session_sequence));
        self.publish();
    }

    fn close_session(&mut self) {
        if self.session.take().is_some() {
            info!("client closed session");
        }
        self.publish();
    }

    fn notify(&self, notify: ClientNotify) {
        if self.notify_tx.try_send(notify).is_err() {
            debug!("client notify queue full, dropping notification");
        }
    }

    fn send_to(&self, packet: &[u8], to: &Address) {
        if let Some(addr) = to.to_socket_addr() {
            if let Err(error) = self.socket.try_send_to(packet, addr) {
                debug!("client worker send to {to} failed: {error}");
            }
        }
    }

    /// Mirror worker-side session state into the user-thread send snapshot.
    fn publish(&self) {
        let mut send = self.shared.send.lock().expect("send mutex poisoned");
        match &self.session {
            Some(session) => {
                send.session_open = true;
                send.server_address = session.server_address;
                send.client_address = session.client_address;
                send.upgraded = session.upgraded;
                send.fallback_to_direct = session.route_manager.fallback_to_direct();
                send.multipath = session.multipath;
                send.session_id = session.session_id;
                send.open_session_sequence = session.open_session_sequence;
                send.magic = session.magic;
                send.route = session.route_manager.current_route().copied();
            }
            None => {
                let send_sequence = send.send_sequence;
                *send = SendState { send_sequence, ..SendState::default() };
            }
        }
    }

    // -- inbound ---------------------------------------------------------

    fn process_packet(&mut self, data: &[u8], from: Address, now: f64) {
        if data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return;
        }

        if data[0] == PASSTHROUGH_PACKET {
            self.shared.bump(CLIENT_COUNTER_PACKETS_RECEIVED_PASSTHROUGH);
            self.notify(ClientNotify::PacketReceived {
                from,
                payload: Bytes::copy_from_slice(&data[1..]),
            });
            return;
        }

        let Some(session) = &self.session else {
            return;
        };
        let magic = session.magic;
        let to = session.client_address;
        if !protocol::accept_inbound(data, &magic, &from, &to) {
            self.shared.bump(CLIENT_COUNTER_PACKETS_DROPPED_FILTER);
            debug!("client dropped packet type {} from {from}: filters", name(data[0]));
            return;
        }

        match data[0] {
            UPGRADE_REQUEST_PACKET => self.handle_upgrade_request(data, from, now),
            UPGRADE_CONFIRM_PACKET => self.handle_upgrade_confirm(data, from, now),
            DIRECT_PACKET => self.handle_direct_packet(data, from, now),
            SERVER_TO_CLIENT_PACKET => self.handle_server_to_client(data, from, now),
            SESSION_PONG_PACKET => self.handle_session_pong(data, now),
            ROUTE_RESPONSE_PACKET => self.handle_route_response(data, now),
            CONTINUE_RESPONSE_PACKET => self.handle_continue_response(data, now),
            DIRECT_PONG_PACKET => self.handle_direct_pong(data, now),
            ROUTE_UPDATE_PACKET => self.handle_route_update(data, now),
            RELAY_PONG_PACKET => self.handle_relay_pong(data, from, now),
            other => {
                debug!("client ignored packet type {} from {from}", name(other));
            }
        }
    }

    fn handle_upgrade_request(&mut self, data: &[u8], from: Address, now: f64) {
        let Some(verify_key) = self.config.customer_public_key.as_ref().map(|k| k.key) else {
            debug!("ignoring upgrade request: no customer public key configured");
            return;
        };
        let Some(session) = &mut self.session else { return };
        if from != session.server_address {
            debug!("ignoring upgrade request from {from}: not the session server");
            return;
        }
        if session.route_manager.fallback_to_direct() {
            return;
        }
        let Ok(body) = protocol::read_control_packet(data, Some(&verify_key)) else {
            debug!("upgrade request signature check failed");
            return;
        };
        let mut reader = BitReader::new(body);
        let Ok(request) = UpgradeRequestPacket::read(&mut reader) else {
            debug!("malformed upgrade request");
            return;
        };
        if request.protocol_version != PROTOCOL_VERSION {
            warn!("upgrade request with protocol version {}", request.protocol_version);
            return;
        }

        // A resent request for the same token keeps the same keypairs so the
        // handshake cannot diverge; a new token starts fresh.
        if session.cached_upgrade_token != Some(request.upgrade_token) {
            session.kx = KxKeypair::generate();
            session.route_kx = KxKeypair::generate();
            session.cached_upgrade_token = Some(request.upgrade_token);
            session.upgrade_response = None;
        }
        session.session_id = request.session_id;
        let magic_changed = session.magic.apply(
            request.magic_upcoming,
            request.magic_current,
            request.magic_previous,
        );
        let server_kx_public = PublicKey::from(request.server_kx_public);
        session.session_keys = Some(crypto::derive_session_keys(
            &session.kx.secret,
            &server_kx_public,
            &session.kx.public,
            &server_kx_public,
        ));

        let response = UpgradeResponsePacket {
            client_kx_public: *session.kx.public.as_bytes(),
            client_route_public: *session.route_kx.public.as_bytes(),
            upgrade_token: request.upgrade_token,
            open_session_sequence: session.open_session_sequence,
            platform_id: 0,
            connection_type: 0,
        };
        let mut writer = BitWriter::new();
        response.write(&mut writer);
        let body = writer.finish();
        match protocol::write_control_packet(
            UPGRADE_RESPONSE_PACKET,
            &body,
            &Address::None,
            &session.server_address,
            &session.magic.current,
            None,
        ) {
            Ok(packet) => {
                self.send_to(&packet, &from);
                if let Some(session) = &mut self.session {
                    if let Some(resend) = &mut session.upgrade_response {
                        resend.last_send_time = now;
                    } else {
                        session.upgrade_response = Some(UpgradeResponseResend {
                            packet,
                            first_send_time: now,
                            last_send_time: now,
                        });
                    }
                }
            }
            Err(error) => error!("failed to write upgrade response: {error}"),
        }
        if magic_changed {
            self.publish();
            self.notify(ClientNotify::MagicUpdated);
        }
    }

    fn handle_upgrade_confirm(&mut self, data: &[u8], from: Address, now: f64) {
        let Some(verify_key) = self.config.customer_public_key.as_ref().map(|k| k.key) else {
            return;
        };
        let Some(session) = &mut self.session else { return };
        if from != session.server_address || session.session_id == 0 {
            return;
        }
        let Ok(body) = protocol::read_control_packet(data, Some(&verify_key)) else {
            debug!("upgrade confirm signature check failed");
            return;
        };
        let mut reader = BitReader::new(body);
        let Ok(confirm) = UpgradeConfirmPacket::read(&mut reader) else {
            return;
        };
        if confirm.session_id != session.session_id {
            return;
        }
        if !session.upgraded {
            session.upgraded = true;
            session.client_address = confirm.client_address;
            session.upgrade_response = None;
            session.last_direct_pong_time = now;
            session.last_route_update_time = now;
            info!(
                "client session {:016x} upgraded, external address {}",
                session.session_id, session.client_address
            );
            self.shared.bump(CLIENT_COUNTER_UPGRADED);
            self.publish();
        }
    }

    fn handle_direct_packet(&mut self, data: &[u8], from: Address, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded || from != session.server_address {
            return;
        }
        let Ok(direct) = protocol::read_direct_packet(data) else { return };
        if direct.open_session_sequence != session.open_session_sequence {
            debug!("direct packet with stale open session sequence");
            return;
        }
        if session.payload_replay.already_received(direct.send_sequence) {
            self.shared.bump(CLIENT_COUNTER_PACKETS_DROPPED_REPLAY);
            return;
        }
        session.loss_tracker.packet_received(direct.send_sequence);
        session.ooo_tracker.packet_received(direct.send_sequence);
        session.jitter_tracker.packet_received(now);
        session.direct_down.add_packet_unlimited(now, (data.len() * 8) as u64);
        let payload = Bytes::copy_from_slice(direct.payload);
        session.payload_replay.advance(direct.send_sequence);
        self.shared.bump(CLIENT_COUNTER_PACKETS_RECEIVED_DIRECT);
        self.notify(ClientNotify::PacketReceived { from, payload });
    }

    fn handle_server_to_client(&mut self, data: &[u8], _from: Address, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded {
            return;
        }
        // Packets over the overlay authenticate under the current route key,
        // or briefly under the previous one right after a route switch.
        let keys: Vec<[u8; KEY_BYTES]> = session
            .route_manager
            .current_route()
            .map(|r| r.private_key)
            .into_iter()
            .chain(session.route_manager.previous_route().map(|r| r.private_key))
            .collect();
        for key in keys {
            if let Ok((header, payload)) = protocol::read_session_packet(data, &key) {
                if header.session_id != session.session_id {
                    return;
                }
                if session.payload_replay.already_received(header.sequence) {
                    self.shared.bump(CLIENT_COUNTER_PACKETS_DROPPED_REPLAY);
                    return;
                }
                session.loss_tracker.packet_received(header.sequence);
                session.ooo_tracker.packet_received(header.sequence);
                session.jitter_tracker.packet_received(now);
                session.next_down.add_packet_unlimited(now, (data.len() * 8) as u64);
                let payload = Bytes::copy_from_slice(payload);
                session.payload_replay.advance(header.sequence);
                self.shared.bump(CLIENT_COUNTER_PACKETS_RECEIVED_NEXT);
                let from = session.server_address;
                self.notify(ClientNotify::PacketReceived { from, payload });
                return;
            }
        }
        debug!("server to client packet did not verify under any route key");
    }

    fn handle_session_pong(&mut self, data: &[u8], now: f64) {
        let Some(session) = &mut self.session else { return };
        let Some(route) = session.route_manager.current_route() else { return };
        let key = route.private_key;
        let Ok((header, payload)) = protocol::read_session_packet(data, &key) else {
            return;
        };
        if header.session_id != session.session_id || payload.len() != 8 {
            return;
        }
        let ping_sequence = u64::from_le_bytes(payload.try_into().unwrap());
        session.next_ping_history.pong_received(ping_sequence, now);
        session.last_next_pong_time = now;
    }

    fn handle_route_response(&mut self, data: &[u8], now: f64) {
        let Some(session) = &mut self.session else { return };
        let Some(key) = session.route_manager.pending_route_key() else { return };
        let Ok((header, _)) = protocol::read_session_packet(data, &key) else {
            debug!("route response did not verify under pending key");
            return;
        };
        if header.session_id != session.session_id {
            return;
        }
        if session.route_manager.route_established(now) {
            session.last_next_pong_time = now;
            self.publish();
        }
    }

    fn handle_continue_response(&mut self, data: &[u8], now: f64) {
        let Some(session) = &mut self.session else { return };
        let Some(route) = session.route_manager.current_route() else { return };
        let key = route.private_key;
        let Ok((header, _)) = protocol::read_session_packet(data, &key) else {
            return;
        };
        if header.session_id != session.session_id {
            return;
        }
        session.route_manager.route_continued(now);
    }

    fn handle_direct_pong(&mut self, data: &[u8], now: f64) {
        let Some(session) = &mut self.session else { return };
        let Some(keys) = session.session_keys else { return };
        match protocol::read_encrypted_packet(data, &keys.server_to_client, &session.internal_replay)
        {
            Ok((sequence, body)) => {
                let mut reader = BitReader::new(&body);
                if let Ok(pong) = DirectPongPacket::read(&mut reader) {
                    session.direct_ping_history.pong_received(pong.ping_sequence, now);
                    session.last_direct_pong_time = now;
                }
                session.internal_replay.advance(sequence);
            }
            Err(protocol::PacketError::Replay) => {
                self.shared.bump(CLIENT_COUNTER_PACKETS_DROPPED_REPLAY);
            }
            Err(_) => {}
        }
    }

    fn handle_route_update(&mut self, data: &[u8], now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded {
            return;
        }
        let Some(keys) = session.session_keys else { return };
        let (sequence, body) = match protocol::read_encrypted_packet(
            data,
            &keys.server_to_client,
            &session.internal_replay,
        ) {
            Ok(result) => result,
            Err(protocol::PacketError::Replay) => {
                self.shared.bump(CLIENT_COUNTER_PACKETS_DROPPED_REPLAY);
                return;
            }
            Err(_) => return,
        };
        let mut reader = BitReader::new(&body);
        let Ok(update) = RouteUpdatePacket::read(&mut reader) else {
            debug!("malformed route update");
            return;
        };
        session.internal_replay.advance(sequence);

        if update.sequence < session.last_route_update_sequence {
            return;
        }
        let is_new = update.sequence > session.last_route_update_sequence;
        session.last_route_update_sequence = update.sequence;
        session.last_route_update_time = now;

        if is_new {
            self.shared.bump(CLIENT_COUNTER_ROUTE_UPDATES);
            session.multipath = update.multipath;
            session.relay_manager.update_relays(
                &update.near_relays,
                update.near_relay_expire_timestamp,
                now,
            );
            let router_public = self.config.router_public_key;
            let events = match update.command {
                RouteCommand::Direct => {
                    session.route_manager.direct();
                    Vec::new()
                }
                RouteCommand::Route => session.route_manager.begin_route(
                    &update.tokens,
                    update.num_tokens,
                    &router_public,
                    &session.route_kx.secret,
                    now,
                    unix_time(),
                ),
                RouteCommand::Continue => session.route_manager.begin_continue(
                    &update.tokens,
                    update.num_tokens,
                    &router_public,
                    &session.route_kx.secret,
                    now,
                    unix_time(),
                ),
            };
            self.apply_route_events(events, now);
        }

        // Always ack, including duplicates, or the server keeps resending.
        self.send_route_update_ack(update.sequence, now);
        self.publish();
    }

    fn send_route_update_ack(&mut self, ack_sequence: u64, _now: f64) {
        let Some(session) = &mut self.session else { return };
        let Some(keys) = session.session_keys else { return };
        let ack = RouteUpdateAckPacket { sequence: ack_sequence };
        let mut writer = BitWriter::new();
        ack.write(&mut writer);
        let body = writer.finish();
        let sequence = session.next_internal_sequence();
        let from = session.client_address;
        let to = session.server_address;
        let magic = session.magic.current;
        if let Ok(packet) = protocol::write_encrypted_packet(
            ROUTE_UPDATE_ACK_PACKET,
            sequence,
            &body,
            &keys.client_to_server,
            &from,
            &to,
            &magic,
        ) {
            self.send_to(&packet, &to);
        }
    }

    fn handle_relay_pong(&mut self, data: &[u8], from: Address, now: f64) {
        let Some(session) = &mut self.session else { return };
        let Ok(body) = protocol::read_control_packet(data, None) else { return };
        let mut reader = BitReader::new(body);
        let Ok(pong) = RelayPongPacket::read(&mut reader) else { return };
        if pong.session_id != session.session_id {
            return;
        }
        session.relay_manager.pong_received(&from, pong.ping_sequence, now);
    }

    fn apply_route_events(&mut self, events: Vec<RouteEvent>, now: f64) {
        for event in events {
            match event {
                RouteEvent::SendRequest { packet_type, tokens, to } => {
                    let Some(session) = &self.session else { continue };
                    let from = session.client_address;
                    let magic = session.magic.current;
                    match protocol::write_token_request_packet(
                        packet_type,
                        &tokens,
                        &from,
                        &to,
                        &magic,
                    ) {
                        Ok(packet) => self.send_to(&packet, &to),
                        Err(error) => debug!("failed to write route request: {error}"),
                    }
                }
                RouteEvent::FallbackToDirect { flag } => {
                    self.on_fallback(flag, now);
                }
            }
        }
    }

    fn on_fallback(&mut self, _flag: u64, _now: f64) {
        let Some(session) = &self.session else { return };
        let flags = session.route_manager.fallback_flags();
        self.shared.bump(CLIENT_COUNTER_FALLBACK_TO_DIRECT);
        self.publish();
        self.notify(ClientNotify::FallbackToDirect { flags });
    }

    // -- timers ----------------------------------------------------------

    fn update(&mut self, now: f64) {
        if self.session.is_none() {
            return;
        }
        self.update_upgrade_response(now);
        self.update_direct_pings(now);
        self.update_next_pings(now);
        self.update_relay_pings(now);
        self.update_route_manager(now);
        self.update_stats(now);
    }

    fn update_upgrade_response(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if session.upgraded {
            return;
        }
        let Some(resend) = &mut session.upgrade_response else { return };
        if now - resend.first_send_time > UPGRADE_TIMEOUT {
            warn!("upgrade response timed out");
            session.upgrade_response = None;
            session.session_id = 0;
            session.session_keys = None;
            let events =
                session.route_manager.force_fallback(FALLBACK_FLAG_UPGRADE_RESPONSE_TIMED_OUT);
            self.apply_route_events(events, now);
            return;
        }
        if now - resend.last_send_time >= UPGRADE_RESPONSE_RESEND_TIME {
            resend.last_send_time = now;
            let packet = resend.packet.clone();
            let to = session.server_address;
            self.send_to(&packet, &to);
        }
    }

    fn update_direct_pings(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded || session.route_manager.fallback_to_direct() {
            return;
        }
        let Some(keys) = session.session_keys else { return };

        if now - session.last_direct_pong_time > CLIENT_SESSION_TIMEOUT {
            let events = session.route_manager.force_fallback(FALLBACK_FLAG_DIRECT_PONG_TIMED_OUT);
            self.apply_route_events(events, now);
            return;
        }

        if now - session.last_direct_ping_time >= 1.0 / DIRECT_PINGS_PER_SECOND {
            session.last_direct_ping_time = now;
            let ping_sequence = session.direct_ping_history.ping_sent(now);
            let ping = DirectPingPacket { ping_sequence };
            let mut writer = BitWriter::new();
            ping.write(&mut writer);
            let body = writer.finish();
            let sequence = session.next_internal_sequence();
            let from = session.client_address;
            let to = session.server_address;
            let magic = session.magic.current;
            if let Ok(packet) = protocol::write_encrypted_packet(
                DIRECT_PING_PACKET,
                sequence,
                &body,
                &keys.client_to_server,
                &from,
                &to,
                &magic,
            ) {
                self.send_to(&packet, &to);
            }
        }
    }

    fn update_next_pings(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded {
            return;
        }
        let Some(route) = session.route_manager.current_route().copied() else { return };

        if now - session.last_next_pong_time > CLIENT_SESSION_TIMEOUT {
            let events = session.route_manager.force_fallback(FALLBACK_FLAG_NEXT_PONG_TIMED_OUT);
            self.apply_route_events(events, now);
            return;
        }

        if now - session.last_next_ping_time >= 1.0 / NEXT_PINGS_PER_SECOND {
            session.last_next_ping_time = now;
            let ping_sequence = session.next_ping_history.ping_sent(now);
            let sequence = session.next_special_sequence();
            let from = session.client_address;
            let magic = session.magic.current;
            if let Ok(packet) = protocol::write_session_packet(
                SESSION_PING_PACKET,
                sequence,
                route.session_id,
                route.session_version,
                &route.private_key,
                &ping_sequence.to_le_bytes(),
                &from,
                &route.next_address,
                &magic,
            ) {
                self.send_to(&packet, &route.next_address);
            }
        }
    }

    fn update_relay_pings(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded || session.route_manager.fallback_to_direct() {
            return;
        }
        let session_id = session.session_id;
        let from = session.client_address;
        let magic = session.magic.current;
        let pings = session.relay_manager.pings_to_send(now, unix_time());
        for ping in pings {
            let packet = RelayPingPacket {
                ping_token: ping.ping_token,
                expire_timestamp: ping.expire_timestamp,
                session_id,
                ping_sequence: ping.sequence,
            };
            let mut writer = BitWriter::new();
            packet.write(&mut writer);
            let body = writer.finish();
            match protocol::write_control_packet(
                RELAY_PING_PACKET,
                &body,
                &from,
                &ping.address,
                &magic,
                None,
            ) {
                Ok(bytes) => self.send_to(&bytes, &ping.address),
                Err(error) => debug!("failed to write relay ping: {error}"),
            }
        }
    }

    fn update_route_manager(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if !session.upgraded {
            return;
        }
        // No route update across a whole route timeout means the server is
        // not steering this session any more.
        if !session.route_manager.fallback_to_direct()
            && now - session.last_route_update_time > CLIENT_ROUTE_TIMEOUT
        {
            let events =
                session.route_manager.force_fallback(FALLBACK_FLAG_ROUTE_UPDATE_TIMED_OUT);
            self.apply_route_events(events, now);
            return;
        }
        let events = session.route_manager.update(now);
        self.apply_route_events(events, now);
    }

    fn update_stats(&mut self, now: f64) {
        let Some(session) = &mut self.session else { return };
        if now - session.last_stats_snapshot_time < 1.0 / CLIENT_STATS_UPDATES_PER_SECOND {
            return;
        }
        session.last_stats_snapshot_time = now;
        session.loss_tracker.update();

        let window = 10.0;
        let safety = 1.0 / DIRECT_PINGS_PER_SECOND + 1.0;
        let direct = RouteStats::from_ping_history(
            &session.direct_ping_history,
            now - window,
            now,
            safety,
        );
        let has_route = session.route_manager.current_route().is_some();
        let next = if has_route {
            RouteStats::from_ping_history(&session.next_ping_history, now - window, now, safety)
        } else {
            RouteStats::default()
        };

        let (send_sequence, direct_up_kbps, next_up_kbps, over_limit) = {
            let send = self.shared.send.lock().expect("send mutex poisoned");
            (
                send.send_sequence,
                send.direct_up.average_kbps() as f32,
                send.next_up.average_kbps() as f32,
                send.next_bandwidth_over_limit,
            )
        };

        let snapshot = ClientStatsSnapshot {
            session_id: session.session_id,
            upgraded: session.upgraded,
            fallback_to_direct: session.route_manager.fallback_to_direct(),
            fallback_flags: session.route_manager.fallback_flags(),
            multipath: session.multipath,
            next: has_route,
            next_bandwidth_over_limit: over_limit,
            direct_rtt: direct.rtt,
            direct_jitter: direct.jitter,
            direct_packet_loss: direct.packet_loss,
            next_rtt: next.rtt,
            next_jitter: next.jitter,
            next_packet_loss: next.packet_loss,
            direct_kbps_up: direct_up_kbps,
            direct_kbps_down: session.direct_down.average_kbps() as f32,
            next_kbps_up: next_up_kbps,
            next_kbps_down: session.next_down.average_kbps() as f32,
            packets_sent_client_to_server: send_sequence,
            packets_lost_server_to_client: session.loss_tracker.packets_lost(),
            packets_out_of_order_server_to_client: session.ooo_tracker.packets_out_of_order(),
            jitter_server_to_client: session.jitter_tracker.jitter() as f32,
            near_relays: session.relay_manager.stats(now),
        };
        *self.shared.stats.lock().expect("stats mutex poisoned") = snapshot.clone();

        // Roughly once a second the same view goes to the server.
        if session.upgraded
            && !session.route_manager.fallback_to_direct()
            && now - session.last_stats_packet_time >= SECONDS_BETWEEN_CLIENT_STATS_PACKETS
        {
            session.last_stats_packet_time = now;
            if let Some(keys) = session.session_keys {
                let stats = ClientStatsPacket {
                    flags: snapshot.fallback_flags,
                    fallback_to_direct: snapshot.fallback_to_direct,
                    next_bandwidth_over_limit: snapshot.next_bandwidth_over_limit,
                    multipath: snapshot.multipath,
                    direct_rtt: snapshot.direct_rtt,
                    direct_jitter: snapshot.direct_jitter,
                    direct_packet_loss: snapshot.direct_packet_loss,
                    next_rtt: snapshot.next_rtt,
                    next_jitter: snapshot.next_jitter,
                    next_packet_loss: snapshot.next_packet_loss,
                    direct_kbps_up: snapshot.direct_kbps_up,
                    direct_kbps_down: snapshot.direct_kbps_down,
                    next_kbps_up: snapshot.next_kbps_up,
                    next_kbps_down: snapshot.next_kbps_down,
                    packets_sent_client_to_server: snapshot.packets_sent_client_to_server,
                    packets_lost_server_to_client: snapshot.packets_lost_server_to_client,
                    packets_out_of_order_server_to_client: snapshot
                        .packets_out_of_order_server_to_client,
                    jitter_server_to_client: snapshot.jitter_server_to_client,
                    near_relays: snapshot.near_relays.clone(),
                };
                let mut writer = BitWriter::new();
                stats.write(&mut writer);
                let body = writer.finish();
                let sequence = session.next_internal_sequence();
                let from = session.client_address;
                let to = session.server_address;
                let magic = session.magic.current;
                if let Ok(packet) = protocol::write_encrypted_packet(
                    CLIENT_STATS_PACKET,
                    sequence,
                    &body,
                    &keys.client_to_server,
                    &from,
                    &to,
                    &magic,
                ) {
                    self.send_to(&packet, &to);
                }
            }
        }

        self.notify(ClientNotify::StatsUpdated(snapshot));
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_pair() -> (Client, UdpSocket, String) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
        let client = Client::new(ClientConfig::default(), "127.0.0.1:0").await.unwrap();
        (client, server, server_addr)
    }

    #[tokio::test]
    async fn test_send_before_upgrade_is_passthrough() {
        let (client, server, server_addr) = bound_pair().await;
        client.open_session(&server_addr).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let payload = [0xAA; 64];
        client.send_packet(&payload).unwrap();

        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let (length, _) =
            tokio::time::timeout(Duration::from_secs(1), server.recv_from(&mut buffer))
                .await
                .expect("timed out")
                .unwrap();
        assert_eq!(buffer[0], PASSTHROUGH_PACKET);
        assert_eq!(&buffer[1..length], &payload);
        assert_eq!(client.counters()[CLIENT_COUNTER_PACKETS_SENT_PASSTHROUGH], 1);
        client.destroy().await;
    }

    #[tokio::test]
    async fn test_passthrough_delivery_to_user() {
        let (mut client, server, server_addr) = bound_pair().await;
        client.open_session(&server_addr).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The server answers with a passthrough packet of its own.
        client.send_packet(&[1, 2, 3]).unwrap();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let (_, from) = server.recv_from(&mut buffer).await.unwrap();
        let reply = protocol::write_passthrough_packet(&[9, 8, 7]);
        server.send_to(&reply, from).await.unwrap();

        let mut delivered = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for notify in client.update() {
                if let ClientNotify::PacketReceived { payload, .. } = notify {
                    delivered = Some(payload);
                }
            }
            if delivered.is_some() {
                break;
            }
        }
        assert_eq!(delivered.expect("no payload delivered").as_ref(), &[9, 8, 7]);
        client.destroy().await;
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let client = Client::new(ClientConfig::default(), "127.0.0.1:0").await.unwrap();
        assert!(matches!(client.send_packet(&[1]), Err(ClientError::NoSession)));
        client.destroy().await;
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let client = Client::new(ClientConfig::default(), "127.0.0.1:0").await.unwrap();
        let huge = vec![0u8; MAX_PACKET_BYTES];
        assert!(matches!(client.send_packet(&huge), Err(ClientError::PayloadTooLarge(_))));
        client.destroy().await;
    }

    #[tokio::test]
    async fn test_open_session_rejects_bad_address() {
        let client = Client::new(ClientConfig::default(), "127.0.0.1:0").await.unwrap();
        assert!(client.open_session("not an address").is_err());
        assert!(client.open_session("1.2.3.4").is_err()); // port required
        client.destroy().await;
    }
}
