// src/protocol/packets.rs

//! Control packet bodies: the upgrade subprotocol, ping/pong, client stats
//! and route updates. Each struct reads and writes the bitpacked stream; the
//! envelope (filters, signature or session encryption) is applied by
//! `protocol::write_*` / `protocol::read_*`.

use crate::address::Address;
use crate::constants::{KEY_BYTES, MAGIC_BYTES, MAX_NEAR_RELAYS};
use crate::utils::binary::{BitReader, BitWriter};
use crate::utils::error::{BinaryError, Result};

pub const UPGRADE_TOKEN_BYTES: usize = 32;
pub const PING_TOKEN_BYTES: usize = 32;

/// Server -> client, signed with the customer private key. Carries everything
/// the client needs to join the overlay: its session id, the server's
/// ephemeral kx public key, and the current magic set (the client has no
/// backend connection of its own).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequestPacket {
    pub protocol_version: u64,
    pub session_id: u64,
    pub server_address: Address,
    pub server_kx_public: [u8; KEY_BYTES],
    pub upgrade_token: [u8; UPGRADE_TOKEN_BYTES],
    pub magic_upcoming: [u8; MAGIC_BYTES],
    pub magic_current: [u8; MAGIC_BYTES],
    pub magic_previous: [u8; MAGIC_BYTES],
}

impl UpgradeRequestPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.protocol_version);
        writer.write_u64(self.session_id);
        writer.write_address(&self.server_address);
        writer.write_bytes(&self.server_kx_public);
        writer.write_bytes(&self.upgrade_token);
        writer.write_bytes(&self.magic_upcoming);
        writer.write_bytes(&self.magic_current);
        writer.write_bytes(&self.magic_previous);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            protocol_version: reader.read_u64()?,
            session_id: reader.read_u64()?,
            server_address: reader.read_address()?,
            server_kx_public: reader.read_fixed()?,
            upgrade_token: reader.read_fixed()?,
            magic_upcoming: reader.read_fixed()?,
            magic_current: reader.read_fixed()?,
            magic_previous: reader.read_fixed()?,
        })
    }
}

/// Client -> server. Echoes the upgrade token and supplies the client's
/// public keys; the token echo is what authenticates this packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponsePacket {
    pub client_kx_public: [u8; KEY_BYTES],
    pub client_route_public: [u8; KEY_BYTES],
    pub upgrade_token: [u8; UPGRADE_TOKEN_BYTES],
    pub open_session_sequence: u8,
    pub platform_id: u8,
    pub connection_type: u8,
}

impl UpgradeResponsePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bytes(&self.client_kx_public);
        writer.write_bytes(&self.client_route_public);
        writer.write_bytes(&self.upgrade_token);
        writer.write_u8(self.open_session_sequence);
        writer.write_u8(self.platform_id);
        writer.write_u8(self.connection_type);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            client_kx_public: reader.read_fixed()?,
            client_route_public: reader.read_fixed()?,
            upgrade_token: reader.read_fixed()?,
            open_session_sequence: reader.read_u8()?,
            platform_id: reader.read_u8()?,
            connection_type: reader.read_u8()?,
        })
    }
}

/// Server -> client, signed. Ends the handshake and tells the client the
/// external address the server sees for it, which the client binds into the
/// packet filters from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeConfirmPacket {
    pub session_id: u64,
    pub client_address: Address,
}

impl UpgradeConfirmPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.session_id);
        writer.write_address(&self.client_address);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self { session_id: reader.read_u64()?, client_address: reader.read_address()? })
    }
}

/// Session-encrypted ping/pong on the direct path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectPingPacket {
    pub ping_sequence: u64,
}

impl DirectPingPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.ping_sequence);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self { ping_sequence: reader.read_u64()? })
    }
}

pub type DirectPongPacket = DirectPingPacket;

/// Client -> relay ping. The ping token is an opaque credential the backend
/// issued for this client/relay pair; the relay validates it before echoing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPingPacket {
    pub ping_token: [u8; PING_TOKEN_BYTES],
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub ping_sequence: u64,
}

impl RelayPingPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bytes(&self.ping_token);
        writer.write_u64(self.expire_timestamp);
        writer.write_u64(self.session_id);
        writer.write_u64(self.ping_sequence);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            ping_token: reader.read_fixed()?,
            expire_timestamp: reader.read_u64()?,
            session_id: reader.read_u64()?,
            ping_sequence: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPongPacket {
    pub session_id: u64,
    pub ping_sequence: u64,
}

impl RelayPongPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.session_id);
        writer.write_u64(self.ping_sequence);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self { session_id: reader.read_u64()?, ping_sequence: reader.read_u64()? })
    }
}

/// One near relay as handed down by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearRelay {
    pub relay_id: u64,
    pub address: Address,
    pub ping_token: [u8; PING_TOKEN_BYTES],
}

pub fn write_near_relays(writer: &mut BitWriter, relays: &[NearRelay]) {
    debug_assert!(relays.len() <= MAX_NEAR_RELAYS);
    writer.write_int(relays.len() as u64, 0, MAX_NEAR_RELAYS as u64);
    for relay in relays {
        writer.write_u64(relay.relay_id);
        writer.write_address(&relay.address);
        writer.write_bytes(&relay.ping_token);
    }
}

pub fn read_near_relays(reader: &mut BitReader) -> Result<Vec<NearRelay>> {
    let count = reader.read_int(0, MAX_NEAR_RELAYS as u64)? as usize;
    let mut relays = Vec::with_capacity(count);
    for _ in 0..count {
        relays.push(NearRelay {
            relay_id: reader.read_u64()?,
            address: reader.read_address()?,
            ping_token: reader.read_fixed()?,
        });
    }
    Ok(relays)
}

/// Per-relay measurement summary reported up to the server and backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearRelayStats {
    pub relay_id: u64,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

pub fn write_near_relay_stats(writer: &mut BitWriter, stats: &[NearRelayStats]) {
    debug_assert!(stats.len() <= MAX_NEAR_RELAYS);
    writer.write_int(stats.len() as u64, 0, MAX_NEAR_RELAYS as u64);
    for entry in stats {
        writer.write_u64(entry.relay_id);
        writer.write_f32(entry.rtt);
        writer.write_f32(entry.jitter);
        writer.write_f32(entry.packet_loss);
    }
}

pub fn read_near_relay_stats(reader: &mut BitReader) -> Result<Vec<NearRelayStats>> {
    let count = reader.read_int(0, MAX_NEAR_RELAYS as u64)? as usize;
    let mut stats = Vec::with_capacity(count);
    for _ in 0..count {
        stats.push(NearRelayStats {
            relay_id: reader.read_u64()?,
            rtt: reader.read_f32()?,
            jitter: reader.read_f32()?,
            packet_loss: reader.read_f32()?,
        });
    }
    Ok(stats)
}

/// Client -> server, session-encrypted, roughly once a second.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientStatsPacket {
    pub flags: u64,
    pub fallback_to_direct: bool,
    pub next_bandwidth_over_limit: bool,
    pub multipath: bool,
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

impl ClientStatsPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.flags);
        writer.write_bool(self.fallback_to_direct);
        writer.write_bool(self.next_bandwidth_over_limit);
        writer.write_bool(self.multipath);
        writer.write_f32(self.direct_rtt);
        writer.write_f32(self.direct_jitter);
        writer.write_f32(self.direct_packet_loss);
        writer.write_f32(self.next_rtt);
        writer.write_f32(self.next_jitter);
        writer.write_f32(self.next_packet_loss);
        writer.write_f32(self.direct_kbps_up);
        writer.write_f32(self.direct_kbps_down);
        writer.write_f32(self.next_kbps_up);
        writer.write_f32(self.next_kbps_down);
        writer.write_u64(self.packets_sent_client_to_server);
        writer.write_u64(self.packets_lost_server_to_client);
        writer.write_u64(self.packets_out_of_order_server_to_client);
        writer.write_f32(self.jitter_server_to_client);
        write_near_relay_stats(writer, &self.near_relays);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            flags: reader.read_u64()?,
            fallback_to_direct: reader.read_bool()?,
            next_bandwidth_over_limit: reader.read_bool()?,
            multipath: reader.read_bool()?,
            direct_rtt: reader.read_f32()?,
            direct_jitter: reader.read_f32()?,
            direct_packet_loss: reader.read_f32()?,
            next_rtt: reader.read_f32()?,
            next_jitter: reader.read_f32()?,
            next_packet_loss: reader.read_f32()?,
            direct_kbps_up: reader.read_f32()?,
            direct_kbps_down: reader.read_f32()?,
            next_kbps_up: reader.read_f32()?,
            next_kbps_down: reader.read_f32()?,
            packets_sent_client_to_server: reader.read_u64()?,
            packets_lost_server_to_client: reader.read_u64()?,
            packets_out_of_order_server_to_client: reader.read_u64()?,
            jitter_server_to_client: reader.read_f32()?,
            near_relays: read_near_relay_stats(reader)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteCommand {
    Direct = 0,
    Route = 1,
    Continue = 2,
}

impl RouteCommand {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RouteCommand::Direct),
            1 => Ok(RouteCommand::Route),
            2 => Ok(RouteCommand::Continue),
            other => {
                Err(BinaryError::ValueOutOfRange { value: other as u64, min: 0, max: 2 })
            }
        }
    }
}

pub const MAX_ROUTE_TOKENS: usize = 8;
pub const MAX_TOKEN_ARRAY_BYTES: usize = 1024;

/// Server -> client, session-encrypted. Forwards the backend's routing
/// decision for the next slice plus the server-side view of the reverse
/// path statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteUpdatePacket {
    pub sequence: u64,
    pub command: RouteCommand,
    pub num_tokens: u8,
    /// Sealed token array, opaque to the client except for the first entry.
    pub tokens: Vec<u8>,
    pub multipath: bool,
    pub near_relays: Vec<NearRelay>,
    pub near_relay_expire_timestamp: u64,
    pub packets_sent_server_to_client: u64,
    pub packets_lost_client_to_server: u64,
    pub packets_out_of_order_client_to_server: u64,
    pub jitter_client_to_server: f32,
}

impl RouteUpdatePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.sequence);
        writer.write_u8(self.command as u8);
        writer.write_u8(self.num_tokens);
        writer.write_int(self.tokens.len() as u64, 0, MAX_TOKEN_ARRAY_BYTES as u64);
        writer.write_bytes(&self.tokens);
        writer.write_bool(self.multipath);
        write_near_relays(writer, &self.near_relays);
        writer.write_u64(self.near_relay_expire_timestamp);
        writer.write_u64(self.packets_sent_server_to_client);
        writer.write_u64(self.packets_lost_client_to_server);
        writer.write_u64(self.packets_out_of_order_client_to_server);
        writer.write_f32(self.jitter_client_to_server);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        let sequence = reader.read_u64()?;
        let command = RouteCommand::from_u8(reader.read_u8()?)?;
        let num_tokens = reader.read_u8()?;
        let token_bytes = reader.read_int(0, MAX_TOKEN_ARRAY_BYTES as u64)? as usize;
        let tokens = reader.read_bytes(token_bytes)?.to_vec();
        Ok(Self {
            sequence,
            command,
            num_tokens,
            tokens,
            multipath: reader.read_bool()?,
            near_relays: read_near_relays(reader)?,
            near_relay_expire_timestamp: reader.read_u64()?,
            packets_sent_server_to_client: reader.read_u64()?,
            packets_lost_client_to_server: reader.read_u64()?,
            packets_out_of_order_client_to_server: reader.read_u64()?,
            jitter_client_to_server: reader.read_f32()?,
        })
    }
}

/// Client -> server, session-encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteUpdateAckPacket {
    pub sequence: u64,
}

impl RouteUpdateAckPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.sequence);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self { sequence: reader.read_u64()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T, W, R>(value: &T, write: W, read: R) -> T
    where
        W: Fn(&T, &mut BitWriter),
        R: Fn(&mut BitReader) -> Result<T>,
    {
        let mut writer = BitWriter::new();
        write(value, &mut writer);
        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        read(&mut reader).unwrap()
    }

    #[test]
    fn test_upgrade_request_round_trip() {
        let packet = UpgradeRequestPacket {
            protocol_version: 5,
            session_id: 0x1234_5678_9ABC_DEF0,
            server_address: "127.0.0.1:32202".parse().unwrap(),
            server_kx_public: [1; 32],
            upgrade_token: [2; 32],
            magic_upcoming: [3; 8],
            magic_current: [4; 8],
            magic_previous: [5; 8],
        };
        assert_eq!(round_trip(&packet, UpgradeRequestPacket::write, UpgradeRequestPacket::read), packet);
    }

    #[test]
    fn test_upgrade_response_round_trip() {
        let packet = UpgradeResponsePacket {
            client_kx_public: [6; 32],
            client_route_public: [7; 32],
            upgrade_token: [8; 32],
            open_session_sequence: 1,
            platform_id: 3,
            connection_type: 1,
        };
        assert_eq!(
            round_trip(&packet, UpgradeResponsePacket::write, UpgradeResponsePacket::read),
            packet
        );
    }

    #[test]
    fn test_client_stats_round_trip() {
        let packet = ClientStatsPacket {
            flags: 0b101,
            fallback_to_direct: false,
            next_bandwidth_over_limit: true,
            multipath: true,
            direct_rtt: 31.5,
            direct_jitter: 2.25,
            direct_packet_loss: 0.01,
            next_rtt: 19.0,
            next_jitter: 0.5,
            next_packet_loss: 0.0,
            direct_kbps_up: 256.0,
            direct_kbps_down: 512.0,
            next_kbps_up: 128.0,
            next_kbps_down: 300.0,
            packets_sent_client_to_server: 10_000,
            packets_lost_server_to_client: 3,
            packets_out_of_order_server_to_client: 1,
            jitter_server_to_client: 0.75,
            near_relays: vec![
                NearRelayStats { relay_id: 1, rtt: 5.0, jitter: 0.1, packet_loss: 0.0 },
                NearRelayStats { relay_id: 2, rtt: 8.0, jitter: 0.4, packet_loss: 0.02 },
            ],
        };
        assert_eq!(round_trip(&packet, ClientStatsPacket::write, ClientStatsPacket::read), packet);
    }

    #[test]
    fn test_route_update_round_trip() {
        let packet = RouteUpdatePacket {
            sequence: 42,
            command: RouteCommand::Route,
            num_tokens: 2,
            tokens: vec![0xAB; 208],
            multipath: false,
            near_relays: vec![NearRelay {
                relay_id: 9,
                address: "10.1.2.3:40000".parse().unwrap(),
                ping_token: [0xCD; 32],
            }],
            near_relay_expire_timestamp: 1_700_000_999,
            packets_sent_server_to_client: 555,
            packets_lost_client_to_server: 2,
            packets_out_of_order_client_to_server: 0,
            jitter_client_to_server: 1.5,
        };
        assert_eq!(round_trip(&packet, RouteUpdatePacket::write, RouteUpdatePacket::read), packet);
    }

    #[test]
    fn test_route_command_rejects_unknown() {
        assert!(RouteCommand::from_u8(3).is_err());
    }
}
