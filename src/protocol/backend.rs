// src/protocol/backend.rs

//! Backend request/response packet bodies. All of these ride inside signed
//! control packets: requests are signed with the customer private key,
//! responses with the backend private key.

use crate::address::Address;
use crate::constants::{
    KEY_BYTES, MAGIC_BYTES, MAX_DATACENTER_NAME_LENGTH, MAX_MATCH_VALUES, MAX_SESSION_DATA_BYTES,
    SIGNATURE_BYTES,
};
use crate::protocol::packets::{NearRelay, NearRelayStats, RouteCommand};
use crate::utils::binary::{BitReader, BitWriter};
use crate::utils::error::{BinaryError, Result};

const MAX_DEBUG_STRING_LENGTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInitRequestPacket {
    pub request_id: u64,
    pub customer_id: u64,
    pub datacenter_id: u64,
    pub datacenter_name: String,
    pub server_address: Address,
    pub sdk_version: u64,
}

impl ServerInitRequestPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.request_id);
        writer.write_u64(self.customer_id);
        writer.write_u64(self.datacenter_id);
        writer.write_string(&self.datacenter_name, MAX_DATACENTER_NAME_LENGTH);
        writer.write_address(&self.server_address);
        writer.write_u64(self.sdk_version);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            request_id: reader.read_u64()?,
            customer_id: reader.read_u64()?,
            datacenter_id: reader.read_u64()?,
            datacenter_name: reader.read_string(MAX_DATACENTER_NAME_LENGTH)?,
            server_address: reader.read_address()?,
            sdk_version: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitResponseCode {
    Ok = 0,
    UnknownCustomer = 1,
    UnknownDatacenter = 2,
    SdkVersionTooOld = 3,
    SignatureCheckFailed = 4,
    CustomerNotActive = 5,
    DatacenterNotEnabled = 6,
}

impl InitResponseCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UnknownCustomer),
            2 => Ok(Self::UnknownDatacenter),
            3 => Ok(Self::SdkVersionTooOld),
            4 => Ok(Self::SignatureCheckFailed),
            5 => Ok(Self::CustomerNotActive),
            6 => Ok(Self::DatacenterNotEnabled),
            other => Err(BinaryError::ValueOutOfRange { value: other as u64, min: 0, max: 6 }),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UnknownCustomer => "unknown customer",
            Self::UnknownDatacenter => "unknown datacenter",
            Self::SdkVersionTooOld => "sdk version too old",
            Self::SignatureCheckFailed => "signature check failed",
            Self::CustomerNotActive => "customer not active",
            Self::DatacenterNotEnabled => "datacenter not enabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInitResponsePacket {
    pub request_id: u64,
    pub response_code: InitResponseCode,
    pub magic_upcoming: [u8; MAGIC_BYTES],
    pub magic_current: [u8; MAGIC_BYTES],
    pub magic_previous: [u8; MAGIC_BYTES],
}

impl ServerInitResponsePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.request_id);
        writer.write_u8(self.response_code as u8);
        writer.write_bytes(&self.magic_upcoming);
        writer.write_bytes(&self.magic_current);
        writer.write_bytes(&self.magic_previous);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            request_id: reader.read_u64()?,
            response_code: InitResponseCode::from_u8(reader.read_u8()?)?,
            magic_upcoming: reader.read_fixed()?,
            magic_current: reader.read_fixed()?,
            magic_previous: reader.read_fixed()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdateRequestPacket {
    pub customer_id: u64,
    pub datacenter_id: u64,
    pub match_id: u64,
    pub num_sessions: u32,
    pub server_address: Address,
}

impl ServerUpdateRequestPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.customer_id);
        writer.write_u64(self.datacenter_id);
        writer.write_u64(self.match_id);
        writer.write_u32(self.num_sessions);
        writer.write_address(&self.server_address);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            customer_id: reader.read_u64()?,
            datacenter_id: reader.read_u64()?,
            match_id: reader.read_u64()?,
            num_sessions: reader.read_u32()?,
            server_address: reader.read_address()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdateResponsePacket {
    pub magic_upcoming: [u8; MAGIC_BYTES],
    pub magic_current: [u8; MAGIC_BYTES],
    pub magic_previous: [u8; MAGIC_BYTES],
}

impl ServerUpdateResponsePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bytes(&self.magic_upcoming);
        writer.write_bytes(&self.magic_current);
        writer.write_bytes(&self.magic_previous);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            magic_upcoming: reader.read_fixed()?,
            magic_current: reader.read_fixed()?,
            magic_previous: reader.read_fixed()?,
        })
    }
}

/// Opaque state blob the backend threads through consecutive session
/// updates, with its own signature the server never inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub data: Vec<u8>,
    pub signature: [u8; SIGNATURE_BYTES],
}

impl Default for SessionData {
    fn default() -> Self {
        Self { data: Vec::new(), signature: [0u8; SIGNATURE_BYTES] }
    }
}

impl SessionData {
    fn write(&self, writer: &mut BitWriter) {
        debug_assert!(self.data.len() <= MAX_SESSION_DATA_BYTES);
        writer.write_int(self.data.len() as u64, 0, MAX_SESSION_DATA_BYTES as u64);
        writer.write_bytes(&self.data);
        if !self.data.is_empty() {
            writer.write_bytes(&self.signature);
        }
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let length = reader.read_int(0, MAX_SESSION_DATA_BYTES as u64)? as usize;
        let data = reader.read_bytes(length)?.to_vec();
        let signature =
            if length > 0 { reader.read_fixed()? } else { [0u8; SIGNATURE_BYTES] };
        Ok(Self { data, signature })
    }
}

/// One slice of per-session telemetry, sent every ten seconds per upgraded
/// session and resent until the backend answers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionUpdateRequestPacket {
    pub customer_id: u64,
    pub datacenter_id: u64,
    pub session_id: u64,
    pub slice_number: u32,
    pub retry_number: u32,
    pub session_data: SessionData,
    pub client_address: Address,
    pub server_address: Address,
    pub client_route_public_key: [u8; KEY_BYTES],
    pub server_route_public_key: [u8; KEY_BYTES],
    pub user_hash: u64,
    pub platform_id: u8,
    pub connection_type: u8,
    pub fallback_to_direct: bool,
    pub client_ping_timed_out: bool,
    pub next_bandwidth_over_limit: bool,
    pub multipath: bool,
    pub fallback_flags: u64,
    pub session_events: u64,
    pub internal_events: u64,
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
    pub packets_sent_server_to_client: u64,
    pub packets_lost_client_to_server: u64,
    pub packets_lost_server_to_client: u64,
    pub packets_out_of_order_client_to_server: u64,
    pub packets_out_of_order_server_to_client: u64,
    pub jitter_client_to_server: f32,
    pub jitter_server_to_client: f32,
    pub near_relays: Vec<NearRelayStats>,
}

impl SessionUpdateRequestPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.customer_id);
        writer.write_u64(self.datacenter_id);
        writer.write_u64(self.session_id);
        writer.write_u32(self.slice_number);
        writer.write_u32(self.retry_number);
        self.session_data.write(writer);
        writer.write_address(&self.client_address);
        writer.write_address(&self.server_address);
        writer.write_bytes(&self.client_route_public_key);
        writer.write_bytes(&self.server_route_public_key);
        writer.write_u64(self.user_hash);
        writer.write_u8(self.platform_id);
        writer.write_u8(self.connection_type);
        writer.write_bool(self.fallback_to_direct);
        writer.write_bool(self.client_ping_timed_out);
        writer.write_bool(self.next_bandwidth_over_limit);
        writer.write_bool(self.multipath);
        writer.write_u64(self.fallback_flags);
        writer.write_u64(self.session_events);
        writer.write_u64(self.internal_events);
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
        writer.write_u64(self.packets_sent_server_to_client);
        writer.write_u64(self.packets_lost_client_to_server);
        writer.write_u64(self.packets_lost_server_to_client);
        writer.write_u64(self.packets_out_of_order_client_to_server);
        writer.write_u64(self.packets_out_of_order_server_to_client);
        writer.write_f32(self.jitter_client_to_server);
        writer.write_f32(self.jitter_server_to_client);
        crate::protocol::packets::write_near_relay_stats(writer, &self.near_relays);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            customer_id: reader.read_u64()?,
            datacenter_id: reader.read_u64()?,
            session_id: reader.read_u64()?,
            slice_number: reader.read_u32()?,
            retry_number: reader.read_u32()?,
            session_data: SessionData::read(reader)?,
            client_address: reader.read_address()?,
            server_address: reader.read_address()?,
            client_route_public_key: reader.read_fixed()?,
            server_route_public_key: reader.read_fixed()?,
            user_hash: reader.read_u64()?,
            platform_id: reader.read_u8()?,
            connection_type: reader.read_u8()?,
            fallback_to_direct: reader.read_bool()?,
            client_ping_timed_out: reader.read_bool()?,
            next_bandwidth_over_limit: reader.read_bool()?,
            multipath: reader.read_bool()?,
            fallback_flags: reader.read_u64()?,
            session_events: reader.read_u64()?,
            internal_events: reader.read_u64()?,
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
            packets_sent_server_to_client: reader.read_u64()?,
            packets_lost_client_to_server: reader.read_u64()?,
            packets_lost_server_to_client: reader.read_u64()?,
            packets_out_of_order_client_to_server: reader.read_u64()?,
            packets_out_of_order_server_to_client: reader.read_u64()?,
            jitter_client_to_server: reader.read_f32()?,
            jitter_server_to_client: reader.read_f32()?,
            near_relays: crate::protocol::packets::read_near_relay_stats(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdateResponsePacket {
    pub session_id: u64,
    pub slice_number: u32,
    pub command: RouteCommand,
    pub num_tokens: u8,
    pub tokens: Vec<u8>,
    pub multipath: bool,
    pub near_relays: Vec<NearRelay>,
    pub near_relay_expire_timestamp: u64,
    pub debug_string: Option<String>,
    pub session_data: SessionData,
}

impl SessionUpdateResponsePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.session_id);
        writer.write_u32(self.slice_number);
        writer.write_u8(self.command as u8);
        writer.write_u8(self.num_tokens);
        writer.write_int(
            self.tokens.len() as u64,
            0,
            crate::protocol::packets::MAX_TOKEN_ARRAY_BYTES as u64,
        );
        writer.write_bytes(&self.tokens);
        writer.write_bool(self.multipath);
        super::packets::write_near_relays(writer, &self.near_relays);
        writer.write_u64(self.near_relay_expire_timestamp);
        match &self.debug_string {
            Some(s) => {
                writer.write_bool(true);
                writer.write_string(s, MAX_DEBUG_STRING_LENGTH);
            }
            None => writer.write_bool(false),
        }
        self.session_data.write(writer);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        let session_id = reader.read_u64()?;
        let slice_number = reader.read_u32()?;
        let command = RouteCommand::from_u8(reader.read_u8()?)?;
        let num_tokens = reader.read_u8()?;
        let token_bytes =
            reader.read_int(0, crate::protocol::packets::MAX_TOKEN_ARRAY_BYTES as u64)? as usize;
        let tokens = reader.read_bytes(token_bytes)?.to_vec();
        let multipath = reader.read_bool()?;
        let near_relays = super::packets::read_near_relays(reader)?;
        let near_relay_expire_timestamp = reader.read_u64()?;
        let debug_string = if reader.read_bool()? {
            Some(reader.read_string(MAX_DEBUG_STRING_LENGTH)?)
        } else {
            None
        };
        Ok(Self {
            session_id,
            slice_number,
            command,
            num_tokens,
            tokens,
            multipath,
            near_relays,
            near_relay_expire_timestamp,
            debug_string,
            session_data: SessionData::read(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDataRequestPacket {
    pub customer_id: u64,
    pub server_address: Address,
    pub session_id: u64,
    pub match_id: u64,
    pub retry_number: u32,
    pub match_values: Vec<f64>,
}

impl MatchDataRequestPacket {
    pub fn write(&self, writer: &mut BitWriter) {
        debug_assert!(self.match_values.len() <= MAX_MATCH_VALUES);
        writer.write_u64(self.customer_id);
        writer.write_address(&self.server_address);
        writer.write_u64(self.session_id);
        writer.write_u64(self.match_id);
        writer.write_u32(self.retry_number);
        writer.write_int(self.match_values.len() as u64, 0, MAX_MATCH_VALUES as u64);
        for value in &self.match_values {
            writer.write_f64(*value);
        }
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        let customer_id = reader.read_u64()?;
        let server_address = reader.read_address()?;
        let session_id = reader.read_u64()?;
        let match_id = reader.read_u64()?;
        let retry_number = reader.read_u32()?;
        let count = reader.read_int(0, MAX_MATCH_VALUES as u64)? as usize;
        let mut match_values = Vec::with_capacity(count);
        for _ in 0..count {
            match_values.push(reader.read_f64()?);
        }
        Ok(Self { customer_id, server_address, session_id, match_id, retry_number, match_values })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchDataResponsePacket {
    pub session_id: u64,
}

impl MatchDataResponsePacket {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u64(self.session_id);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self { session_id: reader.read_u64()? })
    }
}
