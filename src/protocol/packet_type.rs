// src/protocol/packet_type.rs

//! Central list of wire packet type ids, plus the signed / encrypted type
//! tables the codec consults.

use once_cell::sync::Lazy;

pub const PASSTHROUGH_PACKET: u8 = 0;
pub const DIRECT_PACKET: u8 = 1;
pub const ROUTE_REQUEST_PACKET: u8 = 2;
pub const ROUTE_RESPONSE_PACKET: u8 = 3;
pub const CONTINUE_REQUEST_PACKET: u8 = 4;
pub const CONTINUE_RESPONSE_PACKET: u8 = 5;
pub const CLIENT_TO_SERVER_PACKET: u8 = 6;
pub const SERVER_TO_CLIENT_PACKET: u8 = 7;
pub const SESSION_PING_PACKET: u8 = 8;
pub const SESSION_PONG_PACKET: u8 = 9;
pub const RELAY_PING_PACKET: u8 = 10;
pub const RELAY_PONG_PACKET: u8 = 11;
pub const UPGRADE_REQUEST_PACKET: u8 = 12;
pub const UPGRADE_RESPONSE_PACKET: u8 = 13;
pub const UPGRADE_CONFIRM_PACKET: u8 = 14;
pub const DIRECT_PING_PACKET: u8 = 15;
pub const DIRECT_PONG_PACKET: u8 = 16;
pub const CLIENT_STATS_PACKET: u8 = 17;
pub const ROUTE_UPDATE_PACKET: u8 = 18;
pub const ROUTE_UPDATE_ACK_PACKET: u8 = 19;

pub const BACKEND_SERVER_INIT_REQUEST_PACKET: u8 = 50;
pub const BACKEND_SERVER_INIT_RESPONSE_PACKET: u8 = 51;
pub const BACKEND_SERVER_UPDATE_REQUEST_PACKET: u8 = 52;
pub const BACKEND_SERVER_UPDATE_RESPONSE_PACKET: u8 = 53;
pub const BACKEND_SESSION_UPDATE_REQUEST_PACKET: u8 = 54;
pub const BACKEND_SESSION_UPDATE_RESPONSE_PACKET: u8 = 55;
pub const BACKEND_MATCH_DATA_REQUEST_PACKET: u8 = 56;
pub const BACKEND_MATCH_DATA_RESPONSE_PACKET: u8 = 57;

/// Highest valid non-passthrough type.
pub const MAX_PACKET_TYPE: u8 = 0x63;

/// Packet types carrying an Ed25519 signature over `type || body`.
///
/// Server-originated upgrade packets and everything to or from the backend.
/// The upgrade response is the one upgrade packet not in this table: the
/// client holds only the customer public key, so it authenticates by echoing
/// the upgrade token instead.
static SIGNED_PACKETS: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    table[UPGRADE_REQUEST_PACKET as usize] = true;
    table[UPGRADE_CONFIRM_PACKET as usize] = true;
    table[BACKEND_SERVER_INIT_REQUEST_PACKET as usize] = true;
    table[BACKEND_SERVER_INIT_RESPONSE_PACKET as usize] = true;
    table[BACKEND_SERVER_UPDATE_REQUEST_PACKET as usize] = true;
    table[BACKEND_SERVER_UPDATE_RESPONSE_PACKET as usize] = true;
    table[BACKEND_SESSION_UPDATE_REQUEST_PACKET as usize] = true;
    table[BACKEND_SESSION_UPDATE_RESPONSE_PACKET as usize] = true;
    table[BACKEND_MATCH_DATA_REQUEST_PACKET as usize] = true;
    table[BACKEND_MATCH_DATA_RESPONSE_PACKET as usize] = true;
    table
});

/// Packet types encrypted with the session key and an 8-byte sequence nonce.
static ENCRYPTED_PACKETS: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    table[DIRECT_PING_PACKET as usize] = true;
    table[DIRECT_PONG_PACKET as usize] = true;
    table[CLIENT_STATS_PACKET as usize] = true;
    table[ROUTE_UPDATE_PACKET as usize] = true;
    table[ROUTE_UPDATE_ACK_PACKET as usize] = true;
    table
});

pub fn is_signed(packet_type: u8) -> bool {
    SIGNED_PACKETS[packet_type as usize]
}

pub fn is_encrypted(packet_type: u8) -> bool {
    ENCRYPTED_PACKETS[packet_type as usize]
}

/// Session-header packets: the 33-byte header follows the chonkle.
pub fn has_session_header(packet_type: u8) -> bool {
    matches!(
        packet_type,
        CLIENT_TO_SERVER_PACKET
            | SERVER_TO_CLIENT_PACKET
            | SESSION_PING_PACKET
            | SESSION_PONG_PACKET
            | ROUTE_RESPONSE_PACKET
            | CONTINUE_RESPONSE_PACKET
    )
}

pub fn name(packet_type: u8) -> &'static str {
    match packet_type {
        PASSTHROUGH_PACKET => "passthrough",
        DIRECT_PACKET => "direct",
        ROUTE_REQUEST_PACKET => "route request",
        ROUTE_RESPONSE_PACKET => "route response",
        CONTINUE_REQUEST_PACKET => "continue request",
        CONTINUE_RESPONSE_PACKET => "continue response",
        CLIENT_TO_SERVER_PACKET => "client to server",
        SERVER_TO_CLIENT_PACKET => "server to client",
        SESSION_PING_PACKET => "session ping",
        SESSION_PONG_PACKET => "session pong",
        RELAY_PING_PACKET => "relay ping",
        RELAY_PONG_PACKET => "relay pong",
        UPGRADE_REQUEST_PACKET => "upgrade request",
        UPGRADE_RESPONSE_PACKET => "upgrade response",
        UPGRADE_CONFIRM_PACKET => "upgrade confirm",
        DIRECT_PING_PACKET => "direct ping",
        DIRECT_PONG_PACKET => "direct pong",
        CLIENT_STATS_PACKET => "client stats",
        ROUTE_UPDATE_PACKET => "route update",
        ROUTE_UPDATE_ACK_PACKET => "route update ack",
        BACKEND_SERVER_INIT_REQUEST_PACKET => "server init request",
        BACKEND_SERVER_INIT_RESPONSE_PACKET => "server init response",
        BACKEND_SERVER_UPDATE_REQUEST_PACKET => "server update request",
        BACKEND_SERVER_UPDATE_RESPONSE_PACKET => "server update response",
        BACKEND_SESSION_UPDATE_REQUEST_PACKET => "session update request",
        BACKEND_SESSION_UPDATE_RESPONSE_PACKET => "session update response",
        BACKEND_MATCH_DATA_REQUEST_PACKET => "match data request",
        BACKEND_MATCH_DATA_RESPONSE_PACKET => "match data response",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        assert!(is_signed(UPGRADE_REQUEST_PACKET));
        assert!(is_signed(BACKEND_SESSION_UPDATE_RESPONSE_PACKET));
        assert!(!is_signed(UPGRADE_RESPONSE_PACKET));
        assert!(!is_signed(CLIENT_TO_SERVER_PACKET));

        assert!(is_encrypted(DIRECT_PING_PACKET));
        assert!(is_encrypted(ROUTE_UPDATE_ACK_PACKET));
        assert!(!is_encrypted(SESSION_PING_PACKET));
        assert!(!is_encrypted(BACKEND_SERVER_INIT_REQUEST_PACKET));

        assert!(has_session_header(CLIENT_TO_SERVER_PACKET));
        assert!(has_session_header(ROUTE_RESPONSE_PACKET));
        assert!(!has_session_header(DIRECT_PACKET));
    }
}
