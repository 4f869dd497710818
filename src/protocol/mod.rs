// src/protocol/mod.rs

//! Wire packet assembly and parsing.
//!
//! Four envelope shapes share the outer framing `type || chonkle(15) || ...
//! || pittle(2)`:
//!
//! * control packets: bitpacked body, optionally Ed25519-signed
//! * encrypted packets: 8-byte sequence nonce + AEAD-sealed bitpacked body
//! * session packets: 33-byte encrypted header + raw payload
//! * direct packets: open-session sequence + send sequence + raw payload
//!
//! Passthrough packets are a single zero byte plus the application payload
//! and bypass everything here except `write_passthrough_packet`.

pub mod backend;
pub mod filters;
pub mod header;
pub mod packet_type;
pub mod packets;
pub mod tokens;

use crate::address::Address;
use crate::constants::{
    CHONKLE_BYTES, HEADER_BYTES, KEY_BYTES, MAX_PACKET_BYTES, MIN_PACKET_BYTES, PITTLE_BYTES,
    SEQUENCE_NONCE_BYTES, SIGNATURE_BYTES,
};
use crate::crypto::{self, CryptoError};
use crate::magic::MagicSet;
use crate::replay::ReplayProtection;
use crate::utils::error::BinaryError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too small")]
    TooSmall,

    #[error("packet too large")]
    TooLarge,

    #[error("basic packet filter failed")]
    BasicFilterFailed,

    #[error("advanced packet filter failed")]
    AdvancedFilterFailed,

    #[error("unexpected packet type {0}")]
    WrongPacketType(u8),

    #[error("signature check failed")]
    BadSignature,

    #[error("replayed packet")]
    Replay,

    #[error(transparent)]
    Binary(#[from] BinaryError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, PacketError>;

const BODY_OFFSET: usize = 1 + CHONKLE_BYTES;

/// Magic used by upgrade-subprotocol packets: the client has no magic until
/// the upgrade request delivers one, so the whole handshake is stamped under
/// zeroes.
pub const ZERO_MAGIC: [u8; 8] = [0u8; 8];

fn is_upgrade_packet(packet_type: u8) -> bool {
    matches!(
        packet_type,
        packet_type::UPGRADE_REQUEST_PACKET
            | packet_type::UPGRADE_RESPONSE_PACKET
            | packet_type::UPGRADE_CONFIRM_PACKET
    )
}

/// Addresses actually bound into the filters for a given packet type. During
/// the upgrade handshake the client does not yet know its own external
/// address, so the unknown side is pinned to `None` on both ends.
pub fn filter_addresses(packet_type: u8, from: &Address, to: &Address) -> (Address, Address) {
    use packet_type::*;
    match packet_type {
        UPGRADE_REQUEST_PACKET | UPGRADE_CONFIRM_PACKET => (*from, Address::None),
        UPGRADE_RESPONSE_PACKET => (Address::None, *to),
        _ => (*from, *to),
    }
}

fn stamp(packet: &mut [u8], magic: &[u8; 8], from: &Address, to: &Address) {
    let magic = if is_upgrade_packet(packet[0]) { &ZERO_MAGIC } else { magic };
    let (from, to) = filter_addresses(packet[0], from, to);
    let length = packet.len();
    let chonkle = filters::generate_chonkle(magic, &from, &to, length);
    packet[1..BODY_OFFSET].copy_from_slice(&chonkle);
    let pittle = filters::generate_pittle(&from, &to, length);
    packet[length - PITTLE_BYTES..].copy_from_slice(&pittle);
}

/// Inbound gate: basic filter, then the advanced filter under current,
/// upcoming and previous magic in that order. Upgrade packets check under
/// zero magic only.
pub fn accept_inbound(data: &[u8], magic: &MagicSet, from: &Address, to: &Address) -> bool {
    if !filters::basic_packet_filter(data) {
        return false;
    }
    if data[0] == packet_type::PASSTHROUGH_PACKET {
        return true;
    }
    let (from, to) = filter_addresses(data[0], from, to);
    if is_upgrade_packet(data[0]) {
        return filters::advanced_packet_filter(data, &ZERO_MAGIC, &from, &to);
    }
    magic
        .accept_order()
        .iter()
        .any(|m| filters::advanced_packet_filter(data, m, &from, &to))
}

// ---------------------------------------------------------------------------
// Control packets
// ---------------------------------------------------------------------------

pub fn write_control_packet(
    packet_type: u8,
    body: &[u8],
    from: &Address,
    to: &Address,
    magic: &[u8; 8],
    signing_key: Option<&SigningKey>,
) -> Result<Vec<u8>> {
    debug_assert_eq!(packet_type::is_signed(packet_type), signing_key.is_some());
    let signature_bytes = if signing_key.is_some() { SIGNATURE_BYTES } else { 0 };
    let length = BODY_OFFSET + body.len() + signature_bytes + PITTLE_BYTES;
    if length > MAX_PACKET_BYTES {
        return Err(PacketError::TooLarge);
    }
    let mut packet = vec![0u8; length];
    packet[0] = packet_type;
    packet[BODY_OFFSET..BODY_OFFSET + body.len()].copy_from_slice(body);
    if let Some(key) = signing_key {
        let signature = crypto::sign_packet(key, packet_type, body);
        packet[BODY_OFFSET + body.len()..BODY_OFFSET + body.len() + SIGNATURE_BYTES]
            .copy_from_slice(&signature);
    }
    stamp(&mut packet, magic, from, to);
    Ok(packet)
}

/// Strip the framing from an already-filtered control packet and verify the
/// signature if the type calls for one.
pub fn read_control_packet<'a>(
    data: &'a [u8],
    verify_key: Option<&VerifyingKey>,
) -> Result<&'a [u8]> {
    if data.len() < MIN_PACKET_BYTES {
        return Err(PacketError::TooSmall);
    }
    let packet_type = data[0];
    let signed = packet_type::is_signed(packet_type);
    debug_assert_eq!(signed, verify_key.is_some());
    let trailer = PITTLE_BYTES + if signed { SIGNATURE_BYTES } else { 0 };
    if data.len() < BODY_OFFSET + trailer {
        return Err(PacketError::TooSmall);
    }
    let body = &data[BODY_OFFSET..data.len() - trailer];
    if let Some(key) = verify_key {
        let signature = &data[data.len() - trailer..data.len() - PITTLE_BYTES];
        crypto::verify_packet(key, packet_type, body, signature)
            .map_err(|_| PacketError::BadSignature)?;
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// Encrypted packets
// ---------------------------------------------------------------------------

pub fn write_encrypted_packet(
    packet_type: u8,
    sequence: u64,
    body: &[u8],
    key: &[u8; KEY_BYTES],
    from: &Address,
    to: &Address,
    magic: &[u8; 8],
) -> Result<Vec<u8>> {
    debug_assert!(packet_type::is_encrypted(packet_type));
    let nonce = crypto::sequence_nonce(sequence);
    let sealed = crypto::aead_seal(key, &nonce, &[packet_type], body);
    let length = BODY_OFFSET + SEQUENCE_NONCE_BYTES + sealed.len() + PITTLE_BYTES;
    if length > MAX_PACKET_BYTES {
        return Err(PacketError::TooLarge);
    }
    let mut packet = vec![0u8; length];
    packet[0] = packet_type;
    packet[BODY_OFFSET..BODY_OFFSET + SEQUENCE_NONCE_BYTES]
        .copy_from_slice(&sequence.to_le_bytes());
    packet[BODY_OFFSET + SEQUENCE_NONCE_BYTES..length - PITTLE_BYTES].copy_from_slice(&sealed);
    stamp(&mut packet, magic, from, to);
    Ok(packet)
}

/// Decrypt an encrypted packet that already passed the filters. The replay
/// window is only checked here; the caller advances it after the packet has
/// been fully processed.
pub fn read_encrypted_packet(
    data: &[u8],
    key: &[u8; KEY_BYTES],
    replay: &ReplayProtection,
) -> Result<(u64, Vec<u8>)> {
    if data.len() < BODY_OFFSET + SEQUENCE_NONCE_BYTES + PITTLE_BYTES {
        return Err(PacketError::TooSmall);
    }
    let packet_type = data[0];
    let sequence = u64::from_le_bytes(
        data[BODY_OFFSET..BODY_OFFSET + SEQUENCE_NONCE_BYTES].try_into().unwrap(),
    );
    if replay.already_received(sequence) {
        return Err(PacketError::Replay);
    }
    let nonce = crypto::sequence_nonce(sequence);
    let sealed = &data[BODY_OFFSET + SEQUENCE_NONCE_BYTES..data.len() - PITTLE_BYTES];
    let body = crypto::aead_open(key, &nonce, &[packet_type], sealed)?;
    Ok((sequence, body))
}

// ---------------------------------------------------------------------------
// Session packets
// ---------------------------------------------------------------------------

pub fn write_session_packet(
    packet_type: u8,
    sequence: u64,
    session_id: u64,
    session_version: u8,
    key: &[u8; KEY_BYTES],
    payload: &[u8],
    from: &Address,
    to: &Address,
    magic: &[u8; 8],
) -> Result<Vec<u8>> {
    debug_assert!(packet_type::has_session_header(packet_type));
    let length = BODY_OFFSET + HEADER_BYTES + payload.len() + PITTLE_BYTES;
    if length > MAX_PACKET_BYTES {
        return Err(PacketError::TooLarge);
    }
    let mut packet = vec![0u8; length];
    packet[0] = packet_type;
    header::write_header(
        packet_type,
        sequence,
        session_id,
        session_version,
        key,
        &mut packet[BODY_OFFSET..BODY_OFFSET + HEADER_BYTES],
    );
    packet[BODY_OFFSET + HEADER_BYTES..length - PITTLE_BYTES].copy_from_slice(payload);
    stamp(&mut packet, magic, from, to);
    Ok(packet)
}

/// Read the header without authenticating, to find the owning session.
pub fn peek_session_packet(data: &[u8]) -> Result<header::Header> {
    if data.len() < BODY_OFFSET + HEADER_BYTES + PITTLE_BYTES {
        return Err(PacketError::TooSmall);
    }
    header::peek_header(&data[BODY_OFFSET..]).ok_or(PacketError::TooSmall)
}

/// Authenticate the header under `key` and return the payload slice.
pub fn read_session_packet<'a>(
    data: &'a [u8],
    key: &[u8; KEY_BYTES],
) -> Result<(header::Header, &'a [u8])> {
    if data.len() < BODY_OFFSET + HEADER_BYTES + PITTLE_BYTES {
        return Err(PacketError::TooSmall);
    }
    let parsed = header::read_header(data[0], &data[BODY_OFFSET..], key)?;
    Ok((parsed, &data[BODY_OFFSET + HEADER_BYTES..data.len() - PITTLE_BYTES]))
}

// ---------------------------------------------------------------------------
// Direct and passthrough packets
// ---------------------------------------------------------------------------

pub fn write_direct_packet(
    open_session_sequence: u8,
    send_sequence: u64,
    payload: &[u8],
    from: &Address,
    to: &Address,
    magic: &[u8; 8],
) -> Result<Vec<u8>> {
    let length = BODY_OFFSET + 1 + 8 + payload.len() + PITTLE_BYTES;
    if length > MAX_PACKET_BYTES {
        return Err(PacketError::TooLarge);
    }
    let mut packet = vec![0u8; length];
    packet[0] = packet_type::DIRECT_PACKET;
    packet[BODY_OFFSET] = open_session_sequence;
    packet[BODY_OFFSET + 1..BODY_OFFSET + 9].copy_from_slice(&send_sequence.to_le_bytes());
    packet[BODY_OFFSET + 9..length - PITTLE_BYTES].copy_from_slice(payload);
    stamp(&mut packet, magic, from, to);
    Ok(packet)
}

pub struct DirectPacket<'a> {
    pub open_session_sequence: u8,
    pub send_sequence: u64,
    pub payload: &'a [u8],
}

pub fn read_direct_packet(data: &[u8]) -> Result<DirectPacket<'_>> {
    if data.len() < BODY_OFFSET + 9 + PITTLE_BYTES {
        return Err(PacketError::TooSmall);
    }
    Ok(DirectPacket {
        open_session_sequence: data[BODY_OFFSET],
        send_sequence: u64::from_le_bytes(
            data[BODY_OFFSET + 1..BODY_OFFSET + 9].try_into().unwrap(),
        ),
        payload: &data[BODY_OFFSET + 9..data.len() - PITTLE_BYTES],
    })
}

pub fn write_passthrough_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + payload.len());
    packet.push(packet_type::PASSTHROUGH_PACKET);
    packet.extend_from_slice(payload);
    packet
}

// ---------------------------------------------------------------------------
// Raw token forwards (route / continue requests)
// ---------------------------------------------------------------------------

/// Route and continue requests carry the remaining sealed token array as
/// their body, unsigned: each relay peels its own token off the front.
pub fn write_token_request_packet(
    packet_type: u8,
    token_data: &[u8],
    from: &Address,
    to: &Address,
    magic: &[u8; 8],
) -> Result<Vec<u8>> {
    debug_assert!(matches!(
        packet_type,
        packet_type::ROUTE_REQUEST_PACKET | packet_type::CONTINUE_REQUEST_PACKET
    ));
    write_control_packet(packet_type, token_data, from, to, magic, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet_type::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn addresses() -> (Address, Address) {
        ("1.2.3.4:5678".parse().unwrap(), "5.6.7.8:32202".parse().unwrap())
    }

    fn magic_set() -> MagicSet {
        let mut magic = MagicSet::default();
        magic.apply([1; 8], [2; 8], [3; 8]);
        magic
    }

    #[test]
    fn test_control_packet_unsigned_round_trip() {
        let (from, to) = addresses();
        let magic = magic_set();
        let packet =
            write_control_packet(RELAY_PING_PACKET, b"body bytes", &from, &to, &magic.current, None)
                .unwrap();

        assert!(accept_inbound(&packet, &magic, &from, &to));
        let body = read_control_packet(&packet, None).unwrap();
        assert_eq!(body, b"body bytes");
    }

    #[test]
    fn test_control_packet_signed_round_trip() {
        let (from, to) = addresses();
        let magic = magic_set();
        let signing = SigningKey::generate(&mut OsRng);
        let packet = write_control_packet(
            UPGRADE_CONFIRM_PACKET,
            b"confirm",
            &from,
            &to,
            &magic.current,
            Some(&signing),
        )
        .unwrap();

        assert!(accept_inbound(&packet, &magic, &from, &to));
        let body = read_control_packet(&packet, Some(&signing.verifying_key())).unwrap();
        assert_eq!(body, b"confirm");

        // A different key must reject it.
        let other = SigningKey::generate(&mut OsRng);
        assert!(matches!(
            read_control_packet(&packet, Some(&other.verifying_key())),
            Err(PacketError::BadSignature)
        ));
    }

    #[test]
    fn test_inbound_accepts_all_three_magics() {
        let (from, to) = addresses();
        let magic = magic_set();
        for m in [magic.previous, magic.current, magic.upcoming] {
            let packet =
                write_control_packet(RELAY_PONG_PACKET, b"x", &from, &to, &m, None).unwrap();
            assert!(accept_inbound(&packet, &magic, &from, &to));
        }
        let stale =
            write_control_packet(RELAY_PONG_PACKET, b"x", &from, &to, &[99u8; 8], None).unwrap();
        assert!(!accept_inbound(&stale, &magic, &from, &to));
    }

    #[test]
    fn test_upgrade_request_filtered_with_no_to_address() {
        let (from, to) = addresses();
        let magic = magic_set();
        let signing = SigningKey::generate(&mut OsRng);
        let packet = write_control_packet(
            UPGRADE_REQUEST_PACKET,
            b"upgrade",
            &from,
            &to,
            &magic.current,
            Some(&signing),
        )
        .unwrap();
        // The receiver can validate with any `to` it believes it has: the
        // filter binds Address::None for this type on both sides.
        let other_to: Address = "9.9.9.9:1".parse().unwrap();
        assert!(accept_inbound(&packet, &magic, &from, &other_to));
    }

    #[test]
    fn test_encrypted_packet_round_trip_and_replay() {
        let (from, to) = addresses();
        let magic = magic_set();
        let key = [5u8; 32];
        let packet = write_encrypted_packet(
            DIRECT_PING_PACKET,
            900,
            b"ping body",
            &key,
            &from,
            &to,
            &magic.current,
        )
        .unwrap();

        assert!(accept_inbound(&packet, &magic, &from, &to));
        let mut replay = ReplayProtection::new();
        let (sequence, body) = read_encrypted_packet(&packet, &key, &replay).unwrap();
        assert_eq!(sequence, 900);
        assert_eq!(body, b"ping body");
        replay.advance(sequence);
        assert!(matches!(
            read_encrypted_packet(&packet, &key, &replay),
            Err(PacketError::Replay)
        ));
    }

    #[test]
    fn test_session_packet_round_trip() {
        let (from, to) = addresses();
        let magic = magic_set();
        let key = [9u8; 32];
        let payload = [0xAA; 64];
        let packet = write_session_packet(
            CLIENT_TO_SERVER_PACKET,
            7,
            0xDEAD,
            1,
            &key,
            &payload,
            &from,
            &to,
            &magic.current,
        )
        .unwrap();

        assert!(accept_inbound(&packet, &magic, &from, &to));
        let peeked = peek_session_packet(&packet).unwrap();
        assert_eq!(peeked.session_id, 0xDEAD);
        let (header, body) = read_session_packet(&packet, &key).unwrap();
        assert_eq!(header.sequence, 7);
        assert_eq!(header.session_version, 1);
        assert_eq!(body, payload);
        assert!(read_session_packet(&packet, &[10u8; 32]).is_err());
    }

    #[test]
    fn test_direct_packet_round_trip() {
        let (from, to) = addresses();
        let magic = magic_set();
        let packet =
            write_direct_packet(3, 12345, &[0xBB; 100], &from, &to, &magic.current).unwrap();
        assert!(accept_inbound(&packet, &magic, &from, &to));
        let direct = read_direct_packet(&packet).unwrap();
        assert_eq!(direct.open_session_sequence, 3);
        assert_eq!(direct.send_sequence, 12345);
        assert_eq!(direct.payload, &[0xBB; 100]);
    }

    #[test]
    fn test_passthrough_packet() {
        let packet = write_passthrough_packet(&[1, 2, 3]);
        assert_eq!(packet, vec![0, 1, 2, 3]);
        let magic = magic_set();
        let (from, to) = addresses();
        assert!(accept_inbound(&packet, &magic, &from, &to));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (from, to) = addresses();
        let magic = magic_set();
        let too_big = vec![0u8; MAX_PACKET_BYTES];
        assert!(matches!(
            write_session_packet(
                CLIENT_TO_SERVER_PACKET,
                0,
                1,
                0,
                &[0u8; 32],
                &too_big,
                &from,
                &to,
                &magic.current
            ),
            Err(PacketError::TooLarge)
        ));
    }
}
