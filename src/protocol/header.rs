// src/protocol/header.rs

//! Encrypted session header carried by payload, ping and route response
//! packets. The header authenticates `{sequence, session id, session
//! version}` under the per-direction session key (or a route private key for
//! route and continue responses) without encrypting any payload bytes.

use crate::constants::{AEAD_NONCE_BYTES, AEAD_TAG_BYTES, HEADER_BYTES, KEY_BYTES};
use crate::crypto::{self, CryptoError};

fn header_nonce(packet_type: u8, sequence: u64) -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce[..4].copy_from_slice(&(packet_type as u32).to_le_bytes());
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

fn header_ad(session_id: u64, session_version: u8) -> [u8; 9] {
    let mut ad = [0u8; 9];
    ad[..8].copy_from_slice(&session_id.to_le_bytes());
    ad[8] = session_version;
    ad
}

pub fn write_header(
    packet_type: u8,
    sequence: u64,
    session_id: u64,
    session_version: u8,
    key: &[u8; KEY_BYTES],
    out: &mut [u8],
) {
    assert!(out.len() >= HEADER_BYTES);
    out[..8].copy_from_slice(&sequence.to_le_bytes());
    out[8..16].copy_from_slice(&session_id.to_le_bytes());
    out[16] = session_version;
    let nonce = header_nonce(packet_type, sequence);
    let ad = header_ad(session_id, session_version);
    // Empty plaintext: the ciphertext is exactly the 16-byte tag.
    let tag = crypto::aead_seal(key, &nonce, &ad, &[]);
    debug_assert_eq!(tag.len(), AEAD_TAG_BYTES);
    out[17..HEADER_BYTES].copy_from_slice(&tag);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sequence: u64,
    pub session_id: u64,
    pub session_version: u8,
}

/// Parse without verifying. Used to look up the session before the key is
/// known.
pub fn peek_header(data: &[u8]) -> Option<Header> {
    if data.len() < HEADER_BYTES {
        return None;
    }
    Some(Header {
        sequence: u64::from_le_bytes(data[..8].try_into().unwrap()),
        session_id: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        session_version: data[16],
    })
}

pub fn read_header(
    packet_type: u8,
    data: &[u8],
    key: &[u8; KEY_BYTES],
) -> Result<Header, CryptoError> {
    let header = peek_header(data).ok_or(CryptoError::DecryptFailed)?;
    let nonce = header_nonce(packet_type, header.sequence);
    let ad = header_ad(header.session_id, header.session_version);
    crypto::aead_open(key, &nonce, &ad, &data[17..HEADER_BYTES])?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet_type::CLIENT_TO_SERVER_PACKET;

    #[test]
    fn test_header_round_trip() {
        let key = [42u8; 32];
        let mut buffer = [0u8; HEADER_BYTES];
        write_header(CLIENT_TO_SERVER_PACKET, 1000, 0xDEAD, 3, &key, &mut buffer);
        let header = read_header(CLIENT_TO_SERVER_PACKET, &buffer, &key).unwrap();
        assert_eq!(header, Header { sequence: 1000, session_id: 0xDEAD, session_version: 3 });
    }

    #[test]
    fn test_header_rejects_any_altered_field() {
        let key = [42u8; 32];
        let mut buffer = [0u8; HEADER_BYTES];
        write_header(CLIENT_TO_SERVER_PACKET, 1000, 0xDEAD, 3, &key, &mut buffer);

        // Wrong packet type.
        assert!(read_header(CLIENT_TO_SERVER_PACKET + 1, &buffer, &key).is_err());
        // Wrong key.
        assert!(read_header(CLIENT_TO_SERVER_PACKET, &buffer, &[43u8; 32]).is_err());
        // Each mutated byte of the header must fail.
        for i in 0..HEADER_BYTES {
            let mut tampered = buffer;
            tampered[i] ^= 0x01;
            assert!(
                read_header(CLIENT_TO_SERVER_PACKET, &tampered, &key).is_err(),
                "byte {i} tamper not caught"
            );
        }
    }

    #[test]
    fn test_peek_without_key() {
        let key = [7u8; 32];
        let mut buffer = [0u8; HEADER_BYTES];
        write_header(CLIENT_TO_SERVER_PACKET, 55, 99, 1, &key, &mut buffer);
        let peeked = peek_header(&buffer).unwrap();
        assert_eq!(peeked.sequence, 55);
        assert_eq!(peeked.session_id, 99);
        assert_eq!(peeked.session_version, 1);
        assert!(peek_header(&buffer[..10]).is_none());
    }
}
