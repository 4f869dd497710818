// src/protocol/tokens.rs

//! Route and continue tokens.
//!
//! Bearer credentials minted by the backend that authorize a relay chain to
//! carry a session's traffic for one slice. Each token in the array the
//! backend returns is sealed to one hop: x25519 between the router keypair
//! and that hop's route keypair, then ChaCha20-Poly1305 under the derived
//! key with a random nonce prefix.

use crate::address::Address;
use crate::constants::{AEAD_NONCE_BYTES, AEAD_TAG_BYTES, KEY_BYTES};
use crate::crypto::{self, CryptoError};
use x25519_dalek::{PublicKey, StaticSecret};

/// Fixed-width address encoding used inside tokens: tag, 16 ip bytes, port.
const TOKEN_ADDRESS_BYTES: usize = 19;

pub const ROUTE_TOKEN_BYTES: usize = 8 + 8 + 1 + 4 + 4 + TOKEN_ADDRESS_BYTES + KEY_BYTES;
pub const ENCRYPTED_ROUTE_TOKEN_BYTES: usize =
    AEAD_NONCE_BYTES + ROUTE_TOKEN_BYTES + AEAD_TAG_BYTES;

pub const CONTINUE_TOKEN_BYTES: usize = 8 + 8 + 1;
pub const ENCRYPTED_CONTINUE_TOKEN_BYTES: usize =
    AEAD_NONCE_BYTES + CONTINUE_TOKEN_BYTES + AEAD_TAG_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteToken {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_address: Address,
    pub private_key: [u8; KEY_BYTES],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueToken {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
}

fn write_token_address(out: &mut [u8], address: &Address) {
    out[..TOKEN_ADDRESS_BYTES].fill(0);
    match address {
        Address::None => {}
        Address::Ipv4 { ip, port } => {
            out[0] = 4;
            out[1..5].copy_from_slice(ip);
            out[17..19].copy_from_slice(&port.to_le_bytes());
        }
        Address::Ipv6 { ip, port } => {
            out[0] = 6;
            for (i, word) in ip.iter().enumerate() {
                out[1 + i * 2..3 + i * 2].copy_from_slice(&word.to_be_bytes());
            }
            out[17..19].copy_from_slice(&port.to_le_bytes());
        }
    }
}

fn read_token_address(data: &[u8]) -> Result<Address, CryptoError> {
    let port = u16::from_le_bytes(data[17..19].try_into().unwrap());
    match data[0] {
        0 => Ok(Address::None),
        4 => Ok(Address::Ipv4 { ip: data[1..5].try_into().unwrap(), port }),
        6 => {
            let mut ip = [0u16; 8];
            for (i, word) in ip.iter_mut().enumerate() {
                *word = u16::from_be_bytes(data[1 + i * 2..3 + i * 2].try_into().unwrap());
            }
            Ok(Address::Ipv6 { ip, port })
        }
        _ => Err(CryptoError::DecryptFailed),
    }
}

pub fn write_route_token(token: &RouteToken) -> [u8; ROUTE_TOKEN_BYTES] {
    let mut out = [0u8; ROUTE_TOKEN_BYTES];
    out[..8].copy_from_slice(&token.expire_timestamp.to_le_bytes());
    out[8..16].copy_from_slice(&token.session_id.to_le_bytes());
    out[16] = token.session_version;
    out[17..21].copy_from_slice(&token.kbps_up.to_le_bytes());
    out[21..25].copy_from_slice(&token.kbps_down.to_le_bytes());
    write_token_address(&mut out[25..25 + TOKEN_ADDRESS_BYTES], &token.next_address);
    out[25 + TOKEN_ADDRESS_BYTES..].copy_from_slice(&token.private_key);
    out
}

pub fn read_route_token(data: &[u8]) -> Result<RouteToken, CryptoError> {
    if data.len() != ROUTE_TOKEN_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    Ok(RouteToken {
        expire_timestamp: u64::from_le_bytes(data[..8].try_into().unwrap()),
        session_id: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        session_version: data[16],
        kbps_up: u32::from_le_bytes(data[17..21].try_into().unwrap()),
        kbps_down: u32::from_le_bytes(data[21..25].try_into().unwrap()),
        next_address: read_token_address(&data[25..25 + TOKEN_ADDRESS_BYTES])?,
        private_key: data[25 + TOKEN_ADDRESS_BYTES..].try_into().unwrap(),
    })
}

fn seal_token(
    plaintext: &[u8],
    nonce: [u8; AEAD_NONCE_BYTES],
    sender_secret: &StaticSecret,
    receiver_public: &PublicKey,
) -> Vec<u8> {
    let key = crypto::token_key(sender_secret, receiver_public);
    let mut out = nonce.to_vec();
    out.extend_from_slice(&crypto::aead_seal(&key, &nonce, &[], plaintext));
    out
}

fn open_token(
    data: &[u8],
    sender_public: &PublicKey,
    receiver_secret: &StaticSecret,
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AEAD_NONCE_BYTES + AEAD_TAG_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    let nonce: [u8; AEAD_NONCE_BYTES] = data[..AEAD_NONCE_BYTES].try_into().unwrap();
    let key = crypto::token_key(receiver_secret, sender_public);
    crypto::aead_open(&key, &nonce, &[], &data[AEAD_NONCE_BYTES..])
}

pub fn seal_route_token(
    token: &RouteToken,
    nonce: [u8; AEAD_NONCE_BYTES],
    router_secret: &StaticSecret,
    route_public: &PublicKey,
) -> Vec<u8> {
    seal_token(&write_route_token(token), nonce, router_secret, route_public)
}

pub fn open_route_token(
    data: &[u8],
    router_public: &PublicKey,
    route_secret: &StaticSecret,
) -> Result<RouteToken, CryptoError> {
    if data.len() != ENCRYPTED_ROUTE_TOKEN_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    let plaintext = open_token(data, router_public, route_secret)?;
    read_route_token(&plaintext)
}

pub fn write_continue_token(token: &ContinueToken) -> [u8; CONTINUE_TOKEN_BYTES] {
    let mut out = [0u8; CONTINUE_TOKEN_BYTES];
    out[..8].copy_from_slice(&token.expire_timestamp.to_le_bytes());
    out[8..16].copy_from_slice(&token.session_id.to_le_bytes());
    out[16] = token.session_version;
    out
}

pub fn read_continue_token(data: &[u8]) -> Result<ContinueToken, CryptoError> {
    if data.len() != CONTINUE_TOKEN_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    Ok(ContinueToken {
        expire_timestamp: u64::from_le_bytes(data[..8].try_into().unwrap()),
        session_id: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        session_version: data[16],
    })
}

pub fn seal_continue_token(
    token: &ContinueToken,
    nonce: [u8; AEAD_NONCE_BYTES],
    router_secret: &StaticSecret,
    route_public: &PublicKey,
) -> Vec<u8> {
    seal_token(&write_continue_token(token), nonce, router_secret, route_public)
}

pub fn open_continue_token(
    data: &[u8],
    router_public: &PublicKey,
    route_secret: &StaticSecret,
) -> Result<ContinueToken, CryptoError> {
    if data.len() != ENCRYPTED_CONTINUE_TOKEN_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    let plaintext = open_token(data, router_public, route_secret)?;
    read_continue_token(&plaintext)
}
