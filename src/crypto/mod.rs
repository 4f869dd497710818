// src/crypto/mod.rs

//! Key handling and the three crypto envelopes the wire uses: Ed25519
//! signatures on control packets, ChaCha20-Poly1305 for session-encrypted
//! packets and headers, and x25519 for route tokens and the upgrade key
//! exchange.

use crate::constants::{AEAD_NONCE_BYTES, AEAD_TAG_BYTES, KEY_BYTES, SIGNATURE_BYTES};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key is not valid base64")]
    BadBase64,

    #[error("key has wrong length: expected {expected}, got {actual}")]
    WrongKeyLength { expected: usize, actual: usize },

    #[error("key bytes rejected")]
    InvalidKey,

    #[error("signature check failed")]
    BadSignature,

    #[error("decryption failed")]
    DecryptFailed,
}

/// Customer keys are distributed as base64 of `customer_id(u64 LE) || key`.
/// The public blob carries a 32-byte Ed25519 verify key, the private blob the
/// 64-byte keypair.
#[derive(Clone, Debug)]
pub struct CustomerPublicKey {
    pub customer_id: u64,
    pub key: VerifyingKey,
}

#[derive(Clone)]
pub struct CustomerPrivateKey {
    pub customer_id: u64,
    pub key: SigningKey,
}

impl CustomerPublicKey {
    pub fn parse(base64_value: &str) -> Result<Self, CryptoError> {
        let blob = BASE64.decode(base64_value.trim()).map_err(|_| CryptoError::BadBase64)?;
        if blob.len() != 8 + KEY_BYTES {
            return Err(CryptoError::WrongKeyLength { expected: 8 + KEY_BYTES, actual: blob.len() });
        }
        let customer_id = u64::from_le_bytes(blob[..8].try_into().unwrap());
        let mut key_bytes = [0u8; KEY_BYTES];
        key_bytes.copy_from_slice(&blob[8..]);
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { customer_id, key })
    }
}

impl CustomerPrivateKey {
    pub fn parse(base64_value: &str) -> Result<Self, CryptoError> {
        let blob = BASE64.decode(base64_value.trim()).map_err(|_| CryptoError::BadBase64)?;
        if blob.len() != 8 + SIGNATURE_BYTES {
            return Err(CryptoError::WrongKeyLength {
                expected: 8 + SIGNATURE_BYTES,
                actual: blob.len(),
            });
        }
        let customer_id = u64::from_le_bytes(blob[..8].try_into().unwrap());
        let mut key_bytes = [0u8; 64];
        key_bytes.copy_from_slice(&blob[8..]);
        let key = SigningKey::from_keypair_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { customer_id, key })
    }
}

/// Bare 32-byte base64 key (backend and router public keys).
pub fn parse_key_32(base64_value: &str) -> Result<[u8; KEY_BYTES], CryptoError> {
    let blob = BASE64.decode(base64_value.trim()).map_err(|_| CryptoError::BadBase64)?;
    if blob.len() != KEY_BYTES {
        return Err(CryptoError::WrongKeyLength { expected: KEY_BYTES, actual: blob.len() });
    }
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&blob);
    Ok(key)
}

// ---------------------------------------------------------------------------
// Signed packets
// ---------------------------------------------------------------------------

/// Signature covers `type || body`, where body excludes the chonkle bytes and
/// the pittle trailer.
pub fn sign_packet(key: &SigningKey, packet_type: u8, body: &[u8]) -> [u8; SIGNATURE_BYTES] {
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(packet_type);
    message.extend_from_slice(body);
    key.sign(&message).to_bytes()
}

pub fn verify_packet(
    key: &VerifyingKey,
    packet_type: u8,
    body: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_BYTES {
        return Err(CryptoError::BadSignature);
    }
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(packet_type);
    message.extend_from_slice(body);
    key.verify(&message, &signature).map_err(|_| CryptoError::BadSignature)
}

// ---------------------------------------------------------------------------
// AEAD envelopes
// ---------------------------------------------------------------------------

pub fn aead_seal(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; AEAD_NONCE_BYTES],
    associated_data: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: associated_data })
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers")
}

pub fn aead_open(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; AEAD_NONCE_BYTES],
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_BYTES {
        return Err(CryptoError::DecryptFailed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: associated_data })
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypted packets carry an 8-byte little-endian sequence on the wire; it
/// expands to the IETF nonce by zero-padding the high bytes.
pub fn sequence_nonce(sequence: u64) -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

// ---------------------------------------------------------------------------
// Key exchange
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KxKeypair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KxKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Directional session keys derived during the upgrade handshake. Both sides
/// compute the same pair; the client sends with `client_to_server` and the
/// server with `server_to_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub client_to_server: [u8; KEY_BYTES],
    pub server_to_client: [u8; KEY_BYTES],
}

pub fn derive_session_keys(
    our_secret: &StaticSecret,
    their_public: &PublicKey,
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> SessionKeys {
    let shared = our_secret.diffie_hellman(their_public);
    let derive = |label: &[u8]| -> [u8; KEY_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(shared.as_bytes());
        hasher.update(client_public.as_bytes());
        hasher.update(server_public.as_bytes());
        hasher.finalize().into()
    };
    SessionKeys {
        client_to_server: derive(b"next c2s"),
        server_to_client: derive(b"next s2c"),
    }
}

/// Shared key for the x25519 + AEAD envelope around route and continue
/// tokens: static-static ECDH between the backend router key and the
/// session's route key, hashed with both public keys for context binding.
pub fn token_key(
    our_secret: &StaticSecret,
    their_public: &PublicKey,
) -> [u8; KEY_BYTES] {
    let shared = our_secret.diffie_hellman(their_public);
    let mut hasher = Sha256::new();
    hasher.update(b"next token");
    hasher.update(shared.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn test_customer_keypair() -> (String, String, u64) {
        let signing = SigningKey::generate(&mut OsRng);
        let customer_id = 0x1122_3344_5566_7788u64;
        let mut private_blob = customer_id.to_le_bytes().to_vec();
        private_blob.extend_from_slice(&signing.to_keypair_bytes());
        let mut public_blob = customer_id.to_le_bytes().to_vec();
        public_blob.extend_from_slice(signing.verifying_key().as_bytes());
        (BASE64.encode(public_blob), BASE64.encode(private_blob), customer_id)
    }

    #[test]
    fn test_customer_key_parse() {
        let (public_b64, private_b64, customer_id) = test_customer_keypair();
        let public = CustomerPublicKey::parse(&public_b64).unwrap();
        let private = CustomerPrivateKey::parse(&private_b64).unwrap();
        assert_eq!(public.customer_id, customer_id);
        assert_eq!(private.customer_id, customer_id);
        assert_eq!(private.key.verifying_key(), public.key);
    }

    #[test]
    fn test_customer_key_rejects_bad_input() {
        assert_eq!(CustomerPublicKey::parse("not base64!!!").unwrap_err(), CryptoError::BadBase64);
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            CustomerPublicKey::parse(&short).unwrap_err(),
            CryptoError::WrongKeyLength { .. }
        ));
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let (public_b64, private_b64, _) = test_customer_keypair();
        let public = CustomerPublicKey::parse(&public_b64).unwrap();
        let private = CustomerPrivateKey::parse(&private_b64).unwrap();

        let body = b"request body bytes";
        let signature = sign_packet(&private.key, 50, body);
        assert!(verify_packet(&public.key, 50, body, &signature).is_ok());
        // Altered type or body must fail.
        assert!(verify_packet(&public.key, 51, body, &signature).is_err());
        assert!(verify_packet(&public.key, 50, b"request body byteZ", &signature).is_err());
    }

    #[test]
    fn test_aead_round_trip() {
        let key = [7u8; 32];
        let nonce = sequence_nonce(12345);
        let sealed = aead_seal(&key, &nonce, b"ad", b"payload");
        assert_eq!(sealed.len(), 7 + AEAD_TAG_BYTES);
        assert_eq!(aead_open(&key, &nonce, b"ad", &sealed).unwrap(), b"payload");
        assert!(aead_open(&key, &nonce, b"other ad", &sealed).is_err());
        assert!(aead_open(&key, &sequence_nonce(12346), b"ad", &sealed).is_err());
    }

    #[test]
    fn test_session_keys_agree() {
        let client = KxKeypair::generate();
        let server = KxKeypair::generate();
        let client_view =
            derive_session_keys(&client.secret, &server.public, &client.public, &server.public);
        let server_view =
            derive_session_keys(&server.secret, &client.public, &client.public, &server.public);
        assert_eq!(client_view, server_view);
        assert_ne!(client_view.client_to_server, client_view.server_to_client);
    }

    #[test]
    fn test_token_key_agrees() {
        let router = KxKeypair::generate();
        let route = KxKeypair::generate();
        assert_eq!(
            token_key(&router.secret, &route.public),
            token_key(&route.secret, &router.public)
        );
    }
}
