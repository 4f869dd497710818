//! Protocol constants shared by both runtimes.

/// Largest datagram either runtime will send or accept.
pub const MAX_PACKET_BYTES: usize = 4096;

/// Largest payload a single overlay packet can carry. Anything bigger goes
/// passthrough.
pub const MTU: usize = 1300;

pub const PACKET_TYPE_BYTES: usize = 1;
pub const CHONKLE_BYTES: usize = 15;
pub const PITTLE_BYTES: usize = 2;

/// Smallest possible non-passthrough packet: type + chonkle + pittle.
pub const MIN_PACKET_BYTES: usize = PACKET_TYPE_BYTES + CHONKLE_BYTES + PITTLE_BYTES;

/// Wire size of the encrypted session header:
/// sequence(8) + session id(8) + session version(1) + AEAD tag(16).
pub const HEADER_BYTES: usize = 33;

pub const SIGNATURE_BYTES: usize = 64;
pub const KEY_BYTES: usize = 32;
pub const AEAD_TAG_BYTES: usize = 16;
pub const AEAD_NONCE_BYTES: usize = 12;
pub const SEQUENCE_NONCE_BYTES: usize = 8;
pub const MAGIC_BYTES: usize = 8;

pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 256;
pub const PING_HISTORY_ENTRY_COUNT: usize = 256;
pub const PACKET_LOSS_TRACKER_HISTORY: usize = 1024;
/// Sequence distance a packet may trail the most recent one before the loss
/// tracker counts its slot as lost.
pub const PACKET_LOSS_TRACKER_SAFETY: u64 = 256;

pub const DIRECT_PINGS_PER_SECOND: f64 = 10.0;
pub const NEXT_PINGS_PER_SECOND: f64 = 10.0;
pub const CLIENT_STATS_UPDATES_PER_SECOND: f64 = 10.0;
pub const SECONDS_BETWEEN_CLIENT_STATS_PACKETS: f64 = 1.0;

/// Global budget for near-relay pings across the whole relay set.
pub const MAX_RELAY_PINGS_PER_SECOND: f64 = 100.0;
pub const MIN_RELAY_PING_INTERVAL: f64 = 0.1;
pub const MAX_NEAR_RELAYS: usize = 32;

pub const ROUTE_REQUEST_SEND_TIME: f64 = 0.25;
pub const CONTINUE_REQUEST_SEND_TIME: f64 = 0.25;
pub const ROUTE_REQUEST_TIMEOUT: f64 = 5.0;
pub const CONTINUE_REQUEST_TIMEOUT: f64 = 5.0;
pub const CLIENT_ROUTE_TIMEOUT: f64 = 16.5;
pub const SLICE_SECONDS: f64 = 10.0;

pub const CLIENT_SESSION_TIMEOUT: f64 = 10.0;
pub const SERVER_SESSION_TIMEOUT: f64 = 60.0;
pub const SERVER_PING_TIMEOUT: f64 = 10.0;

pub const UPGRADE_RESPONSE_RESEND_TIME: f64 = 1.0;
pub const UPGRADE_TIMEOUT: f64 = 5.0;

pub const SECONDS_BETWEEN_SERVER_UPDATES: f64 = 10.0;
pub const SECONDS_BETWEEN_SESSION_UPDATES: f64 = 10.0;
pub const SESSION_UPDATE_RESEND_TIME: f64 = 1.0;
pub const SESSION_UPDATE_TIMEOUT: f64 = 5.0;
pub const MATCH_DATA_RESEND_TIME: f64 = 1.0;

pub const SERVER_INIT_RESEND_TIME: f64 = 1.0;
pub const SERVER_INIT_TIMEOUT: f64 = 30.0;
pub const SERVER_UPDATE_TIMEOUT: f64 = 30.0;
pub const SERVER_FLUSH_TIMEOUT: f64 = 10.0;

pub const HOSTNAME_RESOLVE_RETRIES: u32 = 10;
pub const HOSTNAME_RESOLVE_RETRY_TIME: f64 = 1.0;

pub const CLIENT_UPDATE_INTERVAL: f64 = 0.01;
pub const SERVER_UPDATE_INTERVAL: f64 = 0.1;

pub const BANDWIDTH_LIMITER_INTERVAL: f64 = 1.0;

pub const MAX_SESSION_UPDATE_RETRIES: u8 = 10;
pub const MAX_MATCH_VALUES: usize = 64;
pub const MAX_SESSION_DATA_BYTES: usize = 256;
pub const MAX_DATACENTER_NAME_LENGTH: usize = 256;

pub const CLIENT_COUNTER_MAX: usize = 64;
pub const SERVER_COUNTER_MAX: usize = 64;

pub const PROTOCOL_VERSION: u64 = 5;

/// Bits recorded in the per-session flags bitmask when fallback to direct
/// latches, identifying which timeout fired.
pub const FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT: u64 = 1 << 0;
pub const FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT: u64 = 1 << 1;
pub const FALLBACK_FLAG_ROUTE_EXPIRED: u64 = 1 << 2;
pub const FALLBACK_FLAG_ROUTE_TIMED_OUT: u64 = 1 << 3;
pub const FALLBACK_FLAG_DIRECT_PONG_TIMED_OUT: u64 = 1 << 4;
pub const FALLBACK_FLAG_NEXT_PONG_TIMED_OUT: u64 = 1 << 5;
pub const FALLBACK_FLAG_UPGRADE_RESPONSE_TIMED_OUT: u64 = 1 << 6;
pub const FALLBACK_FLAG_ROUTE_UPDATE_TIMED_OUT: u64 = 1 << 7;

/// Modulo-256 sequence comparison used for session versions.
pub fn sequence_greater_than(s1: u8, s2: u8) -> bool {
    ((s1 > s2) && (s1 - s2 <= 128)) || ((s1 < s2) && (s2 - s1 > 128))
}

pub fn sequence_less_than(s1: u8, s2: u8) -> bool {
    sequence_greater_than(s2, s1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(sequence_greater_than(5, 250));
        assert!(!sequence_greater_than(80, 100));
        assert!(sequence_greater_than(100, 80));
        assert!(sequence_less_than(250, 5));
        assert!(!sequence_greater_than(7, 7));
    }
}
