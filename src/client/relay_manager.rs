// src/client/relay_manager.rs

//! Near-relay bookkeeping on the client.
//!
//! The backend hands down a set of relays to ping (via route updates); this
//! manager keeps one ping history per relay, spreads pings evenly so the
//! whole set stays under a global packet rate, and summarizes the results
//! for the next stats report.

use crate::address::Address;
use crate::constants::{
    MAX_NEAR_RELAYS, MAX_RELAY_PINGS_PER_SECOND, MIN_RELAY_PING_INTERVAL,
};
use crate::protocol::packets::{NearRelay, NearRelayStats, PING_TOKEN_BYTES};
use crate::stats::{PingHistory, RouteStats};

const RELAY_STATS_WINDOW: f64 = 10.0;

#[derive(Debug, Clone)]
struct RelayEntry {
    relay_id: u64,
    address: Address,
    ping_token: [u8; PING_TOKEN_BYTES],
    expire_timestamp: u64,
    ping_history: PingHistory,
    next_ping_time: f64,
}

/// One ping the caller should put on the wire.
#[derive(Debug, Clone)]
pub struct RelayPing {
    pub address: Address,
    pub ping_token: [u8; PING_TOKEN_BYTES],
    pub expire_timestamp: u64,
    pub sequence: u64,
}

#[derive(Debug, Default)]
pub struct RelayManager {
    entries: Vec<RelayEntry>,
}

impl RelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_relays(&self) -> usize {
        self.entries.len()
    }

    fn ping_interval(&self) -> f64 {
        (self.entries.len() as f64 / MAX_RELAY_PINGS_PER_SECOND).max(MIN_RELAY_PING_INTERVAL)
    }

    /// Install a new relay set. Histories survive for relays that persist
    /// across updates so their stats windows stay warm.
    pub fn update_relays(&mut self, relays: &[NearRelay], expire_timestamp: u64, now: f64) {
        let mut next: Vec<RelayEntry> = Vec::with_capacity(relays.len().min(MAX_NEAR_RELAYS));
        for (index, relay) in relays.iter().take(MAX_NEAR_RELAYS).enumerate() {
            let existing = self.entries.iter().find(|e| e.relay_id == relay.relay_id);
            let ping_history =
                existing.map(|e| e.ping_history.clone()).unwrap_or_default();
            // Stagger initial pings across the interval so a fresh set does
            // not burst.
            let stagger = if relays.is_empty() {
                0.0
            } else {
                self.ping_interval() * index as f64 / relays.len() as f64
            };
            next.push(RelayEntry {
                relay_id: relay.relay_id,
                address: relay.address,
                ping_token: relay.ping_token,
                expire_timestamp,
                ping_history,
                next_ping_time: existing.map(|e| e.next_ping_time).unwrap_or(now + stagger),
            });
        }
        self.entries = next;
    }

    /// Collect the relays due for a ping. Tokens past their expiry are
    /// skipped; the backend refreshes them with the next relay set.
    pub fn pings_to_send(&mut self, now: f64, unix_now: u64) -> Vec<RelayPing> {
        let interval = self.ping_interval();
        let mut pings = Vec::new();
        for entry in &mut self.entries {
            if entry.expire_timestamp != 0 && unix_now >= entry.expire_timestamp {
                continue;
            }
            if now >= entry.next_ping_time {
                let sequence = entry.ping_history.ping_sent(now);
                entry.next_ping_time = now + interval;
                pings.push(RelayPing {
                    address: entry.address,
                    ping_token: entry.ping_token,
                    expire_timestamp: entry.expire_timestamp,
                    sequence,
                });
            }
        }
        pings
    }

    pub fn pong_received(&mut self, from: &Address, sequence: u64, now: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == *from) {
            entry.ping_history.pong_received(sequence, now);
        }
    }

    pub fn stats(&self, now: f64) -> Vec<NearRelayStats> {
        let safety = self.ping_interval() + 1.0;
        self.entries
            .iter()
            .map(|entry| {
                let stats = RouteStats::from_ping_history(
                    &entry.ping_history,
                    now - RELAY_STATS_WINDOW,
                    now,
                    safety,
                );
                NearRelayStats {
                    relay_id: entry.relay_id,
                    rtt: stats.rtt,
                    jitter: stats.jitter,
                    packet_loss: stats.packet_loss,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: u64, port: u16) -> NearRelay {
        NearRelay {
            relay_id: id,
            address: Address::Ipv4 { ip: [10, 0, 0, id as u8], port },
            ping_token: [id as u8; PING_TOKEN_BYTES],
        }
    }

    #[test]
    fn test_pings_distributed_under_global_rate() {
        let mut manager = RelayManager::new();
        let relays: Vec<NearRelay> = (1..=10).map(|i| relay(i, 40000)).collect();
        manager.update_relays(&relays, u64::MAX, 0.0);

        // Simulate one second at 100 Hz and count pings.
        let mut total = 0;
        for tick in 0..=100 {
            total += manager.pings_to_send(tick as f64 * 0.01, 0).len();
        }
        assert!(total as f64 <= MAX_RELAY_PINGS_PER_SECOND * 1.2, "sent {total}");
        assert!(total > 0);
    }

    #[test]
    fn test_history_survives_relay_set_update() {
        let mut manager = RelayManager::new();
        manager.update_relays(&[relay(1, 40000)], u64::MAX, 0.0);
        // Answer a bunch of pings for relay 1.
        for tick in 1..100 {
            let now = tick as f64 * 0.1;
            for ping in manager.pings_to_send(now, 0) {
                manager.pong_received(&ping.address, ping.sequence, now + 0.02);
            }
        }
        // New set keeps relay 1 and adds relay 2.
        manager.update_relays(&[relay(1, 40000), relay(2, 40000)], u64::MAX, 10.0);
        let stats = manager.stats(10.0);
        assert_eq!(stats.len(), 2);
        let relay1 = stats.iter().find(|s| s.relay_id == 1).unwrap();
        assert!(relay1.rtt > 0.0);
        let relay2 = stats.iter().find(|s| s.relay_id == 2).unwrap();
        assert_eq!(relay2.rtt, 0.0);
    }

    #[test]
    fn test_expired_tokens_not_pinged() {
        let mut manager = RelayManager::new();
        manager.update_relays(&[relay(1, 40000)], 1_000, 0.0);
        assert!(manager.pings_to_send(10.0, 2_000).is_empty());
    }

    #[test]
    fn test_removed_relay_dropped() {
        let mut manager = RelayManager::new();
        manager.update_relays(&[relay(1, 40000), relay(2, 40000)], u64::MAX, 0.0);
        manager.update_relays(&[relay(2, 40000)], u64::MAX, 1.0);
        assert_eq!(manager.num_relays(), 1);
        assert_eq!(manager.stats(1.0)[0].relay_id, 2);
    }
}
