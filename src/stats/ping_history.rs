// src/stats/ping_history.rs

//! Ping timeline and the RTT / jitter / loss estimates derived from it.
//!
//! One history per measured path: direct, next, and one per near relay.

use crate::constants::PING_HISTORY_ENTRY_COUNT;

#[derive(Debug, Clone, Copy)]
struct PingEntry {
    sequence: u64,
    time_ping_sent: f64,
    time_pong_received: Option<f64>,
}

const EMPTY: PingEntry =
    PingEntry { sequence: u64::MAX, time_ping_sent: 0.0, time_pong_received: None };

#[derive(Debug, Clone)]
pub struct PingHistory {
    sequence: u64,
    entries: [PingEntry; PING_HISTORY_ENTRY_COUNT],
}

impl PingHistory {
    pub fn new() -> Self {
        Self { sequence: 0, entries: [EMPTY; PING_HISTORY_ENTRY_COUNT] }
    }

    /// Record an outgoing ping and hand back the sequence to put on the wire.
    pub fn ping_sent(&mut self, now: f64) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        let index = (sequence % PING_HISTORY_ENTRY_COUNT as u64) as usize;
        self.entries[index] =
            PingEntry { sequence, time_ping_sent: now, time_pong_received: None };
        sequence
    }

    /// Fill in the matching entry, if the slot has not been reused since.
    pub fn pong_received(&mut self, sequence: u64, now: f64) {
        let index = (sequence % PING_HISTORY_ENTRY_COUNT as u64) as usize;
        let entry = &mut self.entries[index];
        if entry.sequence == sequence && entry.time_pong_received.is_none() {
            entry.time_pong_received = Some(now);
        }
    }

    pub fn last_pong_time(&self) -> Option<f64> {
        self.entries
            .iter()
            .filter_map(|e| e.time_pong_received)
            .fold(None, |acc, t| Some(acc.map_or(t, |a: f64| a.max(t))))
    }
}

impl Default for PingHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RouteStats {
    /// Mean round trip in milliseconds over the window.
    pub rtt: f32,
    /// Mean absolute delta between consecutive round trips, milliseconds.
    pub jitter: f32,
    /// Fraction of pings in the window with no answer, in `[0, 1]`.
    pub packet_loss: f32,
}

impl RouteStats {
    /// Evaluate a history over `[start, end]`. A ping with no pong only
    /// counts as lost once it is older than `ping_safety` seconds, so pings
    /// still in flight at the window edge do not read as loss.
    pub fn from_ping_history(history: &PingHistory, start: f64, end: f64, ping_safety: f64) -> Self {
        // Walk entries oldest-first so jitter deltas follow send order.
        let mut samples: Vec<(u64, f64)> = Vec::new();
        let mut num_decided = 0u32;
        let mut num_lost = 0u32;

        for entry in &history.entries {
            if entry.sequence == u64::MAX {
                continue;
            }
            let sent = entry.time_ping_sent;
            if sent < start || sent > end {
                continue;
            }
            match entry.time_pong_received {
                Some(received) => {
                    num_decided += 1;
                    if received > end {
                        num_lost += 1;
                    } else {
                        samples.push((entry.sequence, (received - sent) * 1000.0));
                    }
                }
                None => {
                    if end - sent > ping_safety {
                        num_decided += 1;
                        num_lost += 1;
                    }
                }
            }
        }

        samples.sort_by_key(|(sequence, _)| *sequence);

        let rtt = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|(_, rtt)| rtt).sum::<f64>() / samples.len() as f64
        };

        let jitter = if samples.len() < 2 {
            0.0
        } else {
            let deltas: f64 =
                samples.windows(2).map(|pair| (pair[1].1 - pair[0].1).abs()).sum();
            deltas / (samples.len() - 1) as f64
        };

        let packet_loss =
            if num_decided == 0 { 0.0 } else { num_lost as f32 / num_decided as f32 };

        Self { rtt: rtt as f32, jitter: jitter as f32, packet_loss }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_average() {
        let mut history = PingHistory::new();
        for i in 0..10 {
            let t = i as f64;
            let seq = history.ping_sent(t);
            history.pong_received(seq, t + 0.030);
        }
        let stats = RouteStats::from_ping_history(&history, 0.0, 10.0, 1.0);
        assert!((stats.rtt - 30.0).abs() < 0.01);
        assert_eq!(stats.packet_loss, 0.0);
        assert!(stats.jitter < 0.01);
    }

    #[test]
    fn test_packet_loss_counts_expired_pings_only() {
        let mut history = PingHistory::new();
        // Five answered, five never answered, all sent well before the
        // window edge.
        for i in 0..10 {
            let t = i as f64 * 0.1;
            let seq = history.ping_sent(t);
            if i % 2 == 0 {
                history.pong_received(seq, t + 0.020);
            }
        }
        let stats = RouteStats::from_ping_history(&history, 0.0, 10.0, 1.0);
        assert!((stats.packet_loss - 0.5).abs() < 0.01);

        // A ping sent just now with no pong yet is not loss.
        let mut history = PingHistory::new();
        history.ping_sent(9.95);
        let stats = RouteStats::from_ping_history(&history, 0.0, 10.0, 1.0);
        assert_eq!(stats.packet_loss, 0.0);
    }

    #[test]
    fn test_jitter_from_varying_rtt() {
        let mut history = PingHistory::new();
        // Alternate 20 ms and 40 ms round trips: jitter should be ~20 ms.
        for i in 0..20 {
            let t = i as f64 * 0.1;
            let seq = history.ping_sent(t);
            let rtt = if i % 2 == 0 { 0.020 } else { 0.040 };
            history.pong_received(seq, t + rtt);
        }
        let stats = RouteStats::from_ping_history(&history, 0.0, 10.0, 1.0);
        assert!((stats.jitter - 20.0).abs() < 0.5, "jitter {}", stats.jitter);
    }

    #[test]
    fn test_window_excludes_old_entries() {
        let mut history = PingHistory::new();
        let seq = history.ping_sent(1.0);
        history.pong_received(seq, 1.5);
        let stats = RouteStats::from_ping_history(&history, 2.0, 10.0, 1.0);
        assert_eq!(stats.rtt, 0.0);
        assert_eq!(stats.packet_loss, 0.0);
    }

    #[test]
    fn test_stale_slot_not_confused_by_reuse() {
        let mut history = PingHistory::new();
        let first = history.ping_sent(0.0);
        // Wrap the ring completely so the slot is reused.
        for i in 0..PING_HISTORY_ENTRY_COUNT as u64 {
            history.ping_sent(1.0 + i as f64 * 0.001);
        }
        // A pong for the overwritten ping must be ignored.
        history.pong_received(first, 2.0);
        let stats = RouteStats::from_ping_history(&history, 0.0, 0.5, 10.0);
        assert_eq!(stats.rtt, 0.0);
    }

    #[test]
    fn test_stats_are_bounded() {
        let mut history = PingHistory::new();
        for i in 0..50 {
            let t = i as f64 * 0.05;
            let seq = history.ping_sent(t);
            if i % 3 != 0 {
                history.pong_received(seq, t + 0.015);
            }
        }
        let stats = RouteStats::from_ping_history(&history, 0.0, 100.0, 0.5);
        assert!(stats.rtt >= 0.0);
        assert!((0.0..=1.0).contains(&stats.packet_loss));
    }
}
