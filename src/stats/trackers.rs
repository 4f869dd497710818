// src/stats/trackers.rs

//! Statistics derived from the incoming payload sequence stream: packets
//! lost, packets out of order, and inter-arrival jitter.

use crate::constants::{PACKET_LOSS_TRACKER_HISTORY, PACKET_LOSS_TRACKER_SAFETY};

/// Counts sequence numbers that never arrived. A slot only counts as lost
/// once the stream has moved `PACKET_LOSS_TRACKER_SAFETY` past it, so
/// ordinary reordering does not register as loss.
#[derive(Debug, Clone)]
pub struct PacketLossTracker {
    received: [u64; PACKET_LOSS_TRACKER_HISTORY],
    most_recent: u64,
    next_to_check: u64,
    seen_any: bool,
    packets_lost: u64,
}

impl PacketLossTracker {
    pub fn new() -> Self {
        Self {
            received: [u64::MAX; PACKET_LOSS_TRACKER_HISTORY],
            most_recent: 0,
            next_to_check: 0,
            seen_any: false,
            packets_lost: 0,
        }
    }

    pub fn packet_received(&mut self, sequence: u64) {
        if !self.seen_any {
            self.seen_any = true;
            self.next_to_check = sequence;
            self.most_recent = sequence;
        } else if sequence > self.most_recent {
            self.most_recent = sequence;
        }
        let index = (sequence % PACKET_LOSS_TRACKER_HISTORY as u64) as usize;
        self.received[index] = sequence;
        // Sweep as we go so slots are judged before the ring reuses them.
        self.update();
    }

    /// Sweep slots that have aged out of the safety region and tally misses.
    pub fn update(&mut self) {
        if !self.seen_any {
            return;
        }
        let target = self.most_recent.saturating_sub(PACKET_LOSS_TRACKER_SAFETY);
        // If the stream jumped far ahead, everything older than one full
        // history is unknowable: count it lost wholesale.
        if target > self.next_to_check
            && (target - self.next_to_check) > PACKET_LOSS_TRACKER_HISTORY as u64
        {
            let skipped = (target - self.next_to_check) - PACKET_LOSS_TRACKER_HISTORY as u64;
            self.packets_lost += skipped;
            self.next_to_check += skipped;
        }
        while self.next_to_check < target {
            let index = (self.next_to_check % PACKET_LOSS_TRACKER_HISTORY as u64) as usize;
            if self.received[index] != self.next_to_check {
                self.packets_lost += 1;
            }
            self.next_to_check += 1;
        }
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }
}

impl Default for PacketLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts packets arriving with a sequence below the highest seen so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutOfOrderTracker {
    last_sequence: u64,
    num_out_of_order: u64,
}

impl OutOfOrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_received(&mut self, sequence: u64) {
        if sequence < self.last_sequence {
            self.num_out_of_order += 1;
        } else {
            self.last_sequence = sequence;
        }
    }

    pub fn packets_out_of_order(&self) -> u64 {
        self.num_out_of_order
    }
}

/// Smoothed inter-arrival jitter in seconds. Large changes move the estimate
/// slowly; negligible changes snap to the sample so the estimate settles to
/// zero on a steady stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterTracker {
    last_packet_time: Option<f64>,
    last_delta: Option<f64>,
    jitter: f64,
}

const JITTER_SMOOTHING: f64 = 0.01;
const JITTER_EPSILON: f64 = 0.000_01;

impl JitterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_received(&mut self, now: f64) {
        if let Some(last_time) = self.last_packet_time {
            let delta = now - last_time;
            if let Some(last_delta) = self.last_delta {
                let sample = (delta - last_delta).abs();
                if (sample - self.jitter).abs() > JITTER_EPSILON {
                    self.jitter += (sample - self.jitter) * JITTER_SMOOTHING;
                } else {
                    self.jitter = sample;
                }
            }
            self.last_delta = Some(delta);
        }
        self.last_packet_time = Some(now);
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_loss_on_contiguous_stream() {
        let mut tracker = PacketLossTracker::new();
        for seq in 1..=2000u64 {
            tracker.packet_received(seq);
        }
        tracker.update();
        assert_eq!(tracker.packets_lost(), 0);
    }

    #[test]
    fn test_gaps_counted_after_safety() {
        let mut tracker = PacketLossTracker::new();
        for seq in 1..=1000u64 {
            if seq % 10 != 0 {
                tracker.packet_received(seq);
            }
        }
        tracker.update();
        // Sequences up to 1000 - safety are decided; each decade lost one.
        let decided = 1000 - PACKET_LOSS_TRACKER_SAFETY;
        assert_eq!(tracker.packets_lost(), decided / 10);
    }

    #[test]
    fn test_reordering_is_not_loss() {
        let mut tracker = PacketLossTracker::new();
        for seq in [1u64, 2, 4, 3, 5, 6] {
            tracker.packet_received(seq);
        }
        tracker.update();
        assert_eq!(tracker.packets_lost(), 0);
    }

    #[test]
    fn test_large_jump_counts_skipped_region() {
        let mut tracker = PacketLossTracker::new();
        tracker.packet_received(1);
        tracker.packet_received(10_000);
        tracker.update();
        // Everything between 1 and the safety horizon is gone except the two
        // received packets.
        assert!(tracker.packets_lost() > 8_000);
    }

    #[test]
    fn test_out_of_order() {
        let mut tracker = OutOfOrderTracker::new();
        for seq in [1u64, 2, 5, 3, 4, 6, 2] {
            tracker.packet_received(seq);
        }
        // 3, 4 and the trailing 2 arrive below the running maximum.
        assert_eq!(tracker.packets_out_of_order(), 3);
    }

    #[test]
    fn test_jitter_settles_on_steady_stream() {
        let mut tracker = JitterTracker::new();
        for i in 0..100 {
            tracker.packet_received(i as f64 * 0.01);
        }
        assert!(tracker.jitter() < 0.001, "jitter {}", tracker.jitter());
    }

    #[test]
    fn test_jitter_reacts_to_variation() {
        let mut tracker = JitterTracker::new();
        let mut t = 0.0;
        for i in 0..1000 {
            t += if i % 2 == 0 { 0.005 } else { 0.015 };
            tracker.packet_received(t);
        }
        // Deltas alternate by 10 ms, so the smoothed estimate climbs toward
        // that and stays positive.
        assert!(tracker.jitter() > 0.001);
    }
}
