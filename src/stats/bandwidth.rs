// src/stats/bandwidth.rs

//! Per-path bandwidth accounting. One instance per direction per path.
//!
//! The backend grants each session a kbps envelope per direction on the next
//! path; a send that would push the current one-second interval past the
//! envelope reports over-limit, and the caller routes that packet direct
//! instead.

use crate::constants::BANDWIDTH_LIMITER_INTERVAL;

const AVERAGE_SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct BandwidthLimiter {
    interval_start: Option<f64>,
    bits_in_interval: u64,
    average_kbps: f64,
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Self { interval_start: None, bits_in_interval: 0, average_kbps: 0.0 }
    }

    fn roll_interval(&mut self, now: f64) {
        match self.interval_start {
            None => self.interval_start = Some(now),
            Some(start) if now - start >= BANDWIDTH_LIMITER_INTERVAL => {
                let instant_kbps =
                    self.bits_in_interval as f64 / (now - start) / 1000.0;
                self.average_kbps += (instant_kbps - self.average_kbps) * AVERAGE_SMOOTHING;
                self.interval_start = Some(now);
                self.bits_in_interval = 0;
            }
            _ => {}
        }
    }

    /// Account for a packet about to be sent. Returns true if this packet
    /// pushes the current interval over `kbps_allowed`.
    pub fn add_packet(&mut self, now: f64, packet_bits: u64, kbps_allowed: u32) -> bool {
        self.roll_interval(now);
        self.bits_in_interval += packet_bits;
        self.bits_in_interval as f64
            > kbps_allowed as f64 * 1000.0 * BANDWIDTH_LIMITER_INTERVAL
    }

    /// Track only, for paths with no envelope.
    pub fn add_packet_unlimited(&mut self, now: f64, packet_bits: u64) {
        self.roll_interval(now);
        self.bits_in_interval += packet_bits;
    }

    pub fn average_kbps(&self) -> f64 {
        self.average_kbps
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_envelope() {
        let mut limiter = BandwidthLimiter::new();
        // 100 packets of 1000 bits in one second = 100 kbps, envelope 256.
        for i in 0..100 {
            assert!(!limiter.add_packet(i as f64 * 0.01, 1000, 256));
        }
    }

    #[test]
    fn test_over_envelope() {
        let mut limiter = BandwidthLimiter::new();
        let mut over = false;
        // 1000 packets of 8000 bits in one second = 8 mbps against 256 kbps.
        for i in 0..1000 {
            over |= limiter.add_packet(i as f64 * 0.001, 8000, 256);
        }
        assert!(over);
    }

    #[test]
    fn test_zero_envelope_rejects_everything() {
        let mut limiter = BandwidthLimiter::new();
        assert!(limiter.add_packet(0.0, 8, 0));
    }

    #[test]
    fn test_interval_resets() {
        let mut limiter = BandwidthLimiter::new();
        assert!(limiter.add_packet(0.0, 300_000, 256));
        // A fresh interval starts clean.
        assert!(!limiter.add_packet(1.5, 1000, 256));
    }

    #[test]
    fn test_average_converges() {
        let mut limiter = BandwidthLimiter::new();
        // Steady 100 kbps for a while.
        for second in 0..200 {
            for i in 0..10 {
                limiter.add_packet_unlimited(second as f64 + i as f64 * 0.1, 10_000);
            }
        }
        let average = limiter.average_kbps();
        assert!((50.0..150.0).contains(&average), "average {average}");
    }
}
