//! # Peer Statistics
//!
//! Counters mutated only on the library thread; the peer publishes a
//! snapshot each heartbeat for the application to read. Serialize for
//! export.

use serde::Serialize;

/// Process-wide transport counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStatistics {
    /// Datagrams written to the socket.
    pub sent_packets: u64,
    /// Datagrams read from the socket.
    pub received_packets: u64,
    /// Framed messages sent (including retransmissions).
    pub sent_messages: u64,
    /// Framed messages parsed from inbound datagrams.
    pub received_messages: u64,
    /// Payload bytes sent.
    pub sent_bytes: u64,
    /// Payload bytes received.
    pub received_bytes: u64,
    /// Messages retransmitted by reliable channels.
    pub resent_messages: u64,
    /// Datagrams rejected whole by the parser.
    pub malformed_packets: u64,
    /// Messages skipped for reserved or unknown type codes.
    pub dropped_wire_messages: u64,
    /// Incoming messages dropped because the hand-off queue was full or the
    /// kind was disabled.
    pub dropped_incoming: u64,
    /// Connect attempts refused (capacity or identifier mismatch).
    pub rejected_handshakes: u64,
    /// Delivery receipts surfaced to the application.
    pub receipts: u64,
    /// `ConnectionReset` receive errors observed.
    pub connection_resets: u64,
    /// Socket rebind attempts after `NotConnected`.
    pub rebinds: u64,
}

impl PeerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead ratio.
    pub fn resend_ratio(&self) -> f64 {
        if self.sent_messages == 0 {
            0.0
        } else {
            self.resent_messages as f64 / self.sent_messages as f64
        }
    }

    /// Fraction of inbound datagrams rejected as malformed.
    pub fn malformed_ratio(&self) -> f64 {
        if self.received_packets == 0 {
            0.0
        } else {
            self.malformed_packets as f64 / self.received_packets as f64
        }
    }
}

/// Per-connection snapshot surfaced alongside the peer counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatistics {
    pub sent_messages: u64,
    pub received_messages: u64,
    pub resent_messages: u64,
    /// Duplicates dropped by receive channels.
    pub duplicates: u64,
    /// Arrivals beyond the receive window.
    pub too_early: u64,
    /// Messages currently withheld pending in-order release.
    pub withheld: u64,
    /// Smoothed round-trip estimate in seconds.
    pub rtt_seconds: f64,
    /// Current path MTU in bytes.
    pub mtu: u32,
}

/// Exponentially weighted moving average, used for RTT smoothing.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha));
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Fold in a sample; the first one seeds the average.
    pub fn update(&mut self, sample: f64) -> f64 {
        if self.initialized {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_guard_zero_division() {
        let stats = PeerStatistics::new();
        assert_eq!(stats.resend_ratio(), 0.0);
        assert_eq!(stats.malformed_ratio(), 0.0);
    }

    #[test]
    fn resend_ratio_computed() {
        let stats = PeerStatistics {
            sent_messages: 200,
            resent_messages: 10,
            ..Default::default()
        };
        assert!((stats.resend_ratio() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn ewma_seeds_then_smooths() {
        let mut ewma = Ewma::new(0.25);
        assert_eq!(ewma.update(0.100), 0.100);
        let v = ewma.update(0.200);
        assert!((v - 0.125).abs() < 1e-9, "0.25·0.2 + 0.75·0.1 = 0.125, got {v}");
    }

    #[test]
    fn stats_serialize_to_json() {
        let stats = PeerStatistics {
            sent_packets: 3,
            malformed_packets: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"sent_packets\":3"));
        assert!(json.contains("\"malformed_packets\":1"));
    }
}
