//! Communicator configuration.
//!
//! One value constructed at [`Communicator::start`] and shared by reference
//! thereafter; nothing here mutates after start. Loading from files or the
//! environment is the application's business.
//!
//! [`Communicator::start`]: crate::communicator::Communicator::start

use serde::Deserialize;

use mlt_transport::wire::{DATA_HEADER_SIZE, UDP_OVERHEAD};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MltConfig {
    /// Path MTU the packetizer assumes.
    pub mtu: usize,
    /// Number of DSCP priority queues; each gets an ECT and a non-ECT
    /// endpoint.
    pub num_queues: usize,
    /// Bandwidth-delay product in bytes; seeds the rate and window defaults.
    pub bdp: usize,
    /// Initial (and floor) sending rate, bytes/sec.
    pub initial_rate: f64,
    /// Initial send window in bytes.
    pub initial_window: usize,
    /// Rate-monitor sampling interval in microseconds.
    pub rate_interval_us: u64,
    /// Per-connection backlog pool for datagrams arriving before their
    /// receive is posted.
    pub backlog_size: usize,
    /// ToS of the reliable control sockets.
    pub ctrl_tos: u8,
    /// Readiness-wait timeout for the channel reactors, milliseconds.
    pub poll_timeout_ms: u64,
    /// Readiness event capacity per poll.
    pub poll_events: usize,
    /// Depth of the bounded user-facing request queues.
    pub queue_depth: usize,
}

const DEFAULT_BDP: usize = 400 * 1024;

impl Default for MltConfig {
    fn default() -> Self {
        MltConfig {
            mtu: 1500,
            num_queues: 8,
            bdp: DEFAULT_BDP,
            initial_rate: DEFAULT_BDP as f64,
            initial_window: DEFAULT_BDP * 10_000,
            rate_interval_us: 100,
            backlog_size: 1024 * 1024,
            ctrl_tos: 0xfe,
            poll_timeout_ms: 1000,
            poll_events: 1024,
            queue_depth: 32,
        }
    }
}

impl MltConfig {
    /// Largest datagram the packetizer will emit: MTU minus IP+UDP overhead.
    #[inline]
    pub fn max_segment(&self) -> usize {
        self.mtu - UDP_OVERHEAD
    }

    /// Payload bytes per packet.
    #[inline]
    pub fn payload_bound(&self) -> usize {
        self.max_segment() - DATA_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = MltConfig::default();
        assert_eq!(cfg.mtu, 1500);
        assert_eq!(cfg.max_segment(), 1472);
        assert_eq!(cfg.payload_bound(), 1452);
        assert_eq!(cfg.num_queues, 8);
        assert_eq!(cfg.bdp, 409_600);
        assert_eq!(cfg.initial_rate, 409_600.0);
        assert_eq!(cfg.initial_window, 409_600 * 10_000);
        assert_eq!(cfg.rate_interval_us, 100);
        assert_eq!(cfg.backlog_size, 1 << 20);
        assert_eq!(cfg.ctrl_tos, 0xfe);
    }
}
