//! # Packet Priority Functions
//!
//! A priority function maps each outgoing packet to the DSCP||ECN-encoded
//! ToS of the endpoint it should leave through. The returned ToS must have
//! been registered as a priority endpoint; an unregistered value is a
//! configuration error caught at routing time.

use crate::wire::GradPacket;

/// Pluggable per-packet ToS selection.
pub trait PacketPriority: Send + Sync {
    fn priority(&self, pkt: &GradPacket) -> u8;
}

/// Pin every packet of a flow to one ToS.
#[derive(Debug, Clone, Copy)]
pub struct FixedPriority {
    tos: u8,
}

impl FixedPriority {
    pub fn new(tos: u8) -> Self {
        FixedPriority { tos }
    }
}

impl PacketPriority for FixedPriority {
    fn priority(&self, _pkt: &GradPacket) -> u8 {
        self.tos
    }
}

/// Gradient-magnitude priority for f32 tensors.
///
/// The DSCP queue is fixed per layer (earlier layers map to lower queues);
/// the ECN bit marks packets whose sampled gradient magnitude exceeds
/// `theta`, steering high-magnitude chunks onto the less-droppable class.
#[derive(Debug, Clone)]
pub struct MagnitudePriority {
    /// Layer index of the tensor this function prioritizes.
    layer: usize,
    num_layers: usize,
    num_queues: usize,
    /// Magnitude threshold for the ECN mark.
    theta: f32,
    /// How many leading f32 values to sample per packet.
    num_samples: usize,
}

impl MagnitudePriority {
    pub fn new(layer: usize, num_layers: usize, num_queues: usize, theta: f32) -> Self {
        MagnitudePriority {
            layer,
            num_layers: num_layers.max(1),
            num_queues: num_queues.max(1),
            theta,
            num_samples: 10,
        }
    }

    pub fn with_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    /// DSCP for this layer: queue index scaled onto the registered
    /// `dscp = queue * 8` endpoint grid.
    fn dscp(&self) -> u8 {
        let queue = (self.layer * self.num_queues / self.num_layers).min(self.num_queues - 1);
        (queue * 8) as u8
    }

    fn sampled_magnitude(&self, payload: &[u8]) -> f32 {
        payload
            .chunks_exact(4)
            .take(self.num_samples)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]).abs())
            .sum()
    }
}

impl PacketPriority for MagnitudePriority {
    fn priority(&self, pkt: &GradPacket) -> u8 {
        let ecn = u8::from(self.sampled_magnitude(&pkt.payload) > self.theta);
        (self.dscp() << 2) | ecn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DataHeader, DATA_HEADER_SIZE};
    use bytes::Bytes;

    fn packet_of(values: &[f32]) -> GradPacket {
        let mut payload = Vec::new();
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        GradPacket {
            header: DataHeader {
                msg_id: 1,
                offset: 0,
                seq: 0,
                len: (DATA_HEADER_SIZE + payload.len()) as u16,
                dst_comm_id: 2,
                src_comm_id: 1,
                tos: 0,
                is_last: false,
            },
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn fixed_priority_ignores_payload() {
        let prio = FixedPriority::new(0xFE);
        assert_eq!(prio.priority(&packet_of(&[1.0, 2.0])), 0xFE);
        assert_eq!(prio.priority(&packet_of(&[])), 0xFE);
    }

    #[test]
    fn magnitude_sets_ecn_above_theta() {
        let prio = MagnitudePriority::new(0, 8, 8, 1.0);
        // |0.3| + |-0.2| = 0.5 <= theta
        assert_eq!(prio.priority(&packet_of(&[0.3, -0.2])) & 1, 0);
        // |2.0| + |-1.5| = 3.5 > theta
        assert_eq!(prio.priority(&packet_of(&[2.0, -1.5])) & 1, 1);
    }

    #[test]
    fn magnitude_scales_layer_onto_queue_grid() {
        let num_layers = 228;
        let num_queues = 8;
        let first = MagnitudePriority::new(0, num_layers, num_queues, 1.0);
        let last = MagnitudePriority::new(num_layers - 1, num_layers, num_queues, 1.0);

        assert_eq!(first.priority(&packet_of(&[0.0])) >> 2, 0);
        assert_eq!(last.priority(&packet_of(&[0.0])) >> 2, 7 * 8);
    }

    #[test]
    fn magnitude_samples_leading_values_only() {
        let prio = MagnitudePriority::new(0, 8, 8, 1.0).with_samples(2);
        // The large value beyond the sample window is not observed.
        let pkt = packet_of(&[0.1, 0.1, 100.0]);
        assert_eq!(prio.priority(&pkt) & 1, 0);
    }
}
