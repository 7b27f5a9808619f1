//! # Packetizer
//!
//! Splits a message into fixed-MTU packets and rebuilds arbitrary packets by
//! sequence number for retransmission. Pure logic: routing a packet to its
//! priority endpoint is the priority channel's job.
//!
//! Every payload is a ref-counted slice of the message body; partitioning
//! never copies gradient bytes.

use crate::message::{LtMessage, SendMessage};
use crate::prio::PacketPriority;
use crate::wire::{DataHeader, GradPacket, DATA_HEADER_SIZE, UDP_OVERHEAD};

pub struct Packetizer {
    src_comm_id: u16,
    /// Payload bytes per packet: `mtu - 28 - 20`.
    payload_bound: usize,
}

impl Packetizer {
    pub fn new(src_comm_id: u16, mtu: usize) -> Self {
        let max_segment = mtu - UDP_OVERHEAD;
        Packetizer {
            src_comm_id,
            payload_bound: max_segment - DATA_HEADER_SIZE,
        }
    }

    #[inline]
    pub fn payload_bound(&self) -> usize {
        self.payload_bound
    }

    /// Highest sequence number of a message: number of packets minus one.
    pub fn max_seq(&self, size: usize) -> u32 {
        (size.div_ceil(self.payload_bound).max(1) - 1) as u32
    }

    /// Wire length of the next packet `partition_one` would emit, for the
    /// rate throttle's lookahead.
    pub fn next_packet_len(&self, msg: &SendMessage) -> usize {
        (msg.size() - msg.bytes_sent).min(self.payload_bound) + DATA_HEADER_SIZE
    }

    /// Wire length of the packet at `seq` within a message of `size` bytes.
    pub fn packet_len_by_seq(&self, size: usize, seq: u32) -> usize {
        let offset = seq as usize * self.payload_bound;
        (size - offset).min(self.payload_bound) + DATA_HEADER_SIZE
    }

    /// Consume the next `payload_bound` bytes of the message into a packet,
    /// advancing the send cursor.
    pub fn partition_one(
        &self,
        dest: u16,
        msg: &mut SendMessage,
        prio: &dyn PacketPriority,
    ) -> GradPacket {
        let offset = msg.bytes_sent;
        let mut pkt = self.build(dest, msg.msg_id, &msg.data, offset);
        pkt.header.tos = prio.priority(&pkt);
        msg.bytes_sent = offset + pkt.payload.len();
        pkt
    }

    /// Rebuild the packet at `offset = seq * payload_bound` without touching
    /// the send cursor. Used to service retransmit requests.
    pub fn partition_one_by_seq(
        &self,
        dest: u16,
        msg: &SendMessage,
        prio: &dyn PacketPriority,
        seq: u32,
    ) -> GradPacket {
        let offset = seq as usize * self.payload_bound;
        let mut pkt = self.build(dest, msg.msg_id, &msg.data, offset);
        pkt.header.tos = prio.priority(&pkt);
        pkt
    }

    /// Enumerate every packet of a message in ascending sequence order.
    pub fn partition_all(
        &self,
        dest: u16,
        msg: &LtMessage,
        prio: &dyn PacketPriority,
    ) -> Vec<GradPacket> {
        let mut state = SendMessage::new(msg.clone());
        let mut packets = Vec::with_capacity(self.max_seq(state.size()) as usize + 1);
        while !state.fully_sent() {
            packets.push(self.partition_one(dest, &mut state, prio));
        }
        packets
    }

    fn build(&self, dest: u16, msg_id: u32, data: &bytes::Bytes, offset: usize) -> GradPacket {
        let size = data.len();
        debug_assert!(offset < size, "offset {} beyond message of {}", offset, size);
        let payload_len = (size - offset).min(self.payload_bound);
        let header = DataHeader {
            msg_id,
            offset: offset as u32,
            seq: (offset / self.payload_bound) as u32,
            len: (payload_len + DATA_HEADER_SIZE) as u16,
            dst_comm_id: dest,
            src_comm_id: self.src_comm_id,
            tos: 0,
            is_last: offset + payload_len == size,
        };
        GradPacket {
            header,
            payload: data.slice(offset..offset + payload_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prio::FixedPriority;
    use bytes::Bytes;

    const MTU: usize = 1500;
    const BOUND: usize = MTU - UDP_OVERHEAD - DATA_HEADER_SIZE; // 1452

    fn packetizer() -> Packetizer {
        Packetizer::new(1, MTU)
    }

    fn message(size: usize) -> LtMessage {
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        LtMessage::new(42, Bytes::from(data))
    }

    #[test]
    fn payload_bound_subtracts_overheads() {
        assert_eq!(packetizer().payload_bound(), 1452);
    }

    #[test]
    fn max_seq_is_packet_count_minus_one() {
        let p = packetizer();
        assert_eq!(p.max_seq(1), 0);
        assert_eq!(p.max_seq(BOUND), 0);
        assert_eq!(p.max_seq(BOUND + 1), 1);
        assert_eq!(p.max_seq(14_000), 9);
    }

    #[test]
    fn partition_covers_message_in_order() {
        let p = packetizer();
        let msg = message(14_000);
        let packets = p.partition_all(2, &msg, &FixedPriority::new(0x21));

        assert_eq!(packets.len(), 10);
        for (i, pkt) in packets.iter().enumerate() {
            assert_eq!(pkt.header.seq, i as u32);
            assert_eq!(pkt.header.offset as usize, i * BOUND);
            assert_eq!(pkt.header.msg_id, 42);
            assert_eq!(pkt.header.dst_comm_id, 2);
            assert_eq!(pkt.header.src_comm_id, 1);
            assert_eq!(pkt.header.tos, 0x21);
            assert_eq!(pkt.header.is_last, i == 9);
        }
        // First nine full, last carries the remainder.
        assert_eq!(packets[0].payload.len(), BOUND);
        assert_eq!(packets[9].payload.len(), 14_000 - 9 * BOUND);

        let total: usize = packets.iter().map(|p| p.payload.len()).sum();
        assert_eq!(total, 14_000);
    }

    #[test]
    fn partition_one_advances_cursor() {
        let p = packetizer();
        let mut state = SendMessage::new(message(14_000));
        let prio = FixedPriority::new(0);

        assert_eq!(p.next_packet_len(&state), BOUND + DATA_HEADER_SIZE);
        let first = p.partition_one(2, &mut state, &prio);
        assert_eq!(first.header.seq, 0);
        assert_eq!(state.bytes_sent, BOUND);

        for _ in 0..8 {
            p.partition_one(2, &mut state, &prio);
        }
        assert_eq!(p.next_packet_len(&state), 14_000 - 9 * BOUND + DATA_HEADER_SIZE);
        let last = p.partition_one(2, &mut state, &prio);
        assert!(last.header.is_last);
        assert!(state.fully_sent());
    }

    #[test]
    fn partition_by_seq_rebuilds_identical_packet() {
        let p = packetizer();
        let msg = message(14_000);
        let prio = FixedPriority::new(0x08);
        let packets = p.partition_all(2, &msg, &prio);

        let state = SendMessage::new(msg);
        for seq in [0u32, 3, 7, 9] {
            let rebuilt = p.partition_one_by_seq(2, &state, &prio, seq);
            assert_eq!(rebuilt.header, packets[seq as usize].header);
            assert_eq!(rebuilt.payload, packets[seq as usize].payload);
        }
    }

    #[test]
    fn single_packet_message_is_last() {
        let p = packetizer();
        let packets = p.partition_all(2, &message(100), &FixedPriority::new(0));
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.is_last);
        assert_eq!(packets[0].payload.len(), 100);
    }
}
