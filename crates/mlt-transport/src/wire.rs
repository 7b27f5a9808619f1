//! # MLT Wire Format
//!
//! Two wire surfaces, both packed little-endian:
//!
//! ## Data datagram (UDP)
//!
//! ```text
//! offset  0        4        8        12     14     16     18   19
//!         +--------+--------+--------+------+------+------+----+---------+
//!         | msg_id | offset |  seq   | len  | dst  | src  |tos | is_last |
//!         |  u32   |  u32   |  u32   | u16  | u16  | u16  | u8 |   u8    |
//!         +--------+--------+--------+------+------+------+----+---------+
//! ```
//!
//! 20 header bytes followed by `len - 20` payload bytes. The layout must be
//! reproduced bit-exactly for interop with other implementations.
//!
//! ## Control frame (TCP)
//!
//! `u32 length` (excluding itself) followed by `length` bytes whose first
//! four are the [`SignalType`] discriminant.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of the packed data-packet header on the wire.
pub const DATA_HEADER_SIZE: usize = 20;

/// IP + UDP overhead subtracted from the MTU to get the max segment.
pub const UDP_OVERHEAD: usize = 28;

/// Size of the control-frame length prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

// ─── Flow Id ────────────────────────────────────────────────────────────────

/// A flow is one `(peer, msg_id)` pair packed into 64 bits.
pub type FlowId = u64;

#[inline]
pub fn encode_flow(dest: u16, msg_id: u32) -> FlowId {
    (u64::from(dest) << 32) | u64::from(msg_id)
}

#[inline]
pub fn decode_flow(flow_id: FlowId) -> (u16, u32) {
    ((flow_id >> 32) as u16, flow_id as u32)
}

// ─── Data Header ────────────────────────────────────────────────────────────

/// Decoded data-packet header — present on every MLT datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Application message id (tensor id).
    pub msg_id: u32,
    /// Byte offset of this packet's payload within the message.
    pub offset: u32,
    /// Packet sequence number, used for retransmission.
    pub seq: u32,
    /// Bytes of the whole packet including this header.
    pub len: u16,
    /// Destination communicator id.
    pub dst_comm_id: u16,
    /// Source communicator id.
    pub src_comm_id: u16,
    /// DSCP||ECN tag the packet was (or will be) sent with.
    pub tos: u8,
    /// Whether this is the last packet of the flow.
    pub is_last: bool,
}

impl DataHeader {
    /// Encode into a buffer. Writes exactly [`DATA_HEADER_SIZE`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.msg_id);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.seq);
        buf.put_u16_le(self.len);
        buf.put_u16_le(self.dst_comm_id);
        buf.put_u16_le(self.src_comm_id);
        buf.put_u8(self.tos);
        buf.put_u8(self.is_last as u8);
    }

    /// Encode onto the stack, for vectored sends.
    pub fn encode_array(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut out = [0u8; DATA_HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode a header. Returns `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < DATA_HEADER_SIZE {
            return None;
        }
        Some(DataHeader {
            msg_id: buf.get_u32_le(),
            offset: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            len: buf.get_u16_le(),
            dst_comm_id: buf.get_u16_le(),
            src_comm_id: buf.get_u16_le(),
            tos: buf.get_u8(),
            is_last: buf.get_u8() != 0,
        })
    }

    /// Payload bytes carried after the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        usize::from(self.len) - DATA_HEADER_SIZE
    }
}

// ─── GradPacket ─────────────────────────────────────────────────────────────

/// A data packet: header plus a ref-counted slice into the message payload.
///
/// The payload handle is in-memory only; on the wire the packet is the
/// 20-byte header immediately followed by the payload bytes.
#[derive(Debug, Clone)]
pub struct GradPacket {
    pub header: DataHeader,
    pub payload: Bytes,
}

impl GradPacket {
    /// Serialize header + payload into one contiguous buffer.
    pub fn encode_datagram(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a complete datagram. Returns `None` on a short or inconsistent
    /// buffer.
    pub fn decode_datagram(buf: &mut impl Buf) -> Option<Self> {
        let header = DataHeader::decode(buf)?;
        if usize::from(header.len) < DATA_HEADER_SIZE || buf.remaining() < header.payload_len() {
            return None;
        }
        let payload = buf.copy_to_bytes(header.payload_len());
        Some(GradPacket { header, payload })
    }
}

impl fmt::Display for GradPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            "{{ msg_id: {}, offset: {}, seq: {}, len: {}, dst: {}, src: {}, tos: {:#04x}, is_last: {} }}",
            h.msg_id, h.offset, h.seq, h.len, h.dst_comm_id, h.src_comm_id, h.tos, h.is_last
        )
    }
}

// ─── Block ──────────────────────────────────────────────────────────────────

/// Half-open interval `[first, last)` of sequence numbers, ordered by
/// `first`. Serialized as two little-endian u32s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    pub first: u32,
    pub last: u32,
}

impl Block {
    /// Serialized size in bytes.
    pub const SIZE: usize = 8;

    pub fn new(first: u32, last: u32) -> Self {
        Block { first, last }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.first);
        buf.put_u32_le(self.last);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        Some(Block {
            first: buf.get_u32_le(),
            last: buf.get_u32_le(),
        })
    }

    /// Number of sequence numbers covered.
    #[inline]
    pub fn len(&self) -> u32 {
        self.last - self.first
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first >= self.last
    }
}

// ─── Signal Type ────────────────────────────────────────────────────────────

/// Control-frame discriminant, first four bytes of every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalType {
    UserData = 0,
    FlowStart = 1,
    RateAdjustment = 2,
    FlowFinish = 3,
    RetransmitRequest = 4,
    StopRequest = 5,
    StopConfirm = 6,
}

impl SignalType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SignalType::UserData),
            1 => Some(SignalType::FlowStart),
            2 => Some(SignalType::RateAdjustment),
            3 => Some(SignalType::FlowFinish),
            4 => Some(SignalType::RetransmitRequest),
            5 => Some(SignalType::StopRequest),
            6 => Some(SignalType::StopConfirm),
            _ => None,
        }
    }
}

// ─── Control Signals ────────────────────────────────────────────────────────

/// Announces a flow so the receiver can prepare reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStart {
    pub msg_id: u32,
    pub flow_size: u32,
    pub max_seq: u32,
}

/// Receiver-measured rate fed back to the sender's throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateAdjustment {
    pub sending_rate: f32,
}

/// The sender has nothing more to send for this flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFinish {
    pub msg_id: u32,
}

/// Missing ranges the receiver wants resent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitRequest {
    pub msg_id: u32,
    pub comm_id: u16,
    pub blocks: Vec<Block>,
}

/// The receiver has met its bound; the sender should tear down the flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopRequest {
    pub msg_id: u32,
    pub comm_id: u16,
    pub sending_rate: f32,
}

/// Sender acknowledgement of a [`StopRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopConfirm {
    pub msg_id: u32,
}

/// A decoded control signal with its typed body.
///
/// The set of signal kinds is closed and small; an exhaustive match replaces
/// any dynamic dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    UserData(Bytes),
    FlowStart(FlowStart),
    RateAdjustment(RateAdjustment),
    FlowFinish(FlowFinish),
    RetransmitRequest(RetransmitRequest),
    StopRequest(StopRequest),
    StopConfirm(StopConfirm),
}

impl Signal {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Signal::UserData(_) => SignalType::UserData,
            Signal::FlowStart(_) => SignalType::FlowStart,
            Signal::RateAdjustment(_) => SignalType::RateAdjustment,
            Signal::FlowFinish(_) => SignalType::FlowFinish,
            Signal::RetransmitRequest(_) => SignalType::RetransmitRequest,
            Signal::StopRequest(_) => SignalType::StopRequest,
            Signal::StopConfirm(_) => SignalType::StopConfirm,
        }
    }

    /// Encoded size of the frame payload (type tag included, prefix not).
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Signal::UserData(data) => data.len(),
            Signal::FlowStart(_) => 12,
            Signal::RateAdjustment(_) => 4,
            Signal::FlowFinish(_) => 4,
            Signal::RetransmitRequest(r) => 8 + 4 + r.blocks.len() * Block::SIZE,
            Signal::StopRequest(_) => 12,
            Signal::StopConfirm(_) => 4,
        }
    }

    /// Encode the frame payload: type tag followed by the body.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.signal_type() as u32);
        match self {
            Signal::UserData(data) => buf.put_slice(data),
            Signal::FlowStart(s) => {
                buf.put_u32_le(s.msg_id);
                buf.put_u32_le(s.flow_size);
                buf.put_u32_le(s.max_seq);
            }
            Signal::RateAdjustment(s) => buf.put_f32_le(s.sending_rate),
            Signal::FlowFinish(s) => buf.put_u32_le(s.msg_id),
            Signal::RetransmitRequest(s) => {
                buf.put_u32_le(s.msg_id);
                buf.put_u32_le(u32::from(s.comm_id));
                buf.put_u32_le(s.blocks.len() as u32);
                for block in &s.blocks {
                    block.encode(buf);
                }
            }
            Signal::StopRequest(s) => {
                buf.put_u32_le(s.msg_id);
                buf.put_u32_le(u32::from(s.comm_id));
                buf.put_f32_le(s.sending_rate);
            }
            Signal::StopConfirm(s) => buf.put_u32_le(s.msg_id),
        }
    }

    /// Encode as a complete length-prefixed frame ready for the control
    /// socket.
    pub fn encode_frame(&self) -> Bytes {
        let body_len = self.encoded_len();
        let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + body_len);
        buf.put_u32_le(body_len as u32);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame payload (without the length prefix). The entire
    /// remaining buffer belongs to this frame; `UserData` consumes all of it.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let ty = SignalType::from_u32(buf.get_u32_le())?;
        match ty {
            SignalType::UserData => {
                let data = buf.copy_to_bytes(buf.remaining());
                Some(Signal::UserData(data))
            }
            SignalType::FlowStart => {
                if buf.remaining() < 12 {
                    return None;
                }
                Some(Signal::FlowStart(FlowStart {
                    msg_id: buf.get_u32_le(),
                    flow_size: buf.get_u32_le(),
                    max_seq: buf.get_u32_le(),
                }))
            }
            SignalType::RateAdjustment => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Signal::RateAdjustment(RateAdjustment {
                    sending_rate: buf.get_f32_le(),
                }))
            }
            SignalType::FlowFinish => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Signal::FlowFinish(FlowFinish {
                    msg_id: buf.get_u32_le(),
                }))
            }
            SignalType::RetransmitRequest => {
                if buf.remaining() < 12 {
                    return None;
                }
                let msg_id = buf.get_u32_le();
                let comm_id = buf.get_u32_le() as u16;
                let num_blocks = buf.get_u32_le() as usize;
                if buf.remaining() < num_blocks * Block::SIZE {
                    return None;
                }
                let mut blocks = Vec::with_capacity(num_blocks);
                for _ in 0..num_blocks {
                    blocks.push(Block::decode(buf)?);
                }
                Some(Signal::RetransmitRequest(RetransmitRequest {
                    msg_id,
                    comm_id,
                    blocks,
                }))
            }
            SignalType::StopRequest => {
                if buf.remaining() < 12 {
                    return None;
                }
                Some(Signal::StopRequest(StopRequest {
                    msg_id: buf.get_u32_le(),
                    comm_id: buf.get_u32_le() as u16,
                    sending_rate: buf.get_f32_le(),
                }))
            }
            SignalType::StopConfirm => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Signal::StopConfirm(StopConfirm {
                    msg_id: buf.get_u32_le(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> DataHeader {
        DataHeader {
            msg_id: 0x0102_0304,
            offset: 0x0506_0708,
            seq: 0x090A_0B0C,
            len: 0x0D0E,
            dst_comm_id: 0x0F10,
            src_comm_id: 0x1112,
            tos: 0x13,
            is_last: true,
        }
    }

    // ─── Data Header ────────────────────────────────────────────────────

    #[test]
    fn header_layout_is_packed_little_endian() {
        let bytes = sample_header().encode_array();
        // msg_id at offset 0, little-endian
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(&bytes[8..12], &[0x0C, 0x0B, 0x0A, 0x09]);
        assert_eq!(&bytes[12..14], &[0x0E, 0x0D]);
        assert_eq!(&bytes[14..16], &[0x10, 0x0F]);
        assert_eq!(&bytes[16..18], &[0x12, 0x11]);
        assert_eq!(bytes[18], 0x13);
        // is_last at offset 19
        assert_eq!(bytes[19], 1);
    }

    #[test]
    fn header_roundtrip() {
        let hdr = sample_header();
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_SIZE);
        let decoded = DataHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn header_decode_short_buffer() {
        let mut buf = Bytes::from_static(&[0u8; 19]);
        assert!(DataHeader::decode(&mut buf).is_none());
    }

    #[test]
    fn datagram_roundtrip() {
        let payload = Bytes::from_static(b"gradients");
        let pkt = GradPacket {
            header: DataHeader {
                msg_id: 7,
                offset: 100,
                seq: 3,
                len: (DATA_HEADER_SIZE + payload.len()) as u16,
                dst_comm_id: 2,
                src_comm_id: 1,
                tos: 0x21,
                is_last: false,
            },
            payload: payload.clone(),
        };
        let wire = pkt.encode_datagram();
        assert_eq!(wire.len(), usize::from(pkt.header.len));
        let decoded = GradPacket::decode_datagram(&mut wire.freeze()).unwrap();
        assert_eq!(decoded.header, pkt.header);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn datagram_decode_rejects_truncated_payload() {
        let pkt = GradPacket {
            header: DataHeader {
                msg_id: 1,
                offset: 0,
                seq: 0,
                len: 30,
                dst_comm_id: 0,
                src_comm_id: 0,
                tos: 0,
                is_last: false,
            },
            payload: Bytes::from_static(b"0123456789"),
        };
        let wire = pkt.encode_datagram();
        let mut truncated = wire.freeze().slice(0..25);
        assert!(GradPacket::decode_datagram(&mut truncated).is_none());
    }

    // ─── Flow Id ────────────────────────────────────────────────────────

    #[test]
    fn flow_id_roundtrip() {
        let id = encode_flow(9, 0xDEAD_BEEF);
        assert_eq!(decode_flow(id), (9, 0xDEAD_BEEF));
    }

    // ─── Signals ────────────────────────────────────────────────────────

    fn roundtrip(signal: Signal) -> Signal {
        let mut buf = BytesMut::new();
        signal.encode(&mut buf);
        assert_eq!(buf.len(), signal.encoded_len());
        Signal::decode(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn flow_start_roundtrip() {
        let sig = Signal::FlowStart(FlowStart {
            msg_id: 12,
            flow_size: 14_000,
            max_seq: 9,
        });
        assert_eq!(roundtrip(sig.clone()), sig);
    }

    #[test]
    fn rate_adjustment_roundtrip() {
        let sig = Signal::RateAdjustment(RateAdjustment {
            sending_rate: 409_600.0,
        });
        assert_eq!(roundtrip(sig.clone()), sig);
    }

    #[test]
    fn retransmit_request_roundtrip() {
        let sig = Signal::RetransmitRequest(RetransmitRequest {
            msg_id: 5,
            comm_id: 3,
            blocks: vec![Block::new(3, 4), Block::new(7, 8)],
        });
        assert_eq!(roundtrip(sig.clone()), sig);
    }

    #[test]
    fn stop_request_and_confirm_roundtrip() {
        let req = Signal::StopRequest(StopRequest {
            msg_id: 8,
            comm_id: 1,
            sending_rate: 0.0,
        });
        assert_eq!(roundtrip(req.clone()), req);

        let confirm = Signal::StopConfirm(StopConfirm { msg_id: 8 });
        assert_eq!(roundtrip(confirm.clone()), confirm);
    }

    #[test]
    fn user_data_consumes_frame_remainder() {
        let sig = Signal::UserData(Bytes::from_static(b"key=value"));
        assert_eq!(roundtrip(sig.clone()), sig);
    }

    #[test]
    fn frame_has_little_endian_length_prefix() {
        let sig = Signal::FlowFinish(FlowFinish { msg_id: 1 });
        let frame = sig.encode_frame();
        assert_eq!(frame.len(), FRAME_PREFIX_SIZE + sig.encoded_len());
        let mut buf = frame.clone();
        let len = buf.get_u32_le() as usize;
        assert_eq!(len, sig.encoded_len());
        assert_eq!(Signal::decode(&mut buf).unwrap(), sig);
    }

    #[test]
    fn unknown_signal_tag_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(42);
        buf.put_u32_le(0);
        assert!(Signal::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn retransmit_request_truncated_blocks_rejected() {
        let sig = Signal::RetransmitRequest(RetransmitRequest {
            msg_id: 1,
            comm_id: 1,
            blocks: vec![Block::new(0, 10)],
        });
        let mut buf = BytesMut::new();
        sig.encode(&mut buf);
        let full = buf.freeze();
        let mut short = full.slice(0..full.len() - 3);
        assert!(Signal::decode(&mut short).is_none());
    }

    // ─── proptest ───────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn proptest_header_roundtrip(
            msg_id in any::<u32>(),
            offset in any::<u32>(),
            seq in any::<u32>(),
            len in (DATA_HEADER_SIZE as u16)..=u16::MAX,
            dst in any::<u16>(),
            src in any::<u16>(),
            tos in any::<u8>(),
            is_last in any::<bool>(),
        ) {
            let hdr = DataHeader {
                msg_id, offset, seq, len,
                dst_comm_id: dst, src_comm_id: src, tos, is_last,
            };
            let mut buf = BytesMut::new();
            hdr.encode(&mut buf);
            prop_assert_eq!(buf.len(), DATA_HEADER_SIZE);
            let decoded = DataHeader::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, hdr);
        }

        #[test]
        fn proptest_retransmit_roundtrip(
            msg_id in any::<u32>(),
            comm_id in any::<u16>(),
            ranges in proptest::collection::vec((0u32..1_000_000, 1u32..500), 0..64),
        ) {
            let blocks: Vec<Block> = ranges
                .iter()
                .map(|&(first, width)| Block::new(first, first + width))
                .collect();
            let sig = Signal::RetransmitRequest(RetransmitRequest {
                msg_id,
                comm_id,
                blocks,
            });
            let mut buf = BytesMut::new();
            sig.encode(&mut buf);
            prop_assert_eq!(buf.len(), sig.encoded_len());
            let decoded = Signal::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, sig);
        }
    }
}
