//! # Per-Message Transfer State
//!
//! A loss-tolerant message is identified by an application-level `msg_id`.
//! The send side hands the transport a ref-counted payload; the receive side
//! hands it an owned buffer which is returned, filled, through the Recv
//! completion once the delivery bound is met.

use bytes::Bytes;

use crate::gap::{GapTracker, Tracker};
use crate::wire::DataHeader;

/// Element width the delivery bound is aligned to (f32 gradients).
pub const ELEMENT_SIZE: usize = 4;

/// Round `value` up to a multiple of `alignment`.
#[inline]
pub fn align_up(alignment: usize, value: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

// ─── Send Side ──────────────────────────────────────────────────────────────

/// A message handed to `post_send`: id plus the payload to spray.
#[derive(Debug, Clone)]
pub struct LtMessage {
    pub msg_id: u32,
    pub data: Bytes,
}

impl LtMessage {
    pub fn new(msg_id: u32, data: Bytes) -> Self {
        LtMessage { msg_id, data }
    }
}

/// Sender-side transfer state: the payload plus a send cursor.
///
/// Owned by the priority channel from enqueue until the peer's StopRequest
/// tears the flow down.
#[derive(Debug)]
pub struct SendMessage {
    pub msg_id: u32,
    pub data: Bytes,
    /// Bytes already consumed by `partition_one`.
    pub bytes_sent: usize,
}

impl SendMessage {
    pub fn new(msg: LtMessage) -> Self {
        SendMessage {
            msg_id: msg.msg_id,
            data: msg.data,
            bytes_sent: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether every byte has been partitioned at least once.
    #[inline]
    pub fn fully_sent(&self) -> bool {
        self.bytes_sent >= self.data.len()
    }
}

// ─── Receive Side ───────────────────────────────────────────────────────────

/// Receiver-side reassembly state for one message.
///
/// Owned by the receiving channel from `post_recv` until StopConfirm, at
/// which point `buf` travels back to the application inside the completion.
pub struct RecvMessage {
    pub msg_id: u32,
    pub buf: Vec<u8>,
    pub bytes_received: usize,
    /// Delivery threshold: `align_up(4, size * (1 - loss_ratio))`.
    pub bound: usize,
    /// Set once the bound is met and a StopRequest has been emitted.
    pub stopped: bool,
    pub tracker: GapTracker,
}

impl RecvMessage {
    pub fn new(msg_id: u32, buf: Vec<u8>, loss_ratio: f64) -> Self {
        let size = buf.len();
        let bound = align_up(ELEMENT_SIZE, (size as f64 * (1.0 - loss_ratio)) as usize);
        RecvMessage {
            msg_id,
            buf,
            bytes_received: 0,
            bound,
            stopped: false,
            tracker: GapTracker::default(),
        }
    }

    /// Copy one packet's payload into the message buffer.
    ///
    /// Returns the number of bytes freshly copied: 0 when the sequence was
    /// already taken. A payload that would overrun the buffer is a protocol
    /// invariant violation and aborts.
    pub fn copy_payload(&mut self, header: &DataHeader, payload: &[u8]) -> usize {
        let seq = header.seq;
        if seq >= self.tracker.size() {
            self.tracker.resize(seq + 1);
        }
        if self.tracker.check(seq) {
            return 0;
        }
        self.tracker.take(seq);

        let grad_bytes = header.payload_len();
        assert_eq!(grad_bytes, payload.len(), "len field disagrees with datagram");
        let offset = header.offset as usize;
        assert!(
            offset + grad_bytes <= self.buf.len(),
            "offset {} + {} bytes overruns message of {}",
            offset,
            grad_bytes,
            self.buf.len()
        );

        self.buf[offset..offset + grad_bytes].copy_from_slice(payload);
        self.bytes_received += grad_bytes;
        grad_bytes
    }

    /// Whether enough bytes have arrived to satisfy the bound.
    #[inline]
    pub fn finish_receiving(&self) -> bool {
        self.bytes_received >= self.bound
    }
}
