//! Per-connection state.
//!
//! [`ConnMeta`] holds the genuinely shared pieces (atomics written by one
//! thread, read by another). Everything else is partitioned by owning
//! thread: the priority channel keeps a [`SendState`] per peer, the
//! receiving channel a [`RecvState`], and neither can touch the other's —
//! the partitioning the protocol relies on is enforced by ownership instead
//! of convention.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slab::Slab;

use mlt_transport::message::{RecvMessage, SendMessage};
use mlt_transport::meter::RateMeter;
use mlt_transport::prio::PacketPriority;
use mlt_transport::wire::{Block, DataHeader};

use crate::config::MltConfig;

// ─── ConnMeta ───────────────────────────────────────────────────────────────

/// Shared per-peer metadata. Created when either side completes the control
/// handshake; destroyed only through `remove_connection`, which routes the
/// release through the priority channel.
pub struct ConnMeta {
    pub dest_comm_id: u16,
    /// Bytes/sec, written by the reliable thread on rate-adjust receipt and
    /// read by the priority thread. Relaxed ordering suffices.
    sending_rate: AtomicU64,
    send_window: AtomicUsize,
    /// Floor for the rate-adjust throttle.
    initial_rate: f64,
}

impl ConnMeta {
    pub fn new(dest_comm_id: u16, cfg: &MltConfig) -> Self {
        ConnMeta {
            dest_comm_id,
            sending_rate: AtomicU64::new(cfg.initial_rate.to_bits()),
            send_window: AtomicUsize::new(cfg.initial_window),
            initial_rate: cfg.initial_rate,
        }
    }

    #[inline]
    pub fn sending_rate(&self) -> f64 {
        f64::from_bits(self.sending_rate.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn send_window(&self) -> usize {
        self.send_window.load(Ordering::Relaxed)
    }

    pub fn set_send_window(&self, window: usize) {
        self.send_window.store(window, Ordering::Relaxed);
    }

    /// Apply a receiver-measured rate: clamp down to the throttle when
    /// above it, double otherwise. The throttle never drops below the
    /// initial rate.
    pub fn adjust_rate(&self, received: f64) {
        let current = self.sending_rate();
        let throttle = received.max(self.initial_rate);
        let next = if current > throttle {
            throttle
        } else {
            current * 2.0
        };
        self.sending_rate.store(next.to_bits(), Ordering::Relaxed);
    }
}

/// The communicator's connection map, shared with the channel threads for
/// lifecycle bookkeeping. Critical sections are brief lookups.
pub(crate) type ConnTable = Arc<Mutex<HashMap<u16, Arc<ConnMeta>>>>;

// ─── Registry ───────────────────────────────────────────────────────────────

/// The comm_id → datagram address map populated by `add_connection`.
/// Addresses are written once per peer; reads are brief map lookups.
pub(crate) struct Registry {
    peers: Mutex<HashMap<u16, SocketAddr>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_peer(&self, comm_id: u16, addr: SocketAddr) {
        self.peers.lock().unwrap().insert(comm_id, addr);
    }

    pub fn peer_addr(&self, comm_id: u16) -> Option<SocketAddr> {
        self.peers.lock().unwrap().get(&comm_id).copied()
    }
}

// ─── Send-Side Partition ────────────────────────────────────────────────────

pub(crate) type SendEntry = (SendMessage, Arc<dyn PacketPriority>);

/// Cursor through a retransmit request's blocks: the next sequence to
/// resend, and which block it belongs to.
pub(crate) struct RetransmitCursor {
    pub blocks: Vec<Block>,
    pub block_idx: usize,
    pub seq: u32,
}

impl RetransmitCursor {
    pub fn new(blocks: Vec<Block>) -> Self {
        let seq = blocks[0].first;
        RetransmitCursor {
            blocks,
            block_idx: 0,
            seq,
        }
    }

    /// Whether the cursor points at the last seq of the last block.
    pub fn at_end(&self) -> bool {
        self.block_idx + 1 == self.blocks.len() && self.seq + 1 == self.blocks[self.block_idx].last
    }

    /// Step to the next requested seq. Returns false once exhausted.
    pub fn advance(&mut self) -> bool {
        self.seq += 1;
        if self.seq == self.blocks[self.block_idx].last {
            self.block_idx += 1;
            if self.block_idx == self.blocks.len() {
                return false;
            }
            self.seq = self.blocks[self.block_idx].first;
        }
        true
    }
}

/// Everything the priority channel owns for one peer.
pub(crate) struct SendState {
    pub conn: Arc<ConnMeta>,
    /// Resolved datagram destination, cached from the registry.
    pub addr: Option<SocketAddr>,
    /// msg_id → in-flight message, ordered so round-robin picks the oldest.
    pub sending: BTreeMap<u32, SendEntry>,
    /// Fully sent messages still eligible for retransmission.
    pub retransmitting: BTreeMap<u32, SendEntry>,
    /// msg_id → pending retransmit work.
    pub retransmit_reqs: BTreeMap<u32, RetransmitCursor>,
    pub tx_meter: RateMeter,
}

impl SendState {
    pub fn new(conn: Arc<ConnMeta>, cfg: &MltConfig) -> Self {
        SendState {
            conn,
            addr: None,
            sending: BTreeMap::new(),
            retransmitting: BTreeMap::new(),
            retransmit_reqs: BTreeMap::new(),
            tx_meter: RateMeter::new(cfg.rate_interval_us),
        }
    }
}

// ─── Receive-Side Partition ─────────────────────────────────────────────────

/// Everything the receiving channel owns for one peer.
pub(crate) struct RecvState {
    pub conn: Arc<ConnMeta>,
    pub recv_msgs: HashMap<u32, RecvMessage>,
    pub backlog: Backlog,
    pub rx_meter: RateMeter,
}

impl RecvState {
    pub fn new(conn: Arc<ConnMeta>, cfg: &MltConfig) -> Self {
        RecvState {
            conn,
            recv_msgs: HashMap::new(),
            backlog: Backlog::new(cfg.backlog_size, cfg.max_segment()),
            rx_meter: RateMeter::new(cfg.rate_interval_us),
        }
    }
}

// ─── Backlog ────────────────────────────────────────────────────────────────

/// A datagram staged before its receive was posted.
pub(crate) struct StagedPacket {
    pub header: DataHeader,
    pub payload: Bytes,
}

/// Pre-sized segment pool staging datagrams that arrive ahead of their
/// `post_recv`. One slot per max-segment unit of the configured pool size;
/// a full pool drops, and the retransmit path recovers.
pub(crate) struct Backlog {
    slots: Slab<StagedPacket>,
    capacity: usize,
    used: HashMap<u32, Vec<usize>>,
}

impl Backlog {
    pub fn new(backlog_size: usize, max_segment: usize) -> Self {
        let capacity = backlog_size / max_segment;
        Backlog {
            slots: Slab::with_capacity(capacity),
            capacity,
            used: HashMap::new(),
        }
    }

    /// Stage one datagram. Returns false when the pool is exhausted.
    pub fn stage(&mut self, header: DataHeader, payload: &[u8]) -> bool {
        if self.slots.len() >= self.capacity {
            return false;
        }
        let key = self.slots.insert(StagedPacket {
            header,
            payload: Bytes::copy_from_slice(payload),
        });
        self.used.entry(header.msg_id).or_default().push(key);
        true
    }

    /// Remove and return everything staged for a message, in arrival order.
    pub fn drain(&mut self, msg_id: u32) -> Vec<StagedPacket> {
        self.used
            .remove(&msg_id)
            .unwrap_or_default()
            .into_iter()
            .map(|key| self.slots.remove(key))
            .collect()
    }

    /// Free slots held by a message without returning the packets.
    pub fn discard(&mut self, msg_id: u32) -> usize {
        let keys = self.used.remove(&msg_id).unwrap_or_default();
        let count = keys.len();
        for key in keys {
            self.slots.remove(key);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
