//! # mlt-transport
//!
//! MLT pure-Rust loss-tolerant transport protocol.
//!
//! Packed little-endian wire format, bitmap/interval gap tracking with
//! compact missing-range serialization, fixed-MTU packetisation, and
//! per-connection rate metering. A message is delivered once at least
//! `size * (1 - loss_ratio)` of its bytes have arrived; the remainder is
//! recovered through range-based retransmit requests on a reliable side
//! channel.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header and control-signal serialization, framing
//! - [`gap`] — Gap tracker (bitmap and interval-tree variants)
//! - [`packetizer`] — Message → fixed-MTU packet partitioning
//! - [`prio`] — Packet priority functions (ToS/DSCP selection)
//! - [`meter`] — Rate monitors and throughput logging
//! - [`message`] — Per-message send/receive state

pub mod gap;
pub mod message;
pub mod meter;
pub mod packetizer;
pub mod prio;
pub mod wire;
