//! # mlt-comm
//!
//! The MLT communicator runtime: a per-connection loss-tolerant message
//! transport for bulk tensor transfer. A sender partitions each message into
//! UDP datagrams sprayed across DSCP/ECN priority sockets; the receiver
//! reassembles whatever arrives, requests retransmission for a bounded loss
//! tolerance over a reliable TCP side channel, and completes the message
//! once `size * (1 - loss_ratio)` bytes are in.
//!
//! Three long-lived threads own the datapath:
//!
//! - the **priority channel** packetizes and paces outgoing messages across
//!   the per-ToS UDP endpoints and services retransmit requests;
//! - the **receiving channel** demultiplexes datagrams into per-message
//!   reassembly buffers and triggers retransmit/stop signalling;
//! - the **reliable channel** frames control signals over TCP and routes
//!   them between peers and the other two threads.
//!
//! [`Communicator`] is the façade tying the three together.

pub mod communicator;
pub mod completion;
pub mod config;

mod conn;
mod ctrl;
mod endpoint;
mod priority;
mod receiving;
mod reliable;
mod supervisor;

pub use communicator::Communicator;
pub use completion::{Completion, CompletionKind};
pub use config::MltConfig;
pub use conn::ConnMeta;
pub use mlt_transport::message::LtMessage;
pub use mlt_transport::prio::{FixedPriority, MagnitudePriority, PacketPriority};

/// Errors surfaced by the communicator's public API.
///
/// Datapath errors never cross threads as values; recovery inside the
/// channel loops is retransmission, and the user-visible failure semantics
/// are the completions themselves.
#[derive(Debug, thiserror::Error)]
pub enum MltError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no connection to peer {0}")]
    UnknownPeer(u16),
    #[error("connection to peer {0} timed out")]
    ConnectTimeout(u16),
    #[error("communicator is shut down")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, MltError>;
