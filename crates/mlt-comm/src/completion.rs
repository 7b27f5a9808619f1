//! Work completions.
//!
//! Every `post_send` and `post_recv` eventually produces exactly one
//! completion, delivered through an MPSC channel the application holds the
//! receiving end of. Recv completions carry the reassembled buffer back to
//! the caller.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Send,
    Recv,
}

#[derive(Debug)]
pub struct Completion {
    pub msg_id: u32,
    pub kind: CompletionKind,
    pub remote_comm_id: u16,
    /// Bytes sent (Send) or effectively delivered (Recv, always at least
    /// the bound when the protocol succeeds).
    pub bytes: usize,
    /// The message buffer handed to `post_recv`, returned filled.
    pub data: Option<Vec<u8>>,
}
