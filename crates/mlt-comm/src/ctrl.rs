//! Reliable control endpoint: a length-prefixed framer over one TCP stream.
//!
//! Outbound buffers are pre-framed and carry a cursor, so a partial send
//! stays at the head of the queue and resumes on the next writable event.
//! Inbound bytes run a two-state machine — four length bytes, then the
//! body — with partial reads retained across readiness events. A zero
//! return from `read` marks the endpoint dead; the reliable channel
//! collects dead endpoints for deregistration.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};

use bytes::Bytes;
use mio::net::TcpStream;
use std::sync::Arc;

use mlt_transport::wire::Signal;

use crate::conn::ConnMeta;

/// Frames larger than this indicate a corrupt or hostile peer.
const MAX_FRAME_LEN: usize = 16 << 20;

struct TxFrame {
    data: Bytes,
    cursor: usize,
}

enum RxState {
    Length { buf: [u8; 4], filled: usize },
    Body { buf: Vec<u8>, filled: usize },
}

impl RxState {
    fn length() -> Self {
        RxState::Length {
            buf: [0; 4],
            filled: 0,
        }
    }
}

pub(crate) struct CtrlEndpoint {
    comm_id: u16,
    pub conn: Arc<ConnMeta>,
    stream: TcpStream,
    tx: VecDeque<TxFrame>,
    rx: RxState,
    dead: bool,
    /// msg_id → max_seq recorded from FlowStart, consumed on FlowFinish and
    /// released on StopConfirm.
    pub msg_max_seq: HashMap<u32, u32>,
}

impl CtrlEndpoint {
    pub fn new(comm_id: u16, stream: TcpStream, conn: Arc<ConnMeta>) -> Self {
        CtrlEndpoint {
            comm_id,
            conn,
            stream,
            tx: VecDeque::new(),
            rx: RxState::length(),
            dead: false,
            msg_max_seq: HashMap::new(),
        }
    }

    #[inline]
    pub fn comm_id(&self) -> u16 {
        self.comm_id
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Queue one pre-framed buffer for transmission.
    pub fn enqueue(&mut self, frame: Bytes) {
        self.tx.push_back(TxFrame {
            data: frame,
            cursor: 0,
        });
    }

    /// Push queued frames until the socket would block or the queue drains.
    pub fn on_send_ready(&mut self) {
        while let Some(front) = self.tx.front_mut() {
            match self.stream.write(&front.data[front.cursor..]) {
                Ok(n) => {
                    front.cursor += n;
                    if front.cursor == front.data.len() {
                        self.tx.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(peer = self.comm_id, %err, "control send failed");
                    self.dead = true;
                    return;
                }
            }
        }
    }

    /// Pull bytes until the socket would block, decoding every completed
    /// frame into a signal.
    pub fn on_recv_ready(&mut self) -> Vec<Signal> {
        let mut signals = Vec::new();
        loop {
            match &mut self.rx {
                RxState::Length { buf, filled } => {
                    match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => {
                            tracing::warn!(peer = self.comm_id, "peer has shut down, disconnecting");
                            self.dead = true;
                            return signals;
                        }
                        Ok(n) => {
                            *filled += n;
                            if *filled == 4 {
                                let len = u32::from_le_bytes(*buf) as usize;
                                if len == 0 || len > MAX_FRAME_LEN {
                                    tracing::warn!(
                                        peer = self.comm_id,
                                        len,
                                        "invalid frame length, disconnecting"
                                    );
                                    self.dead = true;
                                    return signals;
                                }
                                self.rx = RxState::Body {
                                    buf: vec![0; len],
                                    filled: 0,
                                };
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return signals,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            tracing::warn!(peer = self.comm_id, %err, "control recv failed");
                            self.dead = true;
                            return signals;
                        }
                    }
                }
                RxState::Body { buf, filled } => {
                    match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => {
                            tracing::warn!(peer = self.comm_id, "peer has shut down, disconnecting");
                            self.dead = true;
                            return signals;
                        }
                        Ok(n) => {
                            *filled += n;
                            if *filled == buf.len() {
                                let mut body = &buf[..];
                                match Signal::decode(&mut body) {
                                    Some(signal) => signals.push(signal),
                                    None => {
                                        tracing::warn!(
                                            peer = self.comm_id,
                                            "malformed control frame dropped"
                                        );
                                    }
                                }
                                self.rx = RxState::length();
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return signals,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            tracing::warn!(peer = self.comm_id, %err, "control recv failed");
                            self.dead = true;
                            return signals;
                        }
                    }
                }
            }
        }
    }
}
