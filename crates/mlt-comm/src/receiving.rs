//! Receiving channel: the datagram-side reactor.
//!
//! One thread owns the listening UDP socket and all per-connection receive
//! state. Arriving datagrams are demultiplexed into posted reassembly
//! buffers, or staged in the connection backlog when no receive has been
//! posted yet. Crossing the delivery bound emits a StopRequest exactly once;
//! FlowFinish from the peer triggers a retransmit request covering whatever
//! is still missing.
//!
//! Sole mutator of `recv_msgs` and the backlog structures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};

use std::collections::HashMap;

use mlt_transport::gap::Tracker;
use mlt_transport::message::RecvMessage;
use mlt_transport::meter::ThroughputMeter;
use mlt_transport::wire::{
    Block, DataHeader, RateAdjustment, RetransmitRequest, Signal, StopRequest,
};

use crate::completion::{Completion, CompletionKind};
use crate::config::MltConfig;
use crate::conn::{ConnMeta, RecvState};
use crate::supervisor::{Mailbox, Supervisor, WAKER_TOKEN};

const SOCKET_TOKEN: Token = Token(0);

pub(crate) struct RecvRequest {
    pub dest: u16,
    pub msg_id: u32,
    pub buf: Vec<u8>,
    pub loss_ratio: f64,
}

pub(crate) enum RecvNotification {
    AddConnection(Arc<ConnMeta>),
    RemoveConnection(u16),
    FinishFlow {
        src_comm_id: u16,
        msg_id: u32,
        max_seq: u32,
    },
    ConfirmStop {
        src_comm_id: u16,
        msg_id: u32,
    },
}

// ─── Handle ─────────────────────────────────────────────────────────────────

pub(crate) struct ReceivingChannel {
    rr: Mailbox<RecvRequest>,
    notify: Mailbox<RecvNotification>,
    pub supervisor: Supervisor,
}

impl ReceivingChannel {
    pub fn enqueue(&self, req: RecvRequest) {
        self.rr.send(req);
    }

    pub fn notify(&self, n: RecvNotification) {
        self.notify.send(n);
    }

    pub fn notify_handle(&self) -> Mailbox<RecvNotification> {
        self.notify.clone()
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

pub(crate) struct ReceivingWorker {
    cfg: MltConfig,
    comm_id: u16,
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    states: HashMap<u16, RecvState>,
    rr_rx: Receiver<RecvRequest>,
    notify_rx: Receiver<RecvNotification>,
    ctrl: Mailbox<(u16, Signal)>,
    completions: Sender<Completion>,
    meter: ThroughputMeter,
}

pub(crate) fn spawn(
    comm_id: u16,
    cfg: MltConfig,
    mut socket: UdpSocket,
    ctrl: Mailbox<(u16, Signal)>,
    completions: Sender<Completion>,
) -> crate::Result<ReceivingChannel> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    poll.registry()
        .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

    let (rr_tx, rr_rx) = crossbeam_channel::bounded(cfg.queue_depth);
    let (notify_tx, notify_rx) = crossbeam_channel::unbounded();

    let worker = ReceivingWorker {
        events: Events::with_capacity(cfg.poll_events),
        cfg,
        comm_id,
        poll,
        socket,
        states: HashMap::new(),
        rr_rx,
        notify_rx,
        ctrl,
        completions,
        meter: ThroughputMeter::new("receiving_channel", 1000, 0xf),
    };

    let supervisor = Supervisor::spawn("mlt-receiving", waker.clone(), move |terminated| {
        worker.run(terminated)
    })?;

    Ok(ReceivingChannel {
        rr: Mailbox::new(rr_tx, waker.clone()),
        notify: Mailbox::new(notify_tx, waker),
        supervisor,
    })
}

impl ReceivingWorker {
    fn run(mut self, terminated: Arc<AtomicBool>) {
        let local = self.socket.local_addr().ok();
        tracing::info!(?local, "receiving channel running");

        let mut buf = vec![0u8; self.cfg.max_segment()];
        let timeout = Duration::from_millis(self.cfg.poll_timeout_ms);

        while !terminated.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(%err, "receiving poll failed");
                break;
            }

            // Edge-triggered: drain the socket completely.
            loop {
                match self.socket.recv_from(&mut buf) {
                    Ok((nbytes, _from)) => {
                        self.meter.add(nbytes);
                        self.handle_datagram(&buf[..nbytes]);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(%err, "datagram recv failed");
                        break;
                    }
                }
            }

            // Connection lifecycle ahead of the request queue, so a receive
            // posted right after add_connection finds its state.
            self.poll_notifications();
            self.poll_receive_requests();
        }

        tracing::info!("receiving channel terminated");
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let mut cursor = datagram;
        let Some(header) = DataHeader::decode(&mut cursor) else {
            tracing::warn!(len = datagram.len(), "runt datagram dropped");
            return;
        };
        if usize::from(header.len) != datagram.len() {
            tracing::warn!(
                len = header.len,
                datagram = datagram.len(),
                "datagram length disagrees with header, dropped"
            );
            return;
        }
        if header.dst_comm_id != self.comm_id {
            tracing::warn!(
                dst = header.dst_comm_id,
                own = self.comm_id,
                "datagram for another communicator dropped"
            );
            return;
        }

        let src = header.src_comm_id;
        let Some(state) = self.states.get_mut(&src) else {
            tracing::warn!(src, "connection not established or already removed");
            return;
        };
        let payload = cursor;

        // Receive-rate feedback to the sender's throttle.
        state.rx_meter.update(datagram.len());
        if state.rx_meter.elapsed() {
            let rx_speed = state.rx_meter.bytes_per_second();
            tracing::trace!(src, rx_speed, "requesting rate adjustment");
            self.ctrl.send((
                src,
                Signal::RateAdjustment(RateAdjustment {
                    sending_rate: rx_speed as f32,
                }),
            ));
            state.rx_meter.clear();
        }

        let msg_id = header.msg_id;
        let Some(msg) = state.recv_msgs.get_mut(&msg_id) else {
            // No receive posted yet: stage in the backlog, or drop and let
            // the retransmit path recover.
            if state.backlog.stage(header, payload) {
                tracing::trace!(src, msg_id, staged = state.backlog.len(), "datagram staged");
            } else {
                tracing::trace!(src, msg_id, "backlog full, datagram dropped");
            }
            return;
        };

        let copied = msg.copy_payload(&header, payload);
        if copied > 0 && msg.finish_receiving() && !msg.stopped {
            msg.stopped = true;
            send_stop_request(&self.ctrl, self.comm_id, src, msg_id);
        }
    }

    fn poll_receive_requests(&mut self) {
        while let Ok(req) = self.rr_rx.try_recv() {
            let Some(state) = self.states.get_mut(&req.dest) else {
                tracing::warn!(dest = req.dest, "receive posted for unknown connection");
                continue;
            };
            if state.recv_msgs.contains_key(&req.msg_id) {
                tracing::warn!(msg_id = req.msg_id, "receive already posted for msg_id");
                continue;
            }

            let mut msg = RecvMessage::new(req.msg_id, req.buf, req.loss_ratio);
            if msg.bound == 0 {
                tracing::warn!(msg_id = req.msg_id, "message bound is 0");
            }

            // Replay datagrams that arrived ahead of this receive.
            for staged in state.backlog.drain(req.msg_id) {
                msg.copy_payload(&staged.header, &staged.payload);
            }
            if msg.finish_receiving() && !msg.stopped {
                msg.stopped = true;
                send_stop_request(&self.ctrl, self.comm_id, req.dest, req.msg_id);
            }

            state.recv_msgs.insert(req.msg_id, msg);
        }
    }

    fn poll_notifications(&mut self) {
        while let Ok(notification) = self.notify_rx.try_recv() {
            match notification {
                RecvNotification::AddConnection(conn) => {
                    let src = conn.dest_comm_id;
                    if self.states.contains_key(&src) {
                        tracing::debug!(src, "connection already known to receiving channel");
                        continue;
                    }
                    self.states.insert(src, RecvState::new(conn, &self.cfg));
                    tracing::info!(src, "receiving channel added connection");
                }
                RecvNotification::RemoveConnection(src) => {
                    self.states.remove(&src);
                    tracing::info!(src, "receiving channel removed connection");
                }
                RecvNotification::FinishFlow {
                    src_comm_id,
                    msg_id,
                    max_seq,
                } => self.finish_flow(src_comm_id, msg_id, max_seq),
                RecvNotification::ConfirmStop {
                    src_comm_id,
                    msg_id,
                } => self.confirm_stop(src_comm_id, msg_id),
            }
        }
    }

    /// The peer sent everything once. If the bound is still unmet, ask for
    /// the missing ranges; covering `[0, max_seq + 1)` when no receive has
    /// been posted yet.
    fn finish_flow(&mut self, src: u16, msg_id: u32, max_seq: u32) {
        let Some(state) = self.states.get_mut(&src) else {
            tracing::warn!(src, msg_id, "flow finish for unknown connection");
            return;
        };

        let blocks = match state.recv_msgs.get_mut(&msg_id) {
            Some(msg) => {
                tracing::trace!(
                    src,
                    msg_id,
                    bound = msg.bound,
                    received = msg.bytes_received,
                    "flow finished"
                );
                if msg.finish_receiving() {
                    return;
                }
                if msg.tracker.size() <= max_seq {
                    msg.tracker.resize(max_seq + 1);
                }
                if msg.tracker.byte_size() == 0 {
                    return;
                }
                tracing::debug!(
                    src,
                    msg_id,
                    missing = msg.tracker.free_len(),
                    "requesting retransmission"
                );
                msg.tracker.missing_blocks()
            }
            None => vec![Block::new(0, max_seq + 1)],
        };

        self.ctrl.send((
            src,
            Signal::RetransmitRequest(RetransmitRequest {
                msg_id,
                comm_id: self.comm_id,
                blocks,
            }),
        ));
    }

    /// The sender confirmed the stop: complete the receive and hand the
    /// buffer back.
    fn confirm_stop(&mut self, src: u16, msg_id: u32) {
        let Some(state) = self.states.get_mut(&src) else {
            tracing::warn!(src, msg_id, "stop confirm for unknown connection");
            return;
        };
        let Some(msg) = state.recv_msgs.remove(&msg_id) else {
            tracing::warn!(src, msg_id, "stop confirm for unknown receive");
            return;
        };
        // Straggler duplicates may have been staged after completion.
        let discarded = state.backlog.discard(msg_id);
        if discarded > 0 {
            tracing::trace!(src, msg_id, discarded, "freed stale backlog slots");
        }

        if self
            .completions
            .send(Completion {
                msg_id,
                kind: CompletionKind::Recv,
                remote_comm_id: src,
                bytes: msg.bytes_received,
                data: Some(msg.buf),
            })
            .is_err()
        {
            tracing::trace!("completion queue receiver dropped");
        }
    }
}

/// Emit the single StopRequest a satisfied bound is allowed to produce.
fn send_stop_request(ctrl: &Mailbox<(u16, Signal)>, own_comm_id: u16, dest: u16, msg_id: u32) {
    tracing::trace!(dest, msg_id, "bound met, requesting stop");
    ctrl.send((
        dest,
        Signal::StopRequest(StopRequest {
            msg_id,
            comm_id: own_comm_id,
            sending_rate: 0.0,
        }),
    ));
}
