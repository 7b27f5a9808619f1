//! Priority channel: the send-side reactor.
//!
//! One thread owns every priority UDP endpoint and all per-connection send
//! state. Each loop iteration waits for readiness (bounded), drains writable
//! endpoints, pulls new send requests, runs up to [`SEND_ROUNDS`] pacing
//! rounds round-robining one packet per connection under the rate throttle,
//! walks pending retransmit requests, and finally applies notifications.
//!
//! Sole mutator of `sending`, `retransmitting`, and `retransmit_reqs` for
//! every connection it manages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use mlt_transport::message::{LtMessage, SendMessage};
use mlt_transport::meter::ThroughputMeter;
use mlt_transport::packetizer::Packetizer;
use mlt_transport::prio::PacketPriority;
use mlt_transport::wire::{
    decode_flow, FlowFinish, FlowId, GradPacket, RetransmitRequest, Signal, StopConfirm,
};

use crate::completion::{Completion, CompletionKind};
use crate::config::MltConfig;
use crate::conn::{ConnMeta, ConnTable, Registry, RetransmitCursor, SendState};
use crate::endpoint::UdpPrioEndpoint;
use crate::supervisor::{Mailbox, Supervisor, WAKER_TOKEN};

/// Pacing rounds per loop iteration.
const SEND_ROUNDS: usize = 100;

/// Poll timeout while connections still have queued or unpaced work.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) struct SendRequest {
    pub dest: u16,
    pub msg: LtMessage,
    pub prio: Arc<dyn PacketPriority>,
}

pub(crate) enum PrioNotification {
    AddConnection(Arc<ConnMeta>),
    RemoveConnection(u16),
    StopFlow(FlowId),
    RequestRetransmit(RetransmitRequest),
}

// ─── Handle ─────────────────────────────────────────────────────────────────

pub(crate) struct PriorityChannel {
    sr: Mailbox<SendRequest>,
    notify: Mailbox<PrioNotification>,
    pub supervisor: Supervisor,
}

impl PriorityChannel {
    pub fn enqueue(&self, req: SendRequest) {
        self.sr.send(req);
    }

    pub fn notify(&self, n: PrioNotification) {
        self.notify.send(n);
    }

    pub fn notify_handle(&self) -> Mailbox<PrioNotification> {
        self.notify.clone()
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

pub(crate) struct PriorityWorker {
    cfg: MltConfig,
    poll: Poll,
    events: Events,
    endpoints: Vec<UdpPrioEndpoint>,
    /// ToS → index into `endpoints`.
    prio_map: [Option<usize>; 256],
    /// Round-robin order of connections.
    order: Vec<u16>,
    states: HashMap<u16, SendState>,
    registry: Arc<Registry>,
    conn_table: ConnTable,
    packetizer: Packetizer,
    sr_rx: Receiver<SendRequest>,
    notify_rx: Receiver<PrioNotification>,
    ctrl: Mailbox<(u16, Signal)>,
    completions: Sender<Completion>,
    meter: ThroughputMeter,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    comm_id: u16,
    cfg: MltConfig,
    endpoints: Vec<UdpPrioEndpoint>,
    registry: Arc<Registry>,
    conn_table: ConnTable,
    ctrl: Mailbox<(u16, Signal)>,
    completions: Sender<Completion>,
) -> crate::Result<PriorityChannel> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    let mut prio_map = [None; 256];
    for (idx, endpoint) in endpoints.iter().enumerate() {
        let tos = endpoint.tos() as usize;
        assert!(prio_map[tos].is_none(), "duplicate endpoint for ToS {tos:#04x}");
        prio_map[tos] = Some(idx);
        poll.registry().register(
            &mut SourceFd(&endpoint.raw_fd()),
            Token(idx),
            Interest::WRITABLE,
        )?;
    }

    let (sr_tx, sr_rx) = crossbeam_channel::bounded(cfg.queue_depth);
    let (notify_tx, notify_rx) = crossbeam_channel::unbounded();

    let worker = PriorityWorker {
        events: Events::with_capacity(cfg.poll_events),
        packetizer: Packetizer::new(comm_id, cfg.mtu),
        cfg,
        poll,
        endpoints,
        prio_map,
        order: Vec::new(),
        states: HashMap::new(),
        registry,
        conn_table,
        sr_rx,
        notify_rx,
        ctrl,
        completions,
        meter: ThroughputMeter::new("priority_channel", 1000, 0xff),
    };

    let supervisor = Supervisor::spawn("mlt-priority", waker.clone(), move |terminated| {
        worker.run(terminated)
    })?;

    Ok(PriorityChannel {
        sr: Mailbox::new(sr_tx, waker.clone()),
        notify: Mailbox::new(notify_tx, waker),
        supervisor,
    })
}

impl PriorityWorker {
    fn run(mut self, terminated: Arc<AtomicBool>) {
        tracing::info!(endpoints = self.endpoints.len(), "priority channel running");

        while !terminated.load(Ordering::Relaxed) {
            let timeout = if self.has_pending_work() {
                BUSY_TIMEOUT
            } else {
                Duration::from_millis(self.cfg.poll_timeout_ms)
            };
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(%err, "priority poll failed");
                break;
            }

            // Writable endpoints drain first.
            for event in self.events.iter() {
                let Token(idx) = event.token();
                if idx < self.endpoints.len() && event.is_writable() {
                    self.endpoints[idx].drain();
                }
            }

            // Connection lifecycle ahead of the request queues, so a send
            // posted right after add_connection finds its state.
            self.poll_notifications();
            self.poll_send_requests();

            for _ in 0..SEND_ROUNDS {
                let mut sent = self.poll_sending_messages();
                sent += self.poll_retransmit_requests();
                if sent == 0 {
                    break;
                }
            }

            // Readiness is edge-triggered: packets queued this iteration are
            // pushed now rather than waiting for the next writable edge.
            for endpoint in &mut self.endpoints {
                endpoint.drain();
            }
        }

        tracing::info!("priority channel terminated");
    }

    fn has_pending_work(&self) -> bool {
        self.endpoints.iter().any(|e| e.queued() > 0)
            || self
                .states
                .values()
                .any(|s| !s.sending.is_empty() || !s.retransmit_reqs.is_empty())
    }

    fn poll_send_requests(&mut self) {
        while let Ok(req) = self.sr_rx.try_recv() {
            let msg_id = req.msg.msg_id;
            let Some(state) = self.states.get_mut(&req.dest) else {
                tracing::warn!(dest = req.dest, msg_id, "send request for unknown connection");
                continue;
            };
            if state.sending.contains_key(&msg_id) || state.retransmitting.contains_key(&msg_id) {
                tracing::warn!(dest = req.dest, msg_id, "msg_id is already sending");
                continue;
            }
            tracing::trace!(dest = req.dest, msg_id, "send request accepted");
            state
                .sending
                .insert(msg_id, (SendMessage::new(req.msg), req.prio));
        }
    }

    /// One round-robin pass: at most one packet per connection.
    fn poll_sending_messages(&mut self) -> usize {
        let mut bytes = 0;
        for i in 0..self.order.len() {
            let dest = self.order[i];
            let Some(state) = self.states.get_mut(&dest) else {
                continue;
            };
            let Some((&msg_id, _)) = state.sending.first_key_value() else {
                continue;
            };

            let (msg, prio) = state.sending.get_mut(&msg_id).unwrap();
            let nbytes = self.packetizer.next_packet_len(msg);
            if state.tx_meter.try_bytes_per_second(nbytes) > state.conn.sending_rate() {
                continue;
            }

            let pkt = self.packetizer.partition_one(dest, msg, prio.as_ref());
            let is_last = pkt.header.is_last;
            let len = usize::from(pkt.header.len);

            if state.tx_meter.elapsed() {
                state.tx_meter.clear();
            }
            state.tx_meter.update(nbytes);

            if msg.fully_sent() {
                // Eligible for retransmits until the peer's StopRequest.
                let entry = state.sending.remove(&msg_id).unwrap();
                state.retransmitting.insert(msg_id, entry);
            }

            let addr = Self::resolve_addr(&self.registry, state, dest);
            self.route_packet(addr, pkt, is_last);
            self.meter.add(len);
            bytes += len;
        }
        bytes
    }

    /// One retransmit pass: at most one requested packet per connection.
    fn poll_retransmit_requests(&mut self) -> usize {
        let mut bytes = 0;
        for i in 0..self.order.len() {
            let dest = self.order[i];
            let Some(state) = self.states.get_mut(&dest) else {
                continue;
            };
            let Some((&msg_id, _)) = state.retransmit_reqs.first_key_value() else {
                continue;
            };

            let Some((msg, prio)) = state
                .retransmitting
                .get(&msg_id)
                .or_else(|| state.sending.get(&msg_id))
            else {
                // The flow raced a StopRequest; recovery is the receiver's
                // bound, not this request.
                tracing::warn!(dest, msg_id, "retransmit request for a flow no longer held");
                state.retransmit_reqs.remove(&msg_id);
                continue;
            };

            let cursor = state.retransmit_reqs.get(&msg_id).unwrap();
            let seq = cursor.seq;
            let nbytes = self.packetizer.packet_len_by_seq(msg.size(), seq);
            if state.tx_meter.try_bytes_per_second(nbytes) > state.conn.sending_rate() {
                continue;
            }

            let pkt = self
                .packetizer
                .partition_one_by_seq(dest, msg, prio.as_ref(), seq);
            let len = usize::from(pkt.header.len);

            let cursor = state.retransmit_reqs.get_mut(&msg_id).unwrap();
            let is_finished = cursor.at_end();
            tracing::trace!(dest, msg_id, seq, is_finished, "retransmitting");
            if !cursor.advance() {
                state.retransmit_reqs.remove(&msg_id);
            }

            if state.tx_meter.elapsed() {
                state.tx_meter.clear();
            }
            state.tx_meter.update(nbytes);

            let addr = Self::resolve_addr(&self.registry, state, dest);
            self.route_packet(addr, pkt, is_finished);
            self.meter.add(len);
            bytes += len;
        }
        bytes
    }

    fn resolve_addr(
        registry: &Registry,
        state: &mut SendState,
        dest: u16,
    ) -> Option<SocketAddr> {
        if state.addr.is_none() {
            state.addr = registry.peer_addr(dest);
        }
        state.addr
    }

    /// Steer a packet to the endpoint whose ToS matches, and announce the
    /// flow's end on the reliable channel when this was its last packet.
    fn route_packet(&mut self, addr: Option<SocketAddr>, pkt: GradPacket, is_finished: bool) {
        let dest = pkt.header.dst_comm_id;
        let msg_id = pkt.header.msg_id;
        let tos = pkt.header.tos;

        let Some(addr) = addr else {
            tracing::warn!(dest, msg_id, "no datagram address registered for peer, dropping");
            return;
        };
        let idx = self.prio_map[tos as usize]
            .unwrap_or_else(|| panic!("ToS {tos:#04x} has no registered priority endpoint"));
        let endpoint = &mut self.endpoints[idx];
        if endpoint.is_degraded() {
            tracing::warn!(tos, "routing through degraded endpoint");
        }
        endpoint.enqueue(addr, pkt);

        if is_finished {
            self.ctrl
                .send((dest, Signal::FlowFinish(FlowFinish { msg_id })));
        }
    }

    fn poll_notifications(&mut self) {
        while let Ok(notification) = self.notify_rx.try_recv() {
            match notification {
                PrioNotification::AddConnection(conn) => {
                    let dest = conn.dest_comm_id;
                    if self.states.contains_key(&dest) {
                        tracing::debug!(dest, "connection already known to priority channel");
                        continue;
                    }
                    self.states.insert(dest, SendState::new(conn, &self.cfg));
                    self.order.push(dest);
                    tracing::info!(dest, "priority channel added connection");
                }
                PrioNotification::RemoveConnection(dest) => {
                    self.states.remove(&dest);
                    self.order.retain(|&id| id != dest);
                    // Release the owning reference on the channel that owns
                    // the sending state; lookups elsewhere stay brief.
                    self.conn_table.lock().unwrap().remove(&dest);
                    tracing::info!(dest, "priority channel removed connection");
                }
                PrioNotification::StopFlow(flow_id) => self.stop_flow(flow_id),
                PrioNotification::RequestRetransmit(req) => {
                    if req.blocks.is_empty() {
                        tracing::warn!(msg_id = req.msg_id, "empty retransmit request dropped");
                        continue;
                    }
                    let Some(state) = self.states.get_mut(&req.comm_id) else {
                        tracing::warn!(dest = req.comm_id, "retransmit request for unknown connection");
                        continue;
                    };
                    tracing::trace!(
                        dest = req.comm_id,
                        msg_id = req.msg_id,
                        blocks = req.blocks.len(),
                        "retransmit request installed"
                    );
                    state
                        .retransmit_reqs
                        .insert(req.msg_id, RetransmitCursor::new(req.blocks));
                }
            }
        }
    }

    /// Tear down all sending state for a flow, confirm to the peer, and
    /// complete the send.
    fn stop_flow(&mut self, flow_id: FlowId) {
        let (dest, msg_id) = decode_flow(flow_id);
        let Some(state) = self.states.get_mut(&dest) else {
            tracing::warn!(dest, msg_id, "stop for unknown connection");
            return;
        };

        let mut bytes_sent = 0;
        if let Some((msg, _)) = state.sending.remove(&msg_id) {
            bytes_sent = msg.bytes_sent;
            tracing::trace!(dest, msg_id, "removed from sending messages");
        } else {
            if state.retransmit_reqs.remove(&msg_id).is_some() {
                tracing::trace!(dest, msg_id, "removed from retransmit requests");
            }
            if let Some((msg, _)) = state.retransmitting.remove(&msg_id) {
                bytes_sent = msg.bytes_sent;
                tracing::trace!(dest, msg_id, "removed from retransmitting messages");
            }
        }

        self.ctrl
            .send((dest, Signal::StopConfirm(StopConfirm { msg_id })));

        if self
            .completions
            .send(Completion {
                msg_id,
                kind: CompletionKind::Send,
                remote_comm_id: dest,
                bytes: bytes_sent,
                data: None,
            })
            .is_err()
        {
            tracing::trace!("completion queue receiver dropped");
        }
    }
}
