//! Reliable channel: the control-plane reactor.
//!
//! One thread owns the TCP listener and one [`CtrlEndpoint`] per peer. On
//! accept, the passive side reads the peer's 4-byte comm_id before any frame
//! flows, builds the connection metadata, and announces the connection to
//! the datapath channels. Outbound control buffers are pulled from a
//! thread-safe queue, framed, and flushed eagerly; dead endpoints are
//! collected and deregistered at the top of the next iteration.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use mlt_transport::wire::{encode_flow, Signal};

use crate::config::MltConfig;
use crate::conn::{ConnMeta, ConnTable};
use crate::ctrl::CtrlEndpoint;
use crate::endpoint::set_tos;
use crate::priority::PrioNotification;
use crate::receiving::RecvNotification;
use crate::supervisor::{Mailbox, Supervisor, WAKER_TOKEN};

const LISTENER_TOKEN: Token = Token(0);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum CtrlNotification {
    /// A connect-side endpoint: the stream has already carried our comm_id.
    AddEndpoint {
        comm_id: u16,
        stream: std::net::TcpStream,
        conn: Arc<ConnMeta>,
    },
    RemoveEndpoint(u16),
}

// ─── Handle ─────────────────────────────────────────────────────────────────

pub(crate) struct ReliableChannel {
    tx: Mailbox<(u16, Signal)>,
    notify: Mailbox<CtrlNotification>,
    pub supervisor: Supervisor,
}

impl ReliableChannel {
    /// Route one control signal to the peer's endpoint.
    pub fn enqueue(&self, dest: u16, signal: Signal) {
        self.tx.send((dest, signal));
    }

    pub fn notify(&self, n: CtrlNotification) {
        self.notify.send(n);
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct ReliableWorker {
    cfg: MltConfig,
    comm_id: u16,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    endpoints: HashMap<Token, CtrlEndpoint>,
    by_comm: HashMap<u16, Token>,
    next_token: usize,
    /// Dead endpoints awaiting deregistration.
    gc: Vec<Token>,
    tx_rx: Receiver<(u16, Signal)>,
    notify_rx: Receiver<CtrlNotification>,
    prio_notify: Mailbox<PrioNotification>,
    recv_notify: Mailbox<RecvNotification>,
    meta_tx: Sender<(u16, Bytes)>,
    conn_table: ConnTable,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    comm_id: u16,
    cfg: MltConfig,
    poll: Poll,
    waker: Arc<Waker>,
    tx_rx: Receiver<(u16, Signal)>,
    tx_mailbox: Mailbox<(u16, Signal)>,
    notify_rx: Receiver<CtrlNotification>,
    notify_mailbox: Mailbox<CtrlNotification>,
    mut listener: TcpListener,
    prio_notify: Mailbox<PrioNotification>,
    recv_notify: Mailbox<RecvNotification>,
    meta_tx: Sender<(u16, Bytes)>,
    conn_table: ConnTable,
) -> crate::Result<ReliableChannel> {
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let worker = ReliableWorker {
        events: Events::with_capacity(cfg.poll_events),
        cfg,
        comm_id,
        poll,
        listener,
        endpoints: HashMap::new(),
        by_comm: HashMap::new(),
        next_token: 1,
        gc: Vec::new(),
        tx_rx,
        notify_rx,
        prio_notify,
        recv_notify,
        meta_tx,
        conn_table,
    };

    let supervisor = Supervisor::spawn("mlt-reliable", waker, move |terminated| {
        worker.run(terminated)
    })?;

    Ok(ReliableChannel {
        tx: tx_mailbox,
        notify: notify_mailbox,
        supervisor,
    })
}

impl ReliableWorker {
    fn run(mut self, terminated: Arc<AtomicBool>) {
        let local = self.listener.local_addr().ok();
        tracing::info!(comm_id = self.comm_id, ?local, "reliable channel listening");

        let timeout = Duration::from_millis(self.cfg.poll_timeout_ms);

        while !terminated.load(Ordering::Relaxed) {
            self.collect_garbage();

            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(%err, "reliable poll failed");
                break;
            }

            let tokens: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                match token {
                    LISTENER_TOKEN => self.accept_pending(),
                    WAKER_TOKEN => {}
                    _ => self.service_endpoint(token, readable, writable),
                }
            }

            self.poll_notifications();
            self.poll_outbound();
        }

        tracing::info!("reliable channel terminated");
    }

    /// Deregister endpoints that died last iteration.
    fn collect_garbage(&mut self) {
        for token in std::mem::take(&mut self.gc) {
            if let Some(mut endpoint) = self.endpoints.remove(&token) {
                let comm_id = endpoint.comm_id();
                self.by_comm.remove(&comm_id);
                if let Err(err) = self.poll.registry().deregister(endpoint.stream_mut()) {
                    tracing::warn!(%err, "failed to deregister dead endpoint");
                }
                tracing::info!(peer = comm_id, "control endpoint removed");
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = self.handle_new_connection(stream) {
                        tracing::warn!(%peer_addr, %err, "control handshake failed");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Passive-side connection setup: read the peer's comm_id, build the
    /// ConnMeta, register the endpoint, and announce the connection.
    fn handle_new_connection(&mut self, mut stream: TcpStream) -> io::Result<()> {
        let peer_id = read_comm_id(&mut stream)?;
        tracing::info!(peer = peer_id, "reliable channel accepted connection");

        let conn = Arc::new(ConnMeta::new(peer_id, &self.cfg));
        self.install_endpoint(peer_id, stream, conn.clone());

        // Publish the connection only after its endpoint is serviceable.
        self.conn_table
            .lock()
            .unwrap()
            .insert(peer_id, conn.clone());

        self.prio_notify
            .send(PrioNotification::AddConnection(conn.clone()));
        self.recv_notify.send(RecvNotification::AddConnection(conn));
        Ok(())
    }

    fn install_endpoint(&mut self, comm_id: u16, mut stream: TcpStream, conn: Arc<ConnMeta>) {
        use std::os::fd::AsRawFd;

        if let Err(err) = set_tos(stream.as_raw_fd(), self.cfg.ctrl_tos) {
            tracing::warn!(peer = comm_id, %err, "failed to set control ToS");
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
        {
            tracing::error!(peer = comm_id, %err, "failed to register control endpoint");
            return;
        }

        if let Some(old) = self.by_comm.insert(comm_id, token) {
            tracing::warn!(peer = comm_id, "replacing existing control endpoint");
            self.gc.push(old);
        }
        self.endpoints
            .insert(token, CtrlEndpoint::new(comm_id, stream, conn));
    }

    fn service_endpoint(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(endpoint) = self.endpoints.get_mut(&token) else {
            return;
        };

        let mut signals = Vec::new();
        if readable {
            signals = endpoint.on_recv_ready();
        }
        if writable {
            endpoint.on_send_ready();
        }
        let dead = endpoint.is_dead();

        for signal in signals {
            self.dispatch_signal(token, signal);
        }

        if dead {
            self.gc.push(token);
        }
    }

    /// Dispatch one decoded control frame into the channels it concerns.
    fn dispatch_signal(&mut self, token: Token, signal: Signal) {
        let Some(endpoint) = self.endpoints.get_mut(&token) else {
            return;
        };
        let src = endpoint.comm_id();

        match signal {
            Signal::UserData(data) => {
                tracing::trace!(src, len = data.len(), "user metadata received");
                if self.meta_tx.send((src, data)).is_err() {
                    tracing::trace!("meta queue receiver dropped");
                }
            }
            Signal::FlowStart(s) => {
                tracing::trace!(src, msg_id = s.msg_id, max_seq = s.max_seq, "flow start");
                endpoint.msg_max_seq.insert(s.msg_id, s.max_seq);
            }
            Signal::FlowFinish(s) => {
                let Some(&max_seq) = endpoint.msg_max_seq.get(&s.msg_id) else {
                    tracing::warn!(src, msg_id = s.msg_id, "flow finish without flow start");
                    return;
                };
                tracing::trace!(src, msg_id = s.msg_id, "flow finish");
                self.recv_notify.send(RecvNotification::FinishFlow {
                    src_comm_id: src,
                    msg_id: s.msg_id,
                    max_seq,
                });
            }
            Signal::RateAdjustment(s) => {
                tracing::trace!(src, rate = s.sending_rate, "rate adjustment");
                endpoint.conn.adjust_rate(f64::from(s.sending_rate));
            }
            Signal::RetransmitRequest(req) => {
                if req.comm_id != src {
                    tracing::warn!(
                        src,
                        claimed = req.comm_id,
                        "retransmit request claims another comm_id, dropped"
                    );
                    return;
                }
                tracing::trace!(src, msg_id = req.msg_id, "retransmit request");
                self.prio_notify
                    .send(PrioNotification::RequestRetransmit(req));
            }
            Signal::StopRequest(s) => {
                if s.comm_id != src {
                    tracing::warn!(
                        src,
                        claimed = s.comm_id,
                        "stop request claims another comm_id, dropped"
                    );
                    return;
                }
                tracing::trace!(src, msg_id = s.msg_id, "stop request");
                self.prio_notify
                    .send(PrioNotification::StopFlow(encode_flow(src, s.msg_id)));
            }
            Signal::StopConfirm(s) => {
                tracing::trace!(src, msg_id = s.msg_id, "stop confirm");
                endpoint.msg_max_seq.remove(&s.msg_id);
                self.recv_notify.send(RecvNotification::ConfirmStop {
                    src_comm_id: src,
                    msg_id: s.msg_id,
                });
            }
        }
    }

    fn poll_notifications(&mut self) {
        while let Ok(notification) = self.notify_rx.try_recv() {
            match notification {
                CtrlNotification::AddEndpoint {
                    comm_id,
                    stream,
                    conn,
                } => {
                    let stream = TcpStream::from_std(stream);
                    self.install_endpoint(comm_id, stream, conn);
                    tracing::info!(peer = comm_id, "control endpoint connected");
                }
                CtrlNotification::RemoveEndpoint(comm_id) => {
                    if let Some(&token) = self.by_comm.get(&comm_id) {
                        if let Some(endpoint) = self.endpoints.get_mut(&token) {
                            endpoint.mark_dead();
                        }
                        self.gc.push(token);
                    }
                }
            }
        }
    }

    /// Pull outbound signals, frame them, and flush eagerly — a fresh
    /// endpoint's writable edge may already have passed.
    fn poll_outbound(&mut self) {
        while let Ok((dest, signal)) = self.tx_rx.try_recv() {
            let Some(&token) = self.by_comm.get(&dest) else {
                tracing::warn!(dest, "control signal for unestablished peer dropped");
                continue;
            };
            let Some(endpoint) = self.endpoints.get_mut(&token) else {
                continue;
            };
            if endpoint.is_dead() {
                tracing::debug!(dest, "control signal for dead endpoint dropped");
                continue;
            }
            endpoint.enqueue(signal.encode_frame());
            endpoint.on_send_ready();
        }
    }
}

/// Read the peer's 4-byte little-endian comm_id off a freshly accepted
/// (non-blocking) stream, with a short deadline.
fn read_comm_id(stream: &mut TcpStream) -> io::Result<u16> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during handshake",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "handshake timed out",
                    ));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(u32::from_le_bytes(buf) as u16)
}
