//! Top-level communicator façade.
//!
//! Builds and starts the three channel threads, owns the connection table,
//! and exposes the user-facing surface: connection lifecycle, post_send /
//! post_recv, small-metadata exchange over the reliable channel, and the
//! completion queue.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use mio::{Poll, Waker};

use mlt_transport::message::LtMessage;
use mlt_transport::packetizer::Packetizer;
use mlt_transport::prio::PacketPriority;
use mlt_transport::wire::{FlowStart, Signal};

use crate::completion::Completion;
use crate::config::MltConfig;
use crate::conn::{ConnMeta, ConnTable, Registry};
use crate::endpoint::UdpPrioEndpoint;
use crate::priority::{self, PriorityChannel, SendRequest};
use crate::receiving::{self, ReceivingChannel, RecvNotification, RecvRequest};
use crate::reliable::{self, CtrlNotification, ReliableChannel};
use crate::supervisor::{Mailbox, WAKER_TOKEN};
use crate::{MltError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(5);

pub struct Communicator {
    comm_id: u16,
    cfg: MltConfig,
    packetizer: Packetizer,
    registry: Arc<Registry>,
    conn_table: ConnTable,
    priority: PriorityChannel,
    receiving: ReceivingChannel,
    reliable: ReliableChannel,
    meta_rx: Receiver<(u16, Bytes)>,
    completion_rx: Receiver<Completion>,
}

impl Communicator {
    /// Bring up the communicator: one UDP endpoint per (DSCP × ECN) class,
    /// the datagram socket and control listener bound to `listen_port`, and
    /// the three channel threads running.
    pub fn start(comm_id: u16, listen_port: u16, cfg: MltConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let conn_table: ConnTable = Arc::new(Mutex::new(HashMap::new()));
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let (meta_tx, meta_rx) = crossbeam_channel::unbounded();

        // The reliable channel's mailbox plumbing is created up front: both
        // datapath channels emit control signals through it.
        let reliable_poll = Poll::new().map_err(MltError::Io)?;
        let reliable_waker =
            Arc::new(Waker::new(reliable_poll.registry(), WAKER_TOKEN).map_err(MltError::Io)?);
        let (ctrl_tx, ctrl_tx_rx) = crossbeam_channel::unbounded();
        let ctrl_mailbox = Mailbox::new(ctrl_tx, reliable_waker.clone());
        let (ctrl_notify_tx, ctrl_notify_rx) = crossbeam_channel::unbounded();
        let ctrl_notify_mailbox = Mailbox::new(ctrl_notify_tx, reliable_waker.clone());

        // One socket per priority class, ToS fixed at creation.
        let mut endpoints = Vec::with_capacity(cfg.num_queues * 2);
        for queue in 0..cfg.num_queues {
            let dscp = (queue * 8) as u8;
            for ecn in [1u8, 0u8] {
                endpoints.push(UdpPrioEndpoint::new((dscp << 2) | ecn).map_err(MltError::Io)?);
            }
        }

        let priority = priority::spawn(
            comm_id,
            cfg.clone(),
            endpoints,
            registry.clone(),
            conn_table.clone(),
            ctrl_mailbox.clone(),
            completion_tx.clone(),
        )?;

        let data_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port));
        let socket = mio::net::UdpSocket::bind(data_addr).map_err(MltError::Io)?;
        let receiving = receiving::spawn(
            comm_id,
            cfg.clone(),
            socket,
            ctrl_mailbox.clone(),
            completion_tx,
        )?;

        let listener =
            mio::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port)))
                .map_err(MltError::Io)?;
        let reliable = reliable::spawn(
            comm_id,
            cfg.clone(),
            reliable_poll,
            reliable_waker,
            ctrl_tx_rx,
            ctrl_mailbox,
            ctrl_notify_rx,
            ctrl_notify_mailbox,
            listener,
            priority.notify_handle(),
            receiving.notify_handle(),
            meta_tx,
            conn_table.clone(),
        )?;

        tracing::info!(comm_id, listen_port, "communicator started");

        Ok(Communicator {
            packetizer: Packetizer::new(comm_id, cfg.mtu),
            comm_id,
            cfg,
            registry,
            conn_table,
            priority,
            receiving,
            reliable,
            meta_rx,
            completion_rx,
        })
    }

    #[inline]
    pub fn comm_id(&self) -> u16 {
        self.comm_id
    }

    pub fn config(&self) -> &MltConfig {
        &self.cfg
    }

    /// Establish the control connection to a peer. The side with the
    /// smaller comm_id connects and sends its id; the other side waits for
    /// the accept to land.
    pub fn add_connection(&self, dest: u16, addr: SocketAddr) -> Result<()> {
        self.registry.add_peer(dest, addr);

        if self.comm_id >= dest {
            // Passive side: the reliable channel fills the table on accept.
            let deadline = Instant::now() + CONNECT_TIMEOUT;
            while !self.conn_table.lock().unwrap().contains_key(&dest) {
                if Instant::now() >= deadline {
                    return Err(MltError::ConnectTimeout(dest));
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            return Ok(());
        }

        let mut stream = connect_with_retry(addr, CONNECT_TIMEOUT)
            .map_err(|_| MltError::ConnectTimeout(dest))?;
        stream
            .write_all(&u32::from(self.comm_id).to_le_bytes())
            .map_err(MltError::Io)?;
        stream.set_nonblocking(true).map_err(MltError::Io)?;

        let conn = {
            let mut table = self.conn_table.lock().unwrap();
            table
                .entry(dest)
                .or_insert_with(|| Arc::new(ConnMeta::new(dest, &self.cfg)))
                .clone()
        };

        self.reliable.notify(CtrlNotification::AddEndpoint {
            comm_id: dest,
            stream,
            conn: conn.clone(),
        });
        self.priority
            .notify(priority::PrioNotification::AddConnection(conn.clone()));
        self.receiving
            .notify(RecvNotification::AddConnection(conn));

        tracing::info!(dest, %addr, "connection established");
        Ok(())
    }

    /// Tear a connection down. The release routes through the priority
    /// channel so it happens on the thread owning the sending state.
    pub fn remove_connection(&self, dest: u16) {
        self.priority
            .notify(priority::PrioNotification::RemoveConnection(dest));
        self.receiving
            .notify(RecvNotification::RemoveConnection(dest));
        self.reliable.notify(CtrlNotification::RemoveEndpoint(dest));
    }

    /// Post a loss-tolerant send: announces the flow on the reliable
    /// channel and hands the message to the priority channel.
    pub fn post_send(
        &self,
        dest: u16,
        msg: LtMessage,
        prio: Arc<dyn PacketPriority>,
    ) -> Result<()> {
        if !self.conn_table.lock().unwrap().contains_key(&dest) {
            return Err(MltError::UnknownPeer(dest));
        }
        let flow_size = msg.data.len();
        self.reliable.enqueue(
            dest,
            Signal::FlowStart(FlowStart {
                msg_id: msg.msg_id,
                flow_size: flow_size as u32,
                max_seq: self.packetizer.max_seq(flow_size),
            }),
        );
        self.priority.enqueue(SendRequest { dest, msg, prio });
        Ok(())
    }

    /// Post a loss-tolerant receive. The buffer's length is the expected
    /// message size; it is returned through the Recv completion once at
    /// least `(1 - loss_ratio)` of it has arrived.
    pub fn post_recv(&self, dest: u16, msg_id: u32, buf: Vec<u8>, loss_ratio: f64) -> Result<()> {
        if !self.conn_table.lock().unwrap().contains_key(&dest) {
            return Err(MltError::UnknownPeer(dest));
        }
        self.receiving.enqueue(RecvRequest {
            dest,
            msg_id,
            buf,
            loss_ratio,
        });
        Ok(())
    }

    /// Send small user metadata over the reliable channel. The bytes are
    /// copied; the call returns immediately.
    pub fn send_meta_async(&self, dest: u16, data: &[u8]) -> Result<()> {
        if !self.conn_table.lock().unwrap().contains_key(&dest) {
            return Err(MltError::UnknownPeer(dest));
        }
        self.reliable
            .enqueue(dest, Signal::UserData(Bytes::copy_from_slice(data)));
        Ok(())
    }

    /// Block until a peer's metadata arrives; returns `(src, payload)`.
    pub fn recv_meta(&self) -> Result<(u16, Bytes)> {
        self.meta_rx.recv().map_err(|_| MltError::ChannelClosed)
    }

    /// The completion queue. Each `post_send`/`post_recv` produces exactly
    /// one completion here.
    pub fn completions(&self) -> Receiver<Completion> {
        self.completion_rx.clone()
    }

    /// Stop the three channel threads and join them.
    pub fn shutdown(&mut self) {
        self.priority.supervisor.terminate();
        self.receiving.supervisor.terminate();
        self.reliable.supervisor.terminate();
        self.priority.supervisor.join();
        self.receiving.supervisor.join();
        self.reliable.supervisor.join();
        tracing::info!(comm_id = self.comm_id, "communicator shut down");
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_with_retry(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(err);
                }
                tracing::debug!(%addr, %err, "control connect failed, retrying");
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    }
}
