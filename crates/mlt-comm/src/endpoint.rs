//! Per-priority UDP endpoints.
//!
//! One socket per DSCP||ECN class with the ToS fixed at creation, so every
//! packet routed here leaves the host tagged for its queue. Sends are
//! vectored — the 20-byte header lives on the stack and the payload stays a
//! slice of the message body; nothing is copied into a contiguous packet
//! buffer.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use socket2::{Domain, SockAddr, SockRef, Socket, Type};

use mlt_transport::wire::GradPacket;

/// Set the ToS byte on any socket fd.
pub(crate) fn set_tos(fd: RawFd, tos: u8) -> io::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    SockRef::from(&fd).set_tos(u32::from(tos))
}

pub(crate) struct UdpPrioEndpoint {
    tos: u8,
    socket: Socket,
    tx: VecDeque<(SockAddr, GradPacket)>,
    degraded: bool,
}

impl UdpPrioEndpoint {
    pub fn new(tos: u8) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_tos(u32::from(tos))?;
        Ok(UdpPrioEndpoint {
            tos,
            socket,
            tx: VecDeque::new(),
            degraded: false,
        })
    }

    #[inline]
    pub fn tos(&self) -> u8 {
        self.tos
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn enqueue(&mut self, dest: SocketAddr, pkt: GradPacket) {
        debug_assert_eq!(pkt.header.tos, self.tos);
        self.tx.push_back((dest.into(), pkt));
    }

    /// Drain the tx queue while the kernel accepts datagrams. Returns bytes
    /// handed to the kernel; stops on would-block, logs and degrades on
    /// anything else.
    pub fn drain(&mut self) -> usize {
        let mut total = 0;
        while let Some((addr, pkt)) = self.tx.front() {
            let header = pkt.header.encode_array();
            let iov = [IoSlice::new(&header), IoSlice::new(&pkt.payload)];
            match self.socket.send_to_vectored(&iov, addr) {
                Ok(n) => {
                    debug_assert_eq!(n, usize::from(pkt.header.len));
                    total += n;
                    self.tx.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(tos = self.tos, %err, "datagram send failed, endpoint degraded");
                    self.degraded = true;
                    self.tx.pop_front();
                }
            }
        }
        total
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}
