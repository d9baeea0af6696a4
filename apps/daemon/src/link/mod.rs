//! Link-layer contracts the core consumes, and their implementations.
//!
//! The radio link delivers and accepts whole frames with radiotap headers
//! intact; the host link speaks layer-2 frames on a TAP-like device. Both
//! must be non-blocking and pollable.

use std::io;
use std::net::Ipv6Addr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;

use tracing::debug;

use nan_core::peer::{Peer, PeerObserver};
use nan_wire::EtherAddr;

pub mod packet;
pub mod tap;

/// MTU of the host-side interface.
pub const HOST_MTU: usize = 1450;

/// Monitor-mode radio: inject and capture radiotap + 802.11 frames.
pub trait WlanLink: AsRawFd {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Receive one frame; `WouldBlock` when none is pending.
    fn receive_frame(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Host-side TAP: layer-2 frames to and from the local OS stack.
pub trait HostLink: AsRawFd {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    fn receive_frame(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Host neighbor-table hooks driven by the peer table.
pub trait NeighborTable {
    fn neighbor_add(&mut self, addr: &EtherAddr, ipv6: &Ipv6Addr);
    fn neighbor_remove(&mut self, ipv6: &Ipv6Addr);
}

/// Neighbor table that only records what it would do. The concrete
/// netlink plumbing lives outside this daemon.
#[derive(Debug, Default)]
pub struct LoggingNeighbors;

impl NeighborTable for LoggingNeighbors {
    fn neighbor_add(&mut self, addr: &EtherAddr, ipv6: &Ipv6Addr) {
        debug!(target: "nand::link", "neighbor add {} ({})", addr, ipv6);
    }

    fn neighbor_remove(&mut self, ipv6: &Ipv6Addr) {
        debug!(target: "nand::link", "neighbor remove {}", ipv6);
    }
}

/// Bridges the peer table's observer capability onto a neighbor table.
pub struct NeighborObserver<N> {
    neighbors: N,
}

impl<N> NeighborObserver<N> {
    pub fn new(neighbors: N) -> Self {
        Self { neighbors }
    }
}

impl<N: NeighborTable> PeerObserver for NeighborObserver<N> {
    fn peer_added(&mut self, peer: &Peer) {
        self.neighbors.neighbor_add(&peer.addr, &peer.ipv6_link_local);
    }

    fn peer_removed(&mut self, peer: &Peer) {
        self.neighbors.neighbor_remove(&peer.ipv6_link_local);
    }
}

/// In-process datagram link for tests and wired-together daemons: each
/// end behaves like a radio that hears everything the other end sends.
pub struct DevLink {
    socket: UnixDatagram,
}

impl DevLink {
    pub fn pair() -> io::Result<(DevLink, DevLink)> {
        let (a, b) = UnixDatagram::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((DevLink { socket: a }, DevLink { socket: b }))
    }
}

impl AsRawFd for DevLink {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }
}

impl WlanLink for DevLink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buffer)
    }
}

impl HostLink for DevLink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buffer)
    }
}
