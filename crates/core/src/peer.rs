//! The peer table: every device we have heard from, with its sync state,
//! rolling RSSI average and outbound frame queue.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;

use tracing::{debug, warn};

use nan_wire::EtherAddr;

use crate::election;
use crate::moving_average::MovingAverage;
use crate::time::{tu_to_usec, DW_INTERVAL_TU};
use crate::timer::SyncTimer;

pub const PEER_DEFAULT_TIMEOUT_USEC: u64 = tu_to_usec(DW_INTERVAL_TU) * 10;
pub const PEER_DEFAULT_CLEAN_INTERVAL_USEC: u64 = tu_to_usec(DW_INTERVAL_TU) * 2;
pub const PEER_RSSI_BUFFER_SIZE: usize = 32;

/// Capacity of every outbound frame FIFO (device-wide and per-peer).
pub const FRAME_QUEUE_CAPACITY: usize = 16;

/// Bounded FIFO of prebuilt frames awaiting a DW flush.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue {
    frames: VecDeque<Vec<u8>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a frame; a full queue drops the new frame.
    pub fn push(&mut self, frame: Vec<u8>) -> Result<(), QueueFull> {
        if self.frames.len() >= FRAME_QUEUE_CAPACITY {
            return Err(QueueFull);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame queue full")]
pub struct QueueFull;

/// Outcome of [`PeerTable::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Added,
    Updated,
}

/// A device observed on the channel.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: EtherAddr,
    pub cluster_id: EtherAddr,
    pub ipv6_link_local: Ipv6Addr,

    pub last_update_usec: u64,
    pub last_beacon_time_usec: u64,
    pub last_follow_up_time_usec: u64,
    /// TSF the peer reported in its last beacon.
    pub last_timestamp: u64,

    pub master_preference: u8,
    pub last_master_preference: u8,
    pub random_factor: u8,

    pub anchor_master_rank: u64,
    pub last_anchor_master_rank: u64,
    pub ambtt: u32,
    pub hop_count: u8,
    pub master_candidate: bool,

    rssi: MovingAverage,

    /// The peer's view of cluster time, as this device models it.
    pub timer: SyncTimer,
    /// Shadow of `timer` before the last desync shift.
    pub old_timer: SyncTimer,
    /// Outbound frames addressed to this peer (desync mode flushes these
    /// inside the peer's own DW).
    pub frame_queue: FrameQueue,

    /// Peer has announced a published service.
    pub publisher: bool,
    /// Relay received service-discovery frames to other peers.
    pub forward: bool,
    /// Rewrite relayed service info (only meaningful with `forward`).
    pub modify: bool,

    pub count_sync: u64,
    pub old_timer_send_count: u32,
    pub max_send_old_count: u32,
    pub total_timer_shift_tu: i64,
}

impl Peer {
    fn new(addr: EtherAddr, cluster_id: EtherAddr, base_time_usec: i64) -> Self {
        let mut timer = SyncTimer::new(0);
        timer.set_base_time_usec(base_time_usec);
        let old_timer = timer.clone();

        Self {
            addr,
            cluster_id,
            ipv6_link_local: addr.ipv6_link_local(),
            last_update_usec: 0,
            last_beacon_time_usec: 0,
            last_follow_up_time_usec: 0,
            last_timestamp: 0,
            master_preference: 0,
            last_master_preference: 0,
            random_factor: 0,
            anchor_master_rank: 0,
            last_anchor_master_rank: 0,
            ambtt: 0,
            hop_count: 0,
            master_candidate: false,
            rssi: MovingAverage::new(PEER_RSSI_BUFFER_SIZE),
            timer,
            old_timer,
            frame_queue: FrameQueue::new(),
            publisher: false,
            forward: false,
            modify: false,
            count_sync: 0,
            old_timer_send_count: 0,
            max_send_old_count: 0,
            total_timer_shift_tu: 0,
        }
    }

    /// The peer's master rank, derived from its advertised preference and
    /// random factor.
    pub fn master_rank(&self) -> u64 {
        election::master_rank(self.master_preference, self.random_factor, &self.addr)
    }

    pub fn set_master_indication(&mut self, master_preference: u8, random_factor: u8) {
        self.last_master_preference = self.master_preference;
        self.master_preference = master_preference;
        self.random_factor = random_factor;
    }

    /// Record received anchor information. A peer that is itself the anchor
    /// (hop count zero) reports its own beacon time, so its last timestamp
    /// stands in for the AMBTT.
    pub fn set_anchor_info(&mut self, anchor_master_rank: u64, ambtt: u32, hop_count: u8) {
        self.last_anchor_master_rank = self.anchor_master_rank;
        self.anchor_master_rank = anchor_master_rank;
        self.hop_count = hop_count;
        self.ambtt = if hop_count == 0 {
            self.last_timestamp as u32
        } else {
            ambtt
        };
    }

    pub fn set_beacon_info(&mut self, rssi: i8, timestamp: u64) {
        self.rssi.add(rssi as i64);
        self.last_timestamp = timestamp;
    }

    pub fn rssi_average(&self) -> i64 {
        self.rssi.average()
    }

    /// Whether desync transmissions should still cover the pre-shift DW.
    pub fn use_old_timer(&self) -> bool {
        self.old_timer_send_count < self.max_send_old_count
    }

    pub fn should_send_discovery_beacon(&self, now_usec: u64) -> bool {
        self.timer.can_send_discovery_beacon(now_usec)
    }
}

/// Capability interface the I/O layer implements to mirror the peer set
/// into the host's neighbor table.
pub trait PeerObserver {
    fn peer_added(&mut self, peer: &Peer);
    fn peer_removed(&mut self, peer: &Peer);
}

/// Keyed set of observed devices.
pub struct PeerTable {
    peers: HashMap<EtherAddr, Peer>,
    pub timeout_usec: u64,
    pub clean_interval_usec: u64,
    observer: Option<Box<dyn PeerObserver + Send>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            timeout_usec: PEER_DEFAULT_TIMEOUT_USEC,
            clean_interval_usec: PEER_DEFAULT_CLEAN_INTERVAL_USEC,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn PeerObserver + Send>) {
        self.observer = Some(observer);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, addr: &EtherAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &EtherAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Match a peer by the textual prefix of its address (operator
    /// commands accept abbreviated addresses).
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&Peer> {
        let needle = prefix.to_ascii_lowercase();
        self.peers
            .values()
            .find(|peer| peer.addr.to_string().starts_with(&needle))
    }

    /// Insert a new peer or refresh an existing one. New peers get their
    /// timers seeded with the device's base time.
    pub fn add_or_update(
        &mut self,
        addr: EtherAddr,
        cluster_id: EtherAddr,
        now_usec: u64,
        base_time_usec: i64,
    ) -> PeerStatus {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_update_usec = now_usec;
                if peer.cluster_id != cluster_id {
                    debug!(
                        target: "nan::peer",
                        "updated cluster id of peer {} to {}", peer.addr, cluster_id
                    );
                    peer.cluster_id = cluster_id;
                }
                PeerStatus::Updated
            }
            None => {
                let mut peer = Peer::new(addr, cluster_id, base_time_usec);
                peer.last_update_usec = now_usec;
                if let Some(observer) = &mut self.observer {
                    observer.peer_added(&peer);
                }
                debug!(target: "nan::peer", "added peer {} from cluster {}", addr, cluster_id);
                self.peers.insert(addr, peer);
                PeerStatus::Added
            }
        }
    }

    /// Remove a peer, notifying the observer.
    pub fn remove(&mut self, addr: &EtherAddr) -> Option<Peer> {
        let peer = self.peers.remove(addr)?;
        if let Some(observer) = &mut self.observer {
            observer.peer_removed(&peer);
        }
        debug!(target: "nan::peer", "peer removed {}", peer.addr);
        Some(peer)
    }

    /// Sweep out every peer whose last update is older than the timeout.
    pub fn clean(&mut self, now_usec: u64) {
        let expired: Vec<EtherAddr> = self
            .peers
            .values()
            .filter(|peer| peer.last_update_usec + self.timeout_usec <= now_usec)
            .map(|peer| peer.addr)
            .collect();

        for addr in expired {
            warn!(target: "nan::peer", "peer {} timed out", addr);
            self.remove(&addr);
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn addr(last: u8) -> EtherAddr {
        EtherAddr([0x02, 0, 0, 0, 0, last])
    }

    fn cluster() -> EtherAddr {
        EtherAddr([0x50, 0x6f, 0x9a, 0x01, 0xaa, 0xbb])
    }

    #[derive(Default)]
    struct Counter {
        added: Arc<AtomicUsize>,
        removed: Arc<AtomicUsize>,
    }

    impl PeerObserver for Counter {
        fn peer_added(&mut self, _peer: &Peer) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn peer_removed(&mut self, _peer: &Peer) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn add_then_update() {
        let mut table = PeerTable::new();

        assert_eq!(table.add_or_update(addr(1), cluster(), 10, 0), PeerStatus::Added);
        assert_eq!(table.add_or_update(addr(1), cluster(), 20, 0), PeerStatus::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&addr(1)).unwrap().last_update_usec, 20);
    }

    #[test]
    fn cluster_id_follows_the_peer() {
        let mut table = PeerTable::new();
        table.add_or_update(addr(1), cluster(), 10, 0);

        let other = EtherAddr([0x50, 0x6f, 0x9a, 0x01, 0xcc, 0xdd]);
        table.add_or_update(addr(1), other, 20, 0);

        assert_eq!(table.get(&addr(1)).unwrap().cluster_id, other);
    }

    #[test]
    fn clean_removes_stale_peers_and_fires_observer_once() {
        let removed = Arc::new(AtomicUsize::new(0));
        let mut table = PeerTable::new();
        table.set_observer(Box::new(Counter {
            added: Arc::new(AtomicUsize::new(0)),
            removed: removed.clone(),
        }));

        let now = PEER_DEFAULT_TIMEOUT_USEC * 12;
        table.add_or_update(addr(1), cluster(), now - PEER_DEFAULT_TIMEOUT_USEC - 1, 0);
        table.add_or_update(addr(2), cluster(), now, 0);

        table.clean(now);

        assert!(table.get(&addr(1)).is_none());
        assert!(table.get(&addr(2)).is_some());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        // No peer older than the timeout survives the sweep.
        assert!(table.iter().all(|p| p.last_update_usec + table.timeout_usec >= now));
    }

    #[test]
    fn peer_exactly_at_timeout_is_removed() {
        let mut table = PeerTable::new();
        let now = PEER_DEFAULT_TIMEOUT_USEC;
        table.add_or_update(addr(1), cluster(), 0, 0);

        table.clean(now);

        assert!(table.get(&addr(1)).is_none());
    }

    #[test]
    fn anchor_ambtt_falls_back_to_last_timestamp_for_hop_zero() {
        let mut peer = Peer::new(addr(1), cluster(), 0);
        peer.set_beacon_info(-40, 0x123456);

        peer.set_anchor_info(99, 0xdead, 0);
        assert_eq!(peer.ambtt, 0x123456);

        peer.set_anchor_info(99, 0xdead, 1);
        assert_eq!(peer.ambtt, 0xdead);
    }

    #[test]
    fn rssi_average_moves() {
        let mut peer = Peer::new(addr(1), cluster(), 0);
        for _ in 0..PEER_RSSI_BUFFER_SIZE {
            peer.set_beacon_info(-50, 0);
        }
        assert_eq!(peer.rssi_average(), -50);
        peer.set_beacon_info(-82, 0);
        assert!(peer.rssi_average() < -50);
    }

    #[test]
    fn frame_queue_is_bounded() {
        let mut queue = FrameQueue::new();
        for _ in 0..FRAME_QUEUE_CAPACITY {
            queue.push(vec![0]).unwrap();
        }

        assert_eq!(queue.push(vec![1]), Err(QueueFull));
        assert_eq!(queue.len(), FRAME_QUEUE_CAPACITY);
    }

    #[test]
    fn find_by_prefix_matches_textual_address() {
        let mut table = PeerTable::new();
        table.add_or_update(addr(0xa1), cluster(), 0, 0);

        assert!(table.find_by_prefix("02:00:00:00:00:a1").is_some());
        assert!(table.find_by_prefix("02:00").is_some());
        assert!(table.find_by_prefix("03:").is_none());
    }
}
