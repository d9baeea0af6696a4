//! The protocol engine: timers, DW scheduling and the Io output layer.
//!
//! The engine never performs I/O. It emits [`Io`] values into an outbox
//! the reactor drains after every callback; re-arming a timer is the only
//! cancellation idiom.

use std::collections::VecDeque;

use tracing::{debug, error, info, trace};

use nan_wire::frame::{BeaconKind, NAN_NETWORK_ID};
use nan_wire::{ByteReader, EtherAddr};

use crate::command::{self, CommandState};
use crate::config::Config;
use crate::event::ServiceEvent;
use crate::rx;
use crate::state::NanState;
use crate::time::{tu_to_usec, Clock, DISCOVERY_BEACON_INTERVAL_TU, DW_INTERVAL_TU};
use crate::tx;

/// The recurring timers of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DwStart,
    DwEnd,
    DiscoveryBeacon,
    PeerCleanup,
}

/// Instructions for the reactor.
#[derive(Debug)]
pub enum Io {
    /// Inject a frame on the radio.
    Wlan(Vec<u8>),
    /// Deliver a layer-2 frame to the host TAP.
    Host(Vec<u8>),
    /// Arm (or re-arm) a timer relative to now.
    SetTimer(TimerKind, u64),
    /// A service event, for observers outside the state machine.
    Event(ServiceEvent),
    /// A frame the RX pipeline rejected; candidates for the failure dump.
    DumpFrame(Vec<u8>),
    /// Operator asked for a verbosity change (positive = louder).
    AdjustVerbosity(i8),
}

/// Holds protocol outputs pending pickup by the reactor.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Io>,
}

impl Outbox {
    pub fn push(&mut self, io: Io) {
        self.queue.push_back(io);
    }

    pub fn wlan(&mut self, frame: Vec<u8>) {
        self.queue.push_back(Io::Wlan(frame));
    }

    pub fn set_timer(&mut self, kind: TimerKind, in_usec: u64) {
        self.queue.push_back(Io::SetTimer(kind, in_usec));
    }

    pub fn event(&mut self, event: ServiceEvent) {
        self.queue.push_back(Io::Event(event));
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}

/// The state machine the reactor drives.
pub struct Engine<C> {
    pub state: NanState,
    clock: C,
    rng: fastrand::Rng,
    outbox: Outbox,
    commands: CommandState,
}

impl<C: Clock> Engine<C> {
    pub fn new(
        hostname: &str,
        address: EtherAddr,
        clock: C,
        mut rng: fastrand::Rng,
        config: Config,
    ) -> Self {
        let now = clock.now_usec();
        let state = NanState::new(hostname, address, now, &mut rng, config);
        Self {
            state,
            clock,
            rng,
            outbox: Outbox::default(),
            commands: CommandState::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Arm the initial timers. Call once before the reactor loop.
    pub fn initialize(&mut self) {
        info!(
            target: "nan",
            "initial cluster id: {}", self.state.cluster.cluster_id
        );
        self.outbox.set_timer(TimerKind::DwStart, 0);
        self.outbox.set_timer(TimerKind::DiscoveryBeacon, 0);
        self.outbox
            .set_timer(TimerKind::PeerCleanup, self.state.peers.clean_interval_usec);
    }

    /// A captured radio frame.
    pub fn frame_received(&mut self, frame_bytes: &[u8]) {
        let now = self.clock.now_usec();
        trace!(target: "nan", "received frame of length {}", frame_bytes.len());

        match rx::rx(&mut self.state, &mut self.rng, frame_bytes, now) {
            Ok(report) => {
                for (_, event) in report.events {
                    self.outbox.event(event);
                }
                self.run_reflexes();
            }
            Err(error) => {
                trace!(target: "nan", "unhandled frame: {}", error);
                self.outbox.push(Io::DumpFrame(frame_bytes.to_vec()));
            }
        }
    }

    /// A layer-2 frame from the host TAP, addressed by its leading
    /// destination field. The present core only routes; nothing is
    /// injected on this path.
    pub fn host_frame_received(&mut self, frame_bytes: &[u8]) {
        let mut reader = ByteReader::new(frame_bytes);
        let destination = reader.read_ether_addr();
        if reader.had_error() {
            error!(target: "nan", "received host data too short");
            return;
        }

        if destination.is_multicast() {
            trace!(target: "nan", "received multicast data for {}", destination);
            return;
        }
        if destination == self.state.self_address {
            trace!(target: "nan", "received frame for self");
            self.outbox.push(Io::Host(frame_bytes.to_vec()));
            return;
        }
        match self.state.peers.get(&destination) {
            Some(peer) => {
                info!(
                    target: "nan",
                    "received host data for peer {} ({})", peer.addr, peer.ipv6_link_local
                );
            }
            None => {
                trace!(target: "nan", "drop frame to non-peer {}", destination);
            }
        }
    }

    /// One operator input line.
    pub fn command_line(&mut self, line: &str) {
        let clock = self.clock.clone();
        command::handle_line(
            &mut self.state,
            &mut self.commands,
            &mut self.outbox,
            &clock,
            line,
        );
        self.run_reflexes();
    }

    /// A timer armed through [`Io::SetTimer`] fired.
    pub fn timer_expired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::DwStart => self.handle_discovery_window(),
            TimerKind::DwEnd => self.handle_discovery_window_end(),
            TimerKind::DiscoveryBeacon => self.handle_discovery_beacon(),
            TimerKind::PeerCleanup => self.handle_peer_cleanup(),
        }
        self.run_reflexes();
    }

    /// Drain the pending outputs.
    pub fn outputs(&mut self) -> impl Iterator<Item = Io> + '_ {
        &mut self.outbox
    }

    fn run_reflexes(&mut self) {
        command::run_reflexes(&mut self.state, &mut self.commands);
    }

    fn send_beacon(&mut self, kind: BeaconKind, now_usec: u64, peer: Option<EtherAddr>) {
        let peer_snapshot = peer.and_then(|addr| self.state.peers.get(&addr).cloned());
        match tx::build_beacon_frame(&mut self.state, kind, now_usec, peer_snapshot.as_ref()) {
            Ok(frame) => {
                trace!(target: "nan", "send {} beacon of length {}", kind.as_str(), frame.len());
                self.outbox.wlan(frame);
            }
            Err(_) => {
                error!(target: "nan", "could not build beacon frame: {}", kind.as_str());
            }
        }
    }

    fn flush_buffered_frames(&mut self, peer: Option<EtherAddr>) {
        loop {
            let frame = match peer {
                Some(addr) => self
                    .state
                    .peers
                    .get_mut(&addr)
                    .and_then(|p| p.frame_queue.pop()),
                None => self.state.buffer.pop(),
            };
            let Some(frame) = frame else { break };
            trace!(target: "nan", "send buffered frame of length {}", frame.len());
            self.outbox.wlan(frame);
        }
    }

    fn send_service_discovery(&mut self, peer: Option<EtherAddr>) {
        let announced = self.state.services.announce_candidates();
        if announced.is_empty() {
            return;
        }
        let destination = peer.unwrap_or(NAN_NETWORK_ID);
        match tx::build_service_discovery_frame(&mut self.state, &destination, &announced) {
            Ok(frame) => {
                trace!(target: "nan", "send service discovery frame for services:");
                tx::trace_announced(&self.state, &announced);
                self.outbox.wlan(frame);
            }
            Err(_) => {
                error!(target: "nan", "could not build service discovery frame");
                return;
            }
        }

        let terminated = self.state.services.update_after_announce(&announced);
        for (name, event) in terminated {
            self.state.events.dispatch(&name, &event);
            self.outbox.event(event);
        }
    }

    fn handle_discovery_window(&mut self) {
        let now = self.clock.now_usec();

        // A peer silent for four DWs whose anchor differs from us has, as
        // far as this cluster is concerned, adopted us as its anchor.
        let our_rank = self.state.sync.master_rank;
        let silence = tu_to_usec(DW_INTERVAL_TU * 4);
        for peer in self.state.peers.iter_mut() {
            if peer.last_beacon_time_usec + silence < now && peer.anchor_master_rank != our_rank {
                debug!(
                    target: "nan",
                    "no beacon from {} in 4 dws, assume it adopted us as anchor", peer.addr
                );
                peer.anchor_master_rank = our_rank;
            }
        }

        if self.state.desync.enabled {
            self.handle_desync_discovery_window(now);
            return;
        }

        if !self.state.timer.in_dw(now) {
            let next = self.state.timer.next_dw_usec(now);
            trace!(target: "nan", "not in dw, next in {} usec", next);
            self.outbox.set_timer(TimerKind::DwStart, next);
            return;
        }

        trace!(
            target: "nan",
            "in discovery window at {}", self.state.timer.synced_time_usec(now)
        );

        self.send_beacon(BeaconKind::Sync, now, None);
        self.flush_buffered_frames(None);
        self.send_service_discovery(None);

        let now = self.clock.now_usec();
        self.outbox
            .set_timer(TimerKind::DwStart, self.state.timer.next_dw_usec(now));
        self.outbox
            .set_timer(TimerKind::DwEnd, self.state.timer.dw_end_usec(now));
    }

    /// Desync mode walks each peer's private DW schedule instead of the
    /// cluster-wide one.
    fn handle_desync_discovery_window(&mut self, now_usec: u64) {
        let in_window: Vec<EtherAddr> = self
            .state
            .peers
            .iter()
            .filter(|peer| {
                let mut in_dw = peer.timer.in_dw(now_usec);
                if peer.use_old_timer() {
                    in_dw |= peer.old_timer.in_dw(now_usec);
                }
                in_dw
            })
            .map(|peer| peer.addr)
            .collect();

        for addr in in_window {
            trace!(target: "nan", "in dw of {}", addr);
            self.send_beacon(BeaconKind::Sync, now_usec, Some(addr));
            self.flush_buffered_frames(Some(addr));
            self.send_service_discovery(Some(addr));

            if let Some(peer) = self.state.peers.get_mut(&addr) {
                if peer.use_old_timer() && peer.old_timer.in_dw(now_usec) {
                    peer.old_timer_send_count += 1;
                }
            }
        }

        let mut next = tu_to_usec(DW_INTERVAL_TU);
        for peer in self.state.peers.iter() {
            let mut peer_next = peer.timer.next_dw_usec(now_usec);
            if peer.use_old_timer() {
                peer_next = peer_next.min(peer.old_timer.next_dw_usec(now_usec));
            }
            next = next.min(peer_next);
        }
        self.outbox.set_timer(TimerKind::DwStart, next);
    }

    fn handle_discovery_window_end(&mut self) {
        let now = self.clock.now_usec();
        trace!(target: "nan", "discovery window end");

        self.state.sync.master_election(self.state.peers.iter(), now);
        self.state.sync.check_anchor_master_expiration();

        if self.state.timer.warmup_expired(now) {
            debug!(target: "nan", "warmup complete");
        }
    }

    fn handle_discovery_beacon(&mut self) {
        let now = self.clock.now_usec();

        if self.state.desync.enabled {
            let due: Vec<EtherAddr> = self
                .state
                .peers
                .iter()
                .filter(|peer| peer.should_send_discovery_beacon(now))
                .map(|peer| peer.addr)
                .collect();
            for addr in due {
                self.send_beacon(BeaconKind::Discovery, now, Some(addr));
                if let Some(peer) = self.state.peers.get_mut(&addr) {
                    peer.timer.set_last_discovery_beacon_usec(now);
                }
            }
            self.outbox
                .set_timer(TimerKind::DiscoveryBeacon, tu_to_usec(40));
            return;
        }

        if tx::can_send_discovery_beacon(&self.state, now) {
            self.send_beacon(BeaconKind::Discovery, now, None);
            self.state.timer.set_last_discovery_beacon_usec(now);
        }

        let mut next = self.state.timer.next_discovery_beacon_usec(now);
        if next == 0 {
            // Pacing allows a beacon but the role does not; check again a
            // full interval later rather than spinning.
            next = tu_to_usec(DISCOVERY_BEACON_INTERVAL_TU);
        }
        self.outbox.set_timer(TimerKind::DiscoveryBeacon, next);
    }

    fn handle_peer_cleanup(&mut self) {
        let now = self.clock.now_usec();
        self.state.peers.clean(now);
        self.outbox
            .set_timer(TimerKind::PeerCleanup, self.state.peers.clean_interval_usec);
    }
}
