//! Aggregate device state.

use nan_wire::ieee80211::SequenceNumbers;
use nan_wire::EtherAddr;

use crate::cluster::ClusterState;
use crate::config::Config;
use crate::election::SyncState;
use crate::event::EventBus;
use crate::peer::{FrameQueue, PeerTable};
use crate::service::ServiceRegistry;
use crate::timer::SyncTimer;

/// Bookkeeping of the clock-shift experiment.
#[derive(Debug, Clone, Default)]
pub struct DesyncState {
    pub enabled: bool,
}

/// The device singleton every subsystem hangs off.
pub struct NanState {
    pub hostname: String,
    pub self_address: EtherAddr,
    pub interface_address: EtherAddr,

    pub cluster: ClusterState,
    pub sync: SyncState,
    pub timer: SyncTimer,
    pub peers: PeerTable,
    pub services: ServiceRegistry,
    pub events: EventBus,

    pub sequence_numbers: SequenceNumbers,
    /// Outbound frames awaiting the next DW flush.
    pub buffer: FrameQueue,
    /// Append an FCS to injected frames.
    pub fcs: bool,

    pub desync: DesyncState,
    pub config: Config,
}

impl NanState {
    pub fn new(
        hostname: &str,
        address: EtherAddr,
        now_usec: u64,
        rng: &mut fastrand::Rng,
        config: Config,
    ) -> Self {
        let mut peers = PeerTable::new();
        peers.timeout_usec = config.peer_timeout_usec;
        peers.clean_interval_usec = config.peer_clean_interval_usec;

        Self {
            hostname: hostname.to_owned(),
            self_address: address,
            interface_address: address,
            cluster: ClusterState::new(rng),
            sync: SyncState::new(
                &address,
                config.master_preference,
                config.promotion_requires_higher_rank,
            ),
            timer: SyncTimer::new(now_usec),
            peers,
            services: ServiceRegistry::new(),
            events: EventBus::new(),
            sequence_numbers: SequenceNumbers::new(),
            buffer: FrameQueue::new(),
            fcs: config.fcs,
            desync: DesyncState::default(),
            config,
        }
    }
}
