//! Anchor-master election and the Master / Sync / Non-Sync role machine.

use tracing::debug;

use nan_wire::EtherAddr;

use crate::peer::Peer;
use crate::time::{time_difference_dw, tu_to_usec, DW_LENGTH_TU};

/// RSSI above which a peer counts as "close".
pub const RSSI_CLOSE: i64 = -60;
/// RSSI above which a peer counts as "middle".
pub const RSSI_MIDDLE: i64 = -75;

/// Minimum DWs between refreshes of the advertised master preference.
pub const MASTER_PREFERENCE_UPDATE_MIN_DW: u64 = 240;
/// Minimum DWs between refreshes of the random factor.
pub const RANDOM_FACTOR_UPDATE_MIN_DW: u64 = 120;

/// DWs without an AMBTT update before the anchor is considered gone.
const ANCHOR_EXPIRATION_DWS: u8 = 3;

/// Scale factor of the coarse staleness bound: DW length times DW
/// interval, mapping synced TU onto the AMBTT's DW-grid units.
const AMBTT_STALE_SCALE: u64 = DW_LENGTH_TU * crate::time::DW_INTERVAL_TU;

/// Peers heard this many TU before the DW end still count for election.
const ELECTION_GUARD_TU: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    NonSync,
    Sync,
    Master,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "MASTER",
            Role::Sync => "NON MASTER SYNC",
            Role::NonSync => "NON MASTER NON SYNC",
        }
    }
}

/// Compose the 64-bit master rank. Higher numeric value wins; the address
/// occupies the low 48 bits with its first octet least significant.
pub fn master_rank(master_preference: u8, random_factor: u8, addr: &EtherAddr) -> u64 {
    let mut rank = (master_preference as u64) << 56 | (random_factor as u64) << 48;
    for (i, octet) in addr.0.iter().enumerate() {
        rank |= (*octet as u64) << (8 * i);
    }
    rank
}

/// The address that issued a master rank.
pub fn rank_issuer(rank: u64) -> EtherAddr {
    let mut addr = EtherAddr::ZERO;
    for (i, octet) in addr.0.iter_mut().enumerate() {
        *octet = (rank >> (8 * i)) as u8;
    }
    addr
}

pub fn is_rank_issuer(addr: &EtherAddr, rank: u64) -> bool {
    rank_issuer(rank) == *addr
}

/// Whether two ranks were issued by the same device (equal low 48 bits).
pub fn same_rank_issuer(rank_a: u64, rank_b: u64) -> bool {
    rank_a & 0x0000_ffff_ffff_ffff == rank_b & 0x0000_ffff_ffff_ffff
}

/// Election and synchronization state of this device.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub role: Role,
    pub master_rank: u64,
    pub master_preference: u8,
    pub random_factor: u8,

    pub last_master_preference_update_usec: u64,
    pub last_random_factor_update_usec: u64,

    pub anchor_master_rank: u64,
    pub ambtt: u32,
    pub hop_count: u8,

    /// The previous anchor, for staleness checks.
    pub last_anchor_master_rank: u64,
    pub last_ambtt: u32,

    /// Baselines for the per-DW expiration check.
    expiration_ambtt: u32,
    expiration_hop_count: u8,
    count_dws_without_ambtt_update: u8,
    count_dws_without_hop_count_update: u8,

    /// Refreshed master preference (advertised after warmup refreshes).
    pub configured_master_preference: u8,
    /// When set, a device only claims mastership while some higher-ranked
    /// peer exists (the literal reference behavior).
    pub promotion_requires_higher_rank: bool,
}

impl SyncState {
    pub fn new(
        interface_address: &EtherAddr,
        configured_master_preference: u8,
        promotion_requires_higher_rank: bool,
    ) -> Self {
        let rank = master_rank(0, 0, interface_address);
        Self {
            role: Role::Master,
            master_rank: rank,
            master_preference: 0,
            random_factor: 0,
            last_master_preference_update_usec: 0,
            last_random_factor_update_usec: 0,
            anchor_master_rank: rank,
            ambtt: 0,
            hop_count: 0,
            last_anchor_master_rank: rank,
            last_ambtt: 0,
            expiration_ambtt: 0,
            expiration_hop_count: 0,
            count_dws_without_ambtt_update: 0,
            count_dws_without_hop_count_update: 0,
            configured_master_preference,
            promotion_requires_higher_rank,
        }
    }

    pub fn is_anchor_master_self(&self) -> bool {
        same_rank_issuer(self.master_rank, self.anchor_master_rank)
    }

    pub fn is_anchor_master(&self, addr: &EtherAddr) -> bool {
        is_rank_issuer(addr, self.anchor_master_rank)
    }

    pub fn anchor_master_address(&self) -> EtherAddr {
        rank_issuer(self.anchor_master_rank)
    }

    fn save_current_anchor(&mut self) {
        self.last_anchor_master_rank = self.anchor_master_rank;
        self.last_ambtt = self.ambtt;
    }

    fn set_anchor_other(&mut self, peer: &Peer) {
        self.save_current_anchor();
        self.anchor_master_rank = peer.anchor_master_rank;
        self.ambtt = peer.ambtt;
        self.hop_count = peer.hop_count + 1;
    }

    fn set_anchor_self(&mut self) {
        self.save_current_anchor();
        self.anchor_master_rank = self.master_rank;
        self.ambtt = 0;
        self.hop_count = 0;
    }

    /// Recompute the master rank after preference, factor or address
    /// changed. Returns whether it actually changed.
    pub fn update_master_rank(&mut self, interface_address: Option<&EtherAddr>) -> bool {
        let issuer = match interface_address {
            Some(addr) => *addr,
            None => rank_issuer(self.master_rank),
        };
        let new_rank = master_rank(self.master_preference, self.random_factor, &issuer);
        if new_rank == self.master_rank {
            return false;
        }

        self.master_rank = new_rank;
        if self.is_anchor_master_self() {
            self.last_anchor_master_rank = self.anchor_master_rank;
            self.anchor_master_rank = self.master_rank;
        } else if self.master_rank > self.anchor_master_rank {
            debug!(target: "nan::election", "rank update makes us anchor master");
            self.set_anchor_self();
        }
        debug!(target: "nan::election", "new master rank {}", new_rank);
        true
    }

    /// Refresh preference and random factor when their minimum DW spacing
    /// has elapsed. Triggered by a peer whose preference changed.
    pub fn update_master_preference(
        &mut self,
        rng: &mut fastrand::Rng,
        peer: &Peer,
        now_usec: u64,
    ) -> bool {
        if peer.master_preference == peer.last_master_preference {
            return false;
        }

        let elapsed_dws = time_difference_dw(self.last_master_preference_update_usec, now_usec);

        let mut updated = false;
        if elapsed_dws > RANDOM_FACTOR_UPDATE_MIN_DW {
            self.random_factor = rng.u8(..);
            self.last_random_factor_update_usec = now_usec;
            updated = true;
        }
        if elapsed_dws > MASTER_PREFERENCE_UPDATE_MIN_DW {
            self.master_preference = self.configured_master_preference;
            self.last_master_preference_update_usec = now_usec;
            updated = true;
        }

        updated && self.update_master_rank(None)
    }

    /// Flag `peer` as a master candidate: it shares our anchor and offers
    /// a shorter path, or an equal path from a higher-ranked device.
    pub fn check_master_candidate(&self, peer: &mut Peer) {
        peer.master_candidate = false;
        if peer.anchor_master_rank != self.anchor_master_rank {
            return;
        }
        if peer.hop_count < self.hop_count {
            peer.master_candidate = true;
        }
        if peer.hop_count == self.hop_count && peer.master_rank() > self.master_rank {
            peer.master_candidate = true;
        }
    }

    /// Run the role transition over the current peer population. Invoked
    /// at each DW end; only peers heard within this DW participate.
    pub fn master_election<'a>(&mut self, peers: impl Iterator<Item = &'a Peer>, now_usec: u64) {
        let mut count_higher_mr = 0;
        let mut count_rssi_close = 0;
        let mut count_rssi_close_higher_mr = 0;
        let mut count_rssi_close_master_candidate = 0;
        let mut count_rssi_middle_higher_mr = 0;
        let mut count_rssi_middle_master_candidate = 0;

        for peer in peers {
            if now_usec.saturating_sub(peer.last_update_usec)
                > tu_to_usec(DW_LENGTH_TU + ELECTION_GUARD_TU)
            {
                continue;
            }
            let higher_mr = peer.master_rank() > self.master_rank;

            if peer.rssi_average() > RSSI_CLOSE {
                count_rssi_close += 1;
                if higher_mr {
                    count_rssi_close_higher_mr += 1;
                }
                if peer.master_candidate {
                    count_rssi_close_master_candidate += 1;
                }
            }
            if peer.rssi_average() > RSSI_MIDDLE {
                if higher_mr {
                    count_rssi_middle_higher_mr += 1;
                }
                if peer.master_candidate {
                    count_rssi_middle_master_candidate += 1;
                }
            }
            if higher_mr {
                count_higher_mr += 1;
            }
        }

        if self.role == Role::Master {
            if count_rssi_close_higher_mr >= 1 || count_rssi_middle_higher_mr >= 3 {
                debug!(target: "nan::election", "master election: master -> sync");
                self.role = Role::Sync;
            }
        } else {
            let promote = count_rssi_close == 0
                && (!self.promotion_requires_higher_rank || count_higher_mr > 0);
            if promote {
                debug!(target: "nan::election", "master election: non-master -> master");
                self.role = Role::Master;
            }
        }

        if self.role == Role::Sync {
            if count_rssi_close_master_candidate >= 1 || count_rssi_middle_master_candidate >= 3 {
                debug!(target: "nan::election", "master election: sync -> non-sync");
                self.role = Role::NonSync;
            }
        } else if self.role == Role::NonSync
            && count_rssi_close_master_candidate == 0
            && count_rssi_middle_master_candidate < 3
        {
            debug!(target: "nan::election", "master election: non-sync -> sync");
            self.role = Role::Sync;
        }
    }

    /// Anchor-master selection over the values of a received sync beacon.
    pub fn anchor_master_selection(&mut self, peer: &Peer, synced_time_tu: u64) {
        if self.anchor_master_rank == peer.anchor_master_rank
            && (peer.ambtt as u64) <= synced_time_tu.saturating_mul(AMBTT_STALE_SCALE)
        {
            debug!(target: "nan::election", "anchor master selection: received outdated amr");
            return;
        }

        if self.is_anchor_master_self() {
            if self.master_rank >= peer.anchor_master_rank {
                debug!(target: "nan::election", "anchor master selection: own mr >= received amr");
                return;
            }
            if same_rank_issuer(self.master_rank, peer.anchor_master_rank) {
                debug!(target: "nan::election", "anchor master selection: received own amr");
                return;
            }
            debug!(target: "nan::election", "anchor master selection: received better amr");
            self.set_anchor_other(peer);
            return;
        }

        if self.anchor_master_rank < peer.anchor_master_rank {
            if self.last_anchor_master_rank == peer.anchor_master_rank
                && self.last_ambtt >= peer.ambtt
            {
                debug!(target: "nan::election", "anchor master selection: received outdated amr");
                return;
            }
            debug!(target: "nan::election", "anchor master selection: adopting higher amr");
            self.set_anchor_other(peer);
            return;
        }

        if self.anchor_master_rank > peer.anchor_master_rank {
            if !same_rank_issuer(self.anchor_master_rank, peer.anchor_master_rank) {
                debug!(
                    target: "nan::election",
                    "anchor master selection: lower amr from non-anchor peer"
                );
                return;
            }
            if self.master_rank > peer.anchor_master_rank {
                debug!(
                    target: "nan::election",
                    "anchor master selection: anchor rank fell below own mr"
                );
                self.set_anchor_self();
                return;
            }
            debug!(target: "nan::election", "anchor master selection: anchor rank decreased");
            self.set_anchor_other(peer);
            return;
        }

        // Same anchor: freshen the beacon time, shorten the path.
        if self.ambtt < peer.ambtt {
            self.ambtt = peer.ambtt;
        }
        if self.hop_count > peer.hop_count + 1 {
            self.hop_count = peer.hop_count + 1;
        }
        debug!(target: "nan::election", "anchor master selection: no change");
    }

    /// Per-DW anchor liveness check. Must run at the end of every DW.
    pub fn check_anchor_master_expiration(&mut self) {
        if self.is_anchor_master_self() {
            self.count_dws_without_ambtt_update = 0;
            self.count_dws_without_hop_count_update = 0;
            self.expiration_ambtt = self.ambtt;
            self.expiration_hop_count = self.hop_count;
            return;
        }

        if self.hop_count == self.expiration_hop_count {
            self.count_dws_without_hop_count_update += 1;
        } else {
            self.count_dws_without_hop_count_update = 0;
        }
        if self.ambtt == self.expiration_ambtt {
            self.count_dws_without_ambtt_update += 1;
        } else {
            self.count_dws_without_ambtt_update = 0;
        }
        self.expiration_ambtt = self.ambtt;
        self.expiration_hop_count = self.hop_count;

        if self.count_dws_without_ambtt_update >= ANCHOR_EXPIRATION_DWS {
            debug!(target: "nan::election", "no ambtt update for 3 dws, anchor self");
            self.set_anchor_self();
            self.count_dws_without_ambtt_update = 0;
            self.count_dws_without_hop_count_update = 0;
        } else if self.count_dws_without_hop_count_update >= ANCHOR_EXPIRATION_DWS {
            debug!(target: "nan::election", "ambtt fresh but hop count stuck, mark unreachable");
            // The next peer with a real path dominates this one.
            self.hop_count = 255;
        }
    }
}
