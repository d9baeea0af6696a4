//! Protocol-level configuration.

/// Tunables of the state machine. The daemon fills this from its TOML
/// configuration; defaults follow the reference behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master preference advertised after the first refresh.
    pub master_preference: u8,
    /// Literal promotion rule: a non-master only claims mastership while
    /// some higher-ranked peer is known.
    pub promotion_requires_higher_rank: bool,
    /// Append an FCS to injected frames.
    pub fcs: bool,
    /// Peer expiry, microseconds.
    pub peer_timeout_usec: u64,
    /// Period of the peer-cleanup sweep, microseconds.
    pub peer_clean_interval_usec: u64,
    /// Clock-shift experiment settings.
    pub desync: DesyncConfig,
}

#[derive(Debug, Clone)]
pub struct DesyncConfig {
    /// TU to shift a peer's timer per `peer … set timer` default.
    pub offset_tu: i64,
    /// Beacons still sent on the pre-shift schedule after a shift.
    pub max_send_old_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_preference: 200,
            promotion_requires_higher_rank: true,
            fcs: true,
            peer_timeout_usec: crate::peer::PEER_DEFAULT_TIMEOUT_USEC,
            peer_clean_interval_usec: crate::peer::PEER_DEFAULT_CLEAN_INTERVAL_USEC,
            desync: DesyncConfig {
                offset_tu: 50,
                max_send_old_count: 3,
            },
        }
    }
}
