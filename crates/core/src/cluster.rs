//! Cluster identity and the grade rule deciding which of two colliding
//! clusters absorbs the other.

use nan_wire::frame::NAN_CLUSTER_ID_BASE;
use nan_wire::EtherAddr;

/// Only the low 19 bits of the timestamp enter the grade.
const GRADE_TIMESTAMP_MASK: u64 = 0x7ffff;

#[derive(Debug, Clone)]
pub struct ClusterState {
    pub cluster_id: EtherAddr,
}

impl ClusterState {
    pub fn new(rng: &mut fastrand::Rng) -> Self {
        Self { cluster_id: new_cluster_id(rng) }
    }
}

/// A fresh cluster id: the fixed base prefix with a random two-byte tail.
pub fn new_cluster_id(rng: &mut fastrand::Rng) -> EtherAddr {
    let mut id = NAN_CLUSTER_ID_BASE;
    id.0[4] = rng.u8(..);
    id.0[5] = rng.u8(..);
    id
}

/// Whether the peer's cluster grade beats ours. Grades compare as
/// `(master_preference, timestamp & 0x7ffff)` lexicographically.
pub fn peer_grade_wins(
    self_master_preference: u8,
    self_timestamp: u64,
    peer_master_preference: u8,
    peer_timestamp: u64,
) -> bool {
    if self_master_preference == peer_master_preference {
        return self_timestamp & GRADE_TIMESTAMP_MASK < peer_timestamp & GRADE_TIMESTAMP_MASK;
    }
    self_master_preference < peer_master_preference
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_keeps_the_base_prefix() {
        let mut rng = fastrand::Rng::with_seed(7);
        let id = new_cluster_id(&mut rng);

        assert_eq!(&id.0[..4], &NAN_CLUSTER_ID_BASE.0[..4]);
    }

    #[test]
    fn preference_dominates_grade() {
        assert!(peer_grade_wins(0, u64::MAX, 200, 0));
        assert!(!peer_grade_wins(200, 0, 0, u64::MAX));
    }

    #[test]
    fn timestamp_breaks_ties_on_low_19_bits() {
        assert!(peer_grade_wins(10, 5, 10, 6));
        assert!(!peer_grade_wins(10, 6, 10, 5));
        // Bits above the mask do not count.
        assert!(!peer_grade_wins(10, 5, 10, 5 | (1 << 19)));
    }
}
