//! The synchronization timer: a per-device virtual clock driftable by peer
//! beacon timestamps, defining the cluster time base and the DW schedule.

use tracing::debug;

use crate::moving_average::MovingAverage;
use crate::time::{
    sec_to_usec, tu_to_usec, usec_to_tu, DISCOVERY_BEACON_INTERVAL_TU, DW_INTERVAL_TU,
    DW_LENGTH_TU, INITIAL_SCAN_TIMER_USEC, WARMUP_TIMER_SEC,
};

/// Samples kept for the moving-average drift correction.
const ERROR_SAMPLES: usize = 32;

#[derive(Debug, Clone)]
pub struct SyncTimer {
    /// Epoch of this device's synced clock. Signed: a hard re-base toward a
    /// peer whose cluster is older than this process can push it negative.
    base_time_usec: i64,
    /// Moving-average error accumulated from non-anchor peer timestamps.
    error: MovingAverage,
    last_discovery_beacon_usec: u64,
    warmup_done: bool,
    initial_scan_done: bool,
}

impl SyncTimer {
    pub fn new(now_usec: u64) -> Self {
        Self {
            base_time_usec: now_usec as i64,
            error: MovingAverage::new(ERROR_SAMPLES),
            last_discovery_beacon_usec: 0,
            warmup_done: false,
            initial_scan_done: false,
        }
    }

    pub fn base_time_usec(&self) -> i64 {
        self.base_time_usec
    }

    /// Shift the epoch directly. Only the desync experiment does this.
    pub fn set_base_time_usec(&mut self, base: i64) {
        self.base_time_usec = base;
    }

    pub fn shift_base_time_tu(&mut self, offset_tu: i64) {
        self.base_time_usec += offset_tu * 1024;
    }

    fn synced_i64(&self, now_usec: u64) -> i64 {
        now_usec as i64 - self.base_time_usec
    }

    fn fixed_i64(&self, now_usec: u64) -> i64 {
        self.synced_i64(now_usec) - self.error.average()
    }

    /// Cluster time in microseconds.
    pub fn synced_time_usec(&self, now_usec: u64) -> u64 {
        self.synced_i64(now_usec).max(0) as u64
    }

    /// Cluster time in TU.
    pub fn synced_time_tu(&self, now_usec: u64) -> u64 {
        usec_to_tu(self.synced_time_usec(now_usec))
    }

    /// Cluster time with the drift correction applied.
    pub fn fixed_time_usec(&self, now_usec: u64) -> u64 {
        self.fixed_i64(now_usec).max(0) as u64
    }

    pub fn fixed_time_tu(&self, now_usec: u64) -> u64 {
        usec_to_tu(self.fixed_time_usec(now_usec))
    }

    /// Hard re-base toward a received timestamp (anchor master or cluster
    /// adoption).
    pub fn sync_time(&mut self, now_usec: u64, timestamp: u64) {
        let diff_usec = self.synced_i64(now_usec) - timestamp as i64;
        let diff_tu = diff_usec / 1024;
        if diff_tu.abs() > 3 {
            debug!(target: "nan::timer", "high timer diff {} usec ({} tu)", diff_usec, diff_tu);
        }
        self.base_time_usec += diff_usec;
    }

    /// Feed the drift correction with a non-anchor timestamp. Samples more
    /// than one DW interval off are rejected as outliers.
    pub fn sync_error(&mut self, now_usec: u64, timestamp: u64) {
        let error_usec = self.synced_i64(now_usec) - timestamp as i64;
        if error_usec.unsigned_abs() > tu_to_usec(DW_INTERVAL_TU) {
            debug!(target: "nan::timer", "error too large: {}", error_usec);
            return;
        }
        self.error.add(error_usec);
    }

    /// Whether the corrected time falls inside a discovery window.
    pub fn in_dw(&self, now_usec: u64) -> bool {
        let tu = self.fixed_i64(now_usec) / 1024;
        tu.rem_euclid(DW_INTERVAL_TU as i64) <= DW_LENGTH_TU as i64
    }

    /// Whether we are in DW0, the anchor of the 2^23 TU schedule.
    pub fn in_dw0(&self, now_usec: u64) -> bool {
        if !self.in_dw(now_usec) {
            return false;
        }
        let tu = self.fixed_time_tu(now_usec);
        let dw_start_tu = (tu / DW_INTERVAL_TU) * DW_INTERVAL_TU;
        dw_start_tu & 0x7fffff == 0
    }

    /// Whether `target_usec` lies within the DW that contains `now_usec`.
    pub fn in_current_dw(&self, now_usec: u64, target_usec: u64) -> bool {
        self.in_dw(target_usec)
            && crate::time::time_difference_tu(target_usec, now_usec)
                < DW_INTERVAL_TU - DW_LENGTH_TU
    }

    /// Offset of `now` from the nearest DW start, in TU; negative when the
    /// next window is closer than the previous one.
    pub fn dw_start_offset_tu(&self, now_usec: u64) -> i64 {
        let interval = DW_INTERVAL_TU as i64;
        let into = (self.fixed_i64(now_usec) / 1024).rem_euclid(interval);
        if into > interval / 2 {
            into - interval
        } else {
            into
        }
    }

    /// Microseconds until the next DW start.
    pub fn next_dw_usec(&self, now_usec: u64) -> u64 {
        self.next_dw_from(self.synced_i64(now_usec))
    }

    fn next_dw_from(&self, synced_usec: i64) -> u64 {
        let interval = DW_INTERVAL_TU as i64;
        let synced_tu = synced_usec.div_euclid(1024);
        let next_tu = interval - synced_tu.rem_euclid(interval);
        tu_to_usec(next_tu as u64)
    }

    /// Microseconds until the current DW closes, or until the next one
    /// closes when outside a window.
    pub fn dw_end_usec(&self, now_usec: u64) -> u64 {
        if self.in_dw(now_usec) {
            self.next_dw_from(self.synced_i64(now_usec) - tu_to_usec(DW_LENGTH_TU) as i64)
        } else {
            self.next_dw_usec(now_usec) + tu_to_usec(DW_LENGTH_TU)
        }
    }

    /// True exactly once, when the warmup period has elapsed.
    pub fn warmup_expired(&mut self, now_usec: u64) -> bool {
        if !self.warmup_done
            && now_usec as i64 - self.base_time_usec >= sec_to_usec(WARMUP_TIMER_SEC) as i64
        {
            self.warmup_done = true;
            return true;
        }
        false
    }

    pub fn warmup_cancel(&mut self) {
        self.warmup_done = true;
    }

    pub fn initial_scan_done(&self, now_usec: u64) -> bool {
        self.initial_scan_done
            || now_usec as i64 - self.base_time_usec > INITIAL_SCAN_TIMER_USEC as i64
    }

    pub fn initial_scan_cancel(&mut self) {
        debug!(target: "nan::timer", "initial scan cancelled");
        self.initial_scan_done = true;
    }

    pub fn can_send_discovery_beacon(&self, now_usec: u64) -> bool {
        now_usec - self.last_discovery_beacon_usec >= tu_to_usec(DISCOVERY_BEACON_INTERVAL_TU)
    }

    /// Microseconds until the next discovery-beacon slot; zero when one may
    /// be sent right away.
    pub fn next_discovery_beacon_usec(&self, now_usec: u64) -> u64 {
        if self.can_send_discovery_beacon(now_usec) {
            return 0;
        }
        tu_to_usec(DISCOVERY_BEACON_INTERVAL_TU) - (now_usec - self.last_discovery_beacon_usec)
    }

    pub fn set_last_discovery_beacon_usec(&mut self, time_usec: u64) {
        self.last_discovery_beacon_usec = time_usec;
    }
}
