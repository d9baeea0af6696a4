//! Time units and the monotonic clock the protocol runs against.
//!
//! Everything in the protocol is expressed in microseconds or in TU
//! (1 TU = 1024 µs, the 802.11 time unit).

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

pub const TU_USEC: u64 = 1024;

/// Length of a discovery window.
pub const DW_LENGTH_TU: u64 = 16;
/// Interval between the starts of two discovery windows.
pub const DW_INTERVAL_TU: u64 = 512;
/// Pacing of discovery beacons outside DWs.
pub const DISCOVERY_BEACON_INTERVAL_TU: u64 = 100;
/// Warmup period before the device considers its state settled.
pub const WARMUP_TIMER_SEC: u64 = 120;
/// Passive scan window after startup.
pub const INITIAL_SCAN_TIMER_USEC: u64 = 1_000_000;

pub const fn tu_to_usec(tu: u64) -> u64 {
    tu * TU_USEC
}

pub const fn usec_to_tu(usec: u64) -> u64 {
    usec / TU_USEC
}

pub const fn sec_to_usec(sec: u64) -> u64 {
    sec * 1_000_000
}

/// Floored difference between two times, in TU.
pub fn time_difference_tu(old_usec: u64, new_usec: u64) -> u64 {
    usec_to_tu(new_usec).saturating_sub(usec_to_tu(old_usec))
}

/// Number of whole DW intervals between two times.
pub fn time_difference_dw(old_usec: u64, new_usec: u64) -> u64 {
    time_difference_tu(old_usec, new_usec) / DW_INTERVAL_TU
}

/// Monotonic clock queried by the state machine.
pub trait Clock: Clone {
    fn now_usec(&self) -> u64;
}

/// Wall clock backed by [`Instant`], zero at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_usec(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(now_usec: u64) -> Self {
        Self { now: Rc::new(Cell::new(now_usec)) }
    }

    pub fn set(&self, now_usec: u64) {
        self.now.set(now_usec);
    }

    pub fn advance(&self, delta_usec: u64) {
        self.now.set(self.now.get() + delta_usec);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(tu_to_usec(1), 1024);
        assert_eq!(usec_to_tu(1024), 1);
        assert_eq!(usec_to_tu(1023), 0);
        assert_eq!(tu_to_usec(DW_INTERVAL_TU), 524288);
    }

    #[test]
    fn dw_difference_is_floored() {
        assert_eq!(time_difference_dw(0, tu_to_usec(DW_INTERVAL_TU) - 1), 0);
        assert_eq!(time_difference_dw(0, tu_to_usec(DW_INTERVAL_TU)), 1);
        assert_eq!(time_difference_dw(0, tu_to_usec(DW_INTERVAL_TU * 10)), 10);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(50);

        assert_eq!(other.now_usec(), 150);
    }
}
