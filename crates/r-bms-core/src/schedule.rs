//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Drift-free fixed-interval tick schedule."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use r_bms_common::CancellationToken;

/// Fixed-rate schedule that measures every deadline from the previous one.
///
/// Time spent inside a tick never shifts later deadlines. A tick that starts
/// a full interval or more behind its deadline re-anchors the schedule at
/// its actual start, so an overrun never turns into a burst of catch-up
/// ticks.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    interval: Duration,
    next: Instant,
    tick: u64,
}

impl TickSchedule {
    /// First tick is due at `start`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next: start,
            tick: 0,
        }
    }

    /// Deadline of the next tick.
    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    /// Number of ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Sleep until the next deadline. Returns `true` when cancelled.
    pub fn wait(&self, cancel: &CancellationToken) -> bool {
        cancel.wait_until(self.next)
    }

    /// Mark the next tick as started at `started`.
    ///
    /// Returns its index and the deadline it was due at.
    pub fn begin(&mut self, started: Instant) -> (u64, Instant) {
        let index = self.tick;
        let due = self.next;
        self.tick += 1;
        self.next = if started.saturating_duration_since(due) >= self.interval {
            started + self.interval
        } else {
            due + self.interval
        };
        (index, due)
    }
}

/// Whether tick `index` also reads the slow set.
pub fn is_slow_tick(index: u64, divider: u32) -> bool {
    index % u64::from(divider.max(1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(1000);

    #[test]
    fn late_starts_do_not_accumulate() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(T, start);
        for i in 0..50u32 {
            // every tick starts 300 ms behind its deadline
            let started = schedule.next_deadline() + Duration::from_millis(300);
            let (index, due) = schedule.begin(started);
            assert_eq!(index, u64::from(i));
            assert_eq!(due, start + T * i);
        }
        assert_eq!(schedule.next_deadline(), start + T * 50);
    }

    #[test]
    fn overrun_reanchors_at_actual_start() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(T, start);
        schedule.begin(start);
        let late = start + T + Duration::from_millis(2500);
        let (index, due) = schedule.begin(late);
        assert_eq!((index, due), (1, start + T));
        assert_eq!(schedule.next_deadline(), late + T);
    }

    #[test]
    fn slow_set_runs_on_first_and_every_nth_tick() {
        let slow: Vec<u64> = (0..12).filter(|i| is_slow_tick(*i, 5)).collect();
        assert_eq!(slow, vec![0, 5, 10]);
        assert!((0..4).all(|i| is_slow_tick(i, 1)));
    }

    #[test]
    fn wait_returns_early_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let schedule = TickSchedule::new(T, Instant::now() + Duration::from_secs(60));
        assert!(schedule.wait(&cancel));
    }
}
