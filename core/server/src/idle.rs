//! Idle detection.
//!
//! The grace clock starts at the most recent disconnect, never at the poll
//! tick, and only while no client is connected.

use std::time::{Duration, Instant};

use crate::connections::ConnectionSnapshot;

pub const DEFAULT_IDLE_GRACE_PERIOD: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy)]
pub struct IdleShutdownMonitor {
    grace_period: Duration,
}

impl IdleShutdownMonitor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn is_idle(&self, snapshot: &ConnectionSnapshot, now: Instant) -> bool {
        snapshot.active == 0
            && now.saturating_duration_since(snapshot.last_disconnect_at) > self.grace_period
    }

    /// Instant after which the server counts as idle, if nobody is connected.
    pub fn idle_deadline(&self, snapshot: &ConnectionSnapshot) -> Option<Instant> {
        if snapshot.active == 0 {
            Some(snapshot.last_disconnect_at + self.grace_period)
        } else {
            None
        }
    }
}

impl Default for IdleShutdownMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionTracker;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn not_idle_at_exact_grace_boundary() {
        let start = Instant::now();
        let tracker = ConnectionTracker::starting_at(start);
        let monitor = IdleShutdownMonitor::default();

        assert!(!monitor.is_idle(&tracker.snapshot(), start + ms(5000)));
        assert!(monitor.is_idle(&tracker.snapshot(), start + ms(5001)));
    }

    #[test]
    fn never_idle_while_a_client_is_connected() {
        let start = Instant::now();
        let tracker = ConnectionTracker::starting_at(start);
        tracker.record_connect(start);
        let monitor = IdleShutdownMonitor::default();

        assert!(!monitor.is_idle(&tracker.snapshot(), start + ms(60_000)));
        assert_eq!(monitor.idle_deadline(&tracker.snapshot()), None);
    }

    #[test]
    fn reconnect_restarts_grace_clock_from_latest_disconnect() {
        let start = Instant::now();
        let tracker = ConnectionTracker::starting_at(start);
        let monitor = IdleShutdownMonitor::default();

        tracker.record_connect(start);
        tracker.record_disconnect(start);
        tracker.record_connect(start + ms(4000));
        tracker.record_disconnect(start + ms(4100));

        let snapshot = tracker.snapshot();
        assert!(!monitor.is_idle(&snapshot, start + ms(5001)));
        assert!(!monitor.is_idle(&snapshot, start + ms(9100)));
        assert!(monitor.is_idle(&snapshot, start + ms(9101)));
        assert_eq!(monitor.idle_deadline(&snapshot), Some(start + ms(9100)));
    }

    #[test]
    fn clock_earlier_than_disconnect_is_not_idle() {
        let start = Instant::now();
        let tracker = ConnectionTracker::starting_at(start + ms(100));
        let monitor = IdleShutdownMonitor::new(ms(0));

        assert!(!monitor.is_idle(&tracker.snapshot(), start));
    }
}
