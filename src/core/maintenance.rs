//! Periodic task timing.
//!
//! Tracks when each recurring task last ran and tells the event loop
//! which are due this tick. All tasks are idempotent, so a missed or
//! doubled tick is harmless.

use std::time::Instant;

use crate::actor::config::Config;

#[derive(Debug)]
pub(crate) struct Maintenance {
    last_refresh: Instant,
    last_republish: Instant,
    last_repair: Instant,
    last_liveness: Instant,
    last_seen_cleanup: Instant,
}

#[derive(Debug, Default, PartialEq, Eq)]
/// Which periodic tasks should run this tick.
pub(crate) struct MaintenanceDecisions {
    /// Look up random targets inside buckets that went unused.
    pub refresh: bool,
    /// Re-announce locally-authored records to their closest nodes.
    pub republish: bool,
    /// Check and backfill replicas, and reap expired records.
    pub repair: bool,
    /// Ping bucket heads to confirm they are alive.
    pub liveness: bool,
    /// Forget old request ids kept for duplicate suppression.
    pub seen_cleanup: bool,
}

impl Maintenance {
    pub fn new() -> Self {
        let now = Instant::now();

        Maintenance {
            last_refresh: now,
            last_republish: now,
            last_repair: now,
            last_liveness: now,
            last_seen_cleanup: now,
        }
    }

    /// Decide what is due, resetting the timers of due tasks.
    pub fn decisions(&mut self, now: Instant, config: &Config) -> MaintenanceDecisions {
        let mut decisions = MaintenanceDecisions::default();

        if now.duration_since(self.last_refresh) >= config.refresh_interval {
            self.last_refresh = now;
            decisions.refresh = true;
        }
        if now.duration_since(self.last_republish) >= config.republish_interval {
            self.last_republish = now;
            decisions.republish = true;
        }
        if now.duration_since(self.last_repair) >= config.repair_interval {
            self.last_repair = now;
            decisions.repair = true;
        }
        if now.duration_since(self.last_liveness) >= config.liveliness_interval {
            self.last_liveness = now;
            decisions.liveness = true;
        }
        if now.duration_since(self.last_seen_cleanup) >= config.seen_cleanup_interval {
            self.last_seen_cleanup = now;
            decisions.seen_cleanup = true;
        }

        decisions
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nothing_is_due_immediately() {
        let mut maintenance = Maintenance::new();

        let decisions = maintenance.decisions(Instant::now(), &Config::default());

        assert_eq!(decisions, MaintenanceDecisions::default());
    }

    #[test]
    fn due_tasks_fire_and_rearm() {
        let config = Config::default();
        let mut maintenance = Maintenance::new();

        // Repair has the shortest interval; advance time past it only.
        // Adding to Instant::now() avoids platform-dependent underflow.
        let later = Instant::now() + config.repair_interval;

        let decisions = maintenance.decisions(later, &config);
        assert!(decisions.repair);
        assert!(!decisions.refresh);
        assert!(!decisions.republish);

        // Immediately after firing, repair is no longer due.
        assert!(!maintenance.decisions(later, &config).repair);
    }

    #[test]
    fn every_task_fires_eventually() {
        let config = Config::default();
        let mut maintenance = Maintenance::new();

        let later = Instant::now() + config.republish_interval;
        let decisions = maintenance.decisions(later, &config);

        assert!(decisions.refresh);
        assert!(decisions.republish);
        assert!(decisions.repair);
        assert!(decisions.liveness);
        assert!(decisions.seen_cleanup);
    }
}
