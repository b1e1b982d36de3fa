use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters shared by the prober, selector and orchestrators.
#[derive(Default)]
pub struct ConnectionStats {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    probes: AtomicU64,
    probe_timeouts: AtomicU64,
    races: AtomicU64,
    race_failures: AtomicU64,
    reuses: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ConnectionStats {
    pub fn on_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dial_failure(&self, err: impl ToString) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn on_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_probe_timeout(&self) {
        self.probe_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_race(&self) {
        self.races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_race_failure(&self) {
        self.race_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        ConnectionStatsSnapshot {
            dials: self.dials.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            probe_timeouts: self.probe_timeouts.load(Ordering::Relaxed),
            races: self.races.load(Ordering::Relaxed),
            race_failures: self.race_failures.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub dials: u64,
    pub dial_failures: u64,
    pub probes: u64,
    pub probe_timeouts: u64,
    pub races: u64,
    pub race_failures: u64,
    pub reuses: u64,
    pub last_error: String,
}

impl ConnectionStatsSnapshot {
    pub fn log_line(&self) -> String {
        format!(
            "dials={} dial_failures={} probes={} probe_timeouts={} races={} race_failures={} reuses={}",
            self.dials,
            self.dial_failures,
            self.probes,
            self.probe_timeouts,
            self.races,
            self.race_failures,
            self.reuses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_record_last_error() {
        let stats = ConnectionStats::default();
        stats.on_dial();
        stats.on_dial_failure("refused");
        stats.on_dial();
        let snap = stats.snapshot();
        assert_eq!(snap.dials, 2);
        assert_eq!(snap.dial_failures, 1);
        assert_eq!(snap.last_error, "refused");
        assert!(snap.log_line().contains("dial_failures=1"));
    }
}
