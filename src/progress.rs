//! Batched progress counters for long-running phases.
//!
//! Progress lines are user-facing output, not diagnostics, so they go to
//! stdout alongside the phase banners rather than through `tracing`.

/// Counts processed items and emits one line per crossed interval.
pub struct Progress {
    prefix: String,
    interval: u64,
    count: u64,
    reported: u64,
}

impl Progress {
    pub fn new(prefix: impl Into<String>, interval: u64) -> Self {
        Self {
            prefix: prefix.into(),
            interval: interval.max(1),
            count: 0,
            reported: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record `n` more processed items, reporting when an interval boundary
    /// is crossed.
    pub fn update(&mut self, n: u64) {
        self.count += n;
        if self.count - self.reported >= self.interval {
            self.reported = self.count - self.count % self.interval;
            println!("{} {}", self.prefix, self.reported);
        }
    }

    /// Emit the final count.
    pub fn report(&self) {
        println!("{} {}", self.prefix, self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_interval() {
        let mut progress = Progress::new("migrated", 3);
        for _ in 0..301 {
            progress.update(1);
        }
        assert_eq!(progress.count(), 301);
        assert_eq!(progress.reported, 300);
    }

    #[test]
    fn small_counts_only_report_final_total() {
        let mut progress = Progress::new("migrated", 50);
        progress.update(1);
        progress.update(1);
        assert_eq!(progress.count(), 2);
        assert_eq!(progress.reported, 0);
        progress.report();
    }

    #[test]
    fn batch_updates_cross_intervals() {
        let mut progress = Progress::new("migrated", 50);
        progress.update(120);
        assert_eq!(progress.reported, 100);
    }
}
