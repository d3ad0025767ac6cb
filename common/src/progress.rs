use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Shared counter of completed work units. Cloning shares the same counters,
/// so a job can hand one to the coordinator and keep another for display.
#[derive(Clone)]
pub struct Progress(Arc<ProgressInner>);

struct ProgressInner {
    complete: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self(Arc::new(ProgressInner {
            complete: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }))
    }

    pub fn progress(&self) -> f32 {
        let total = self.0.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        self.0.complete.load(Ordering::Relaxed) as f32 / total as f32
    }

    pub fn complete(&self) -> bool {
        let total = self.0.total.load(Ordering::Relaxed);
        if total == 0 {
            return false;
        }

        self.0.complete.load(Ordering::Relaxed) >= total
    }

    pub fn completed(&self) -> u64 {
        self.0.complete.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.0.total.load(Ordering::Relaxed)
    }

    /// Units are discovered as stages chain into each other, so the total
    /// grows while a job runs.
    pub fn add_total(&self, units: u64) {
        self.0.total.fetch_add(units, Ordering::Relaxed);
    }

    pub fn add_complete(&self, units: u64) {
        self.0.complete.fetch_add(units, Ordering::Relaxed);
    }

    pub fn set_finished(&self) {
        let total = self.0.total.load(Ordering::Relaxed);
        self.0.complete.store(total, Ordering::Relaxed);
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Progress;

    #[test]
    fn clones_share_counters() {
        let progress = Progress::new();
        let other = progress.clone();

        assert!(!progress.complete());
        other.add_total(4);
        other.add_complete(1);
        assert_eq!(progress.progress(), 0.25);

        progress.add_total(4);
        progress.set_finished();
        assert!(other.complete());
        assert_eq!(other.completed(), 8);
    }
}
