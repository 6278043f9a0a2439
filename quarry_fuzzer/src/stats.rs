use std::sync::atomic::{AtomicU64, Ordering};

/// Monitoring counters updated outside any lock. Coarse inaccuracy under
/// contention is acceptable; these never feed correctness decisions.
#[derive(Debug, Default)]
pub struct Stats {
    total_execs: AtomicU64,
    num_samples_discarded: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_execs(&self) {
        self.total_execs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_execs(&self) -> u64 {
        self.total_execs.load(Ordering::Relaxed)
    }

    pub fn set_total_execs(&self, n: u64) {
        self.total_execs.store(n, Ordering::Relaxed);
    }

    pub fn inc_samples_discarded(&self) {
        self.num_samples_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples_discarded(&self) -> u64 {
        self.num_samples_discarded.load(Ordering::Relaxed)
    }
}
