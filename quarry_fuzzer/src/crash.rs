//! Crash deduplication and on-disk crash bookkeeping.

use quarry_core::HashMap;
use std::sync::Mutex;

/// Files kept on disk per crash name.
pub const MAX_IDENTICAL_CRASHES: u64 = 4;

#[derive(Default)]
struct CrashCounts {
    unique_crashes: HashMap<String, u64>,
    num_crashes: u64,
    num_unique_crashes: u64,
}

/// Deduplicates crashes by name and bounds how many copies of the same
/// crash are worth saving.
#[derive(Default)]
pub struct CrashRegistry {
    counts: Mutex<CrashCounts>,
}

impl CrashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one classified crash. Returns whether this copy should be
    /// saved and, if so, the 1-based duplicate index to name the file
    /// with.
    pub fn record(&self, name: &str) -> (bool, u64) {
        let mut counts = self.counts.lock().unwrap();
        counts.num_crashes += 1;

        match counts.unique_crashes.get_mut(name) {
            None => {
                counts.unique_crashes.insert(name.to_string(), 1);
                counts.num_unique_crashes += 1;
                (true, 1)
            }
            Some(seen) => {
                if *seen < MAX_IDENTICAL_CRASHES {
                    *seen += 1;
                    let duplicates = *seen;
                    (true, duplicates)
                } else {
                    (false, 0)
                }
            }
        }
    }

    pub fn num_crashes(&self) -> u64 {
        self.counts.lock().unwrap().num_crashes
    }

    pub fn num_unique_crashes(&self) -> u64 {
        self.counts.lock().unwrap().num_unique_crashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_is_saved() {
        let reg = CrashRegistry::new();
        assert_eq!(reg.record("read_av_0x41414141"), (true, 1));
        assert_eq!(reg.num_crashes(), 1);
        assert_eq!(reg.num_unique_crashes(), 1);
    }

    #[test]
    fn identical_crashes_capped() {
        let reg = CrashRegistry::new();
        let mut saved = 0;
        for _ in 0..MAX_IDENTICAL_CRASHES + 3 {
            let (save, _) = reg.record("sigsegv_0xdead");
            if save {
                saved += 1;
            }
        }
        assert_eq!(saved, MAX_IDENTICAL_CRASHES);
        assert_eq!(reg.num_crashes(), MAX_IDENTICAL_CRASHES + 3);
        assert_eq!(reg.num_unique_crashes(), 1);
    }

    #[test]
    fn duplicate_indices_are_sequential() {
        let reg = CrashRegistry::new();
        let indices: Vec<u64> = (0..MAX_IDENTICAL_CRASHES)
            .map(|_| reg.record("hang_up").1)
            .collect();
        let expected: Vec<u64> = (1..=MAX_IDENTICAL_CRASHES).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn distinct_names_are_distinct_buckets() {
        let reg = CrashRegistry::new();
        reg.record("a");
        reg.record("b");
        reg.record("flaky_a");
        assert_eq!(reg.num_unique_crashes(), 3);
    }
}
