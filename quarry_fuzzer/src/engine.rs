//! Shared engine state: the lock domains every worker operates on.

use crate::config::Config;
use crate::crash::CrashRegistry;
use crate::server::CoverageClient;
use crate::stats::Stats;
use quarry_core::coverage::Coverage;
use quarry_core::queue::SampleQueue;
use quarry_core::sample::Sample;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Global intent of the engine; decides which job type workers get.
/// Transitions happen only inside `Worker::synchronize_and_get_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InputSamples,
    ServerSamples,
    Fuzzing,
}

/// Everything guarded by the queue lock.
pub struct QueueShared {
    pub sample_queue: SampleQueue,
    /// Append-only index of every accepted sample, position =
    /// `sample_index`. Workers mirror this into their local corpus view.
    pub all_samples: Vec<Arc<Sample>>,
    pub input_files: VecDeque<PathBuf>,
    pub server_samples: VecDeque<Sample>,
    pub phase: Phase,
    /// Samples handed out as PROCESS_SAMPLE jobs and not yet completed.
    /// Gates phase transitions so a drain is not declared early.
    pub samples_pending: usize,
    /// Lowest priority ever dequeued; seeds restored entries whose real
    /// priority was not persisted. Only ever lowered, never reset.
    pub min_priority: i64,
    pub last_server_update: Instant,
}

impl QueueShared {
    fn new() -> Self {
        Self {
            sample_queue: SampleQueue::new(),
            all_samples: Vec::new(),
            input_files: VecDeque::new(),
            server_samples: VecDeque::new(),
            phase: Phase::InputSamples,
            samples_pending: 0,
            min_priority: i64::MAX,
            last_server_update: Instant::now(),
        }
    }
}

/// Counters that must move together with filesystem writes under the
/// output lock; the counter value names the file.
#[derive(Debug, Default)]
pub struct OutputShared {
    pub num_samples: u64,
    pub num_hangs: u64,
}

pub struct Engine {
    pub config: Config,
    /// Union of all edges ever accepted as stable or variable.
    pub coverage: Mutex<Coverage>,
    pub queue: Mutex<QueueShared>,
    pub output: Mutex<OutputShared>,
    pub crashes: CrashRegistry,
    pub server: Option<Mutex<Box<dyn CoverageClient + Send>>>,
    pub stats: Stats,
}

impl Engine {
    pub fn new(config: Config, server: Option<Box<dyn CoverageClient + Send>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            coverage: Mutex::new(Coverage::new()),
            queue: Mutex::new(QueueShared::new()),
            output: Mutex::new(OutputShared::default()),
            crashes: CrashRegistry::new(),
            server: server.map(Mutex::new),
            stats: Stats::new(),
        })
    }

    /// Diff the sample's stable and variable edges against the global
    /// coverage and merge the new ones in, atomically. Both sets are
    /// rewritten in place to hold only the previously unknown edges.
    /// Returns true iff the sample contributed a new stable edge.
    pub fn interesting_sample(&self, stable: &mut Coverage, variable: &mut Coverage) -> bool {
        let mut known = self.coverage.lock().unwrap();

        let new_stable = stable.difference(&known);
        let new_variable = variable.difference(&known);
        known.merge(&new_stable);
        known.merge(&new_variable);
        drop(known);

        *stable = new_stable;
        *variable = new_variable;

        !stable.is_empty()
    }

    pub fn log_status(&self, secs_since_last: u64, last_execs: &mut u64) {
        let total_execs = self.stats.total_execs();
        let discarded = self.stats.samples_discarded();
        let (num_samples, num_hangs) = {
            let out = self.output.lock().unwrap();
            (out.num_samples, out.num_hangs)
        };
        let num_edges = self.coverage.lock().unwrap().num_edges();
        let execs_per_sec = (total_execs.saturating_sub(*last_execs)) / secs_since_last.max(1);
        *last_execs = total_execs;

        log::info!(
            "execs: {} ({}/s), corpus: {} ({} discarded), crashes: {} ({} unique), hangs: {}, edges: {}",
            total_execs,
            execs_per_sec,
            num_samples,
            discarded,
            self.crashes.num_crashes(),
            self.crashes.num_unique_crashes(),
            num_hangs,
            num_edges,
        );
    }
}
