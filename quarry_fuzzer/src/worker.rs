//! Worker threads: job acquisition, the execution pipeline, trimming
//! and the fuzz loop.

use crate::config::DeliveryMode;
use crate::delivery::{FileDelivery, ShmemDelivery};
use crate::engine::{Engine, Phase};
use crate::target::CommandInstrumentation;
use crate::util::{die, stop_soon};
use crate::{worker_info, worker_warn};
use anyhow::Context;
use quarry_core::coverage::Coverage;
use quarry_core::exec::{Instrumentation, OutputFilter, RunStatus, SampleDelivery};
use quarry_core::mutation::{HavocMutator, Mutator};
use quarry_core::queue::SampleQueueEntry;
use quarry_core::sample::Sample;
use quarry_core::{
    RngType, CRASH_REPRODUCE_TIMES, MAX_SAMPLE_SIZE, SAMPLE_RETRY_TIMES, TRIM_STEP_INITIAL,
};
use rand::SeedableRng;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// What a worker was told to do next. A corpus entry being fuzzed lives
/// inside the job value; the queue holds no alias to it.
pub enum Job {
    Wait,
    ProcessSample { sample: Sample },
    Fuzz { entry: SampleQueueEntry, discard: bool },
}

pub struct Worker {
    engine: Arc<Engine>,
    pub id: usize,
    rng: RngType,
    mutator: Box<dyn Mutator>,
    instrumentation: Box<dyn Instrumentation>,
    delivery: Box<dyn SampleDelivery>,
    output_filter: Option<Box<dyn OutputFilter>>,
    target_argv: Vec<String>,
    /// Read-only mirror of the engine's `all_samples`, extended under
    /// the queue lock whenever the shared index has grown.
    all_samples_local: Vec<Arc<Sample>>,
}

fn replace_target_arg(argv: &mut [String], search: &str, replace: &str) {
    for arg in argv.iter_mut() {
        if arg == search {
            *arg = replace.to_string();
        }
    }
}

/// A run that found new coverage resets the entry to the top priority;
/// anything else sinks it by one.
fn adjust_sample_priority(entry: &mut SampleQueueEntry, found_new_coverage: bool) {
    if found_new_coverage {
        entry.priority = 0;
    } else {
        entry.priority -= 1;
    }
}

impl Worker {
    /// Build the per-worker collaborators from the engine's config. The
    /// instrumentation starts out ignoring everything already known so
    /// corpus edges are filtered at the source.
    pub fn setup(engine: Arc<Engine>, id: usize) -> anyhow::Result<Worker> {
        let config = &engine.config;
        let mut argv = config.target_command.clone();

        let delivery: Box<dyn SampleDelivery> = match config.delivery {
            DeliveryMode::File => {
                let input_path = config.output.join(format!("input_{}", id));
                replace_target_arg(&mut argv, "@@", &input_path.display().to_string());
                Box::new(FileDelivery::new(input_path))
            }
            DeliveryMode::Shmem => {
                let os_id = format!("quarry_shm_{}_{}", std::process::id(), id);
                replace_target_arg(&mut argv, "@@", &os_id);
                Box::new(ShmemDelivery::new(&os_id).context("failed to set up shared memory")?)
            }
        };

        let mut instrumentation = Box::new(CommandInstrumentation::new(
            config.output.join(format!("coverage_{}.dat", id)),
            config.output.join(format!("crash_info_{}", id)),
        ));
        {
            let coverage = engine.coverage.lock().unwrap();
            instrumentation.ignore_coverage(&coverage);
        }

        Ok(Worker {
            engine,
            id,
            rng: RngType::from_entropy(),
            mutator: Box::new(HavocMutator::new()),
            instrumentation,
            delivery,
            output_filter: None,
            target_argv: argv,
            all_samples_local: Vec::new(),
        })
    }

    pub fn run(&mut self) {
        while !stop_soon() {
            let mut job = self.synchronize_and_get_job();
            match &mut job {
                Job::Wait => sleep(Duration::from_secs(1)),
                Job::ProcessSample { sample } => {
                    let init_timeout = self.engine.config.init_timeout_ms;
                    let corpus_timeout = self.engine.config.corpus_timeout_ms;
                    self.run_sample(sample, false, false, init_timeout, corpus_timeout);
                }
                Job::Fuzz { entry, discard } => {
                    *discard = self.fuzz_entry(entry);
                }
            }
            self.job_done(job);
        }
    }

    /// The only place the engine phase changes. Called under the queue
    /// lock at the start of every job acquisition.
    fn synchronize_and_get_job(&mut self) -> Job {
        let engine = Arc::clone(&self.engine);
        let mut q = engine.queue.lock().unwrap();

        if q.all_samples.len() > self.all_samples_local.len() {
            let start = self.all_samples_local.len();
            self.all_samples_local
                .extend(q.all_samples[start..].iter().cloned());
        }

        // The server (and, for the one-time corpus report, the coverage
        // set) is only ever locked under the queue lock here; both are
        // otherwise held alone.
        if q.phase == Phase::Fuzzing {
            if let Some(server) = engine.server.as_ref() {
                let interval = Duration::from_millis(engine.config.server_update_interval_ms);
                if q.last_server_update.elapsed() >= interval {
                    q.last_server_update = Instant::now();
                    let mut client = server.lock().unwrap();
                    if let Err(e) =
                        client.get_updates(&mut q.server_samples, engine.stats.total_execs())
                    {
                        worker_warn!("failed to pull server updates: {}", e);
                    }
                    q.phase = Phase::ServerSamples;
                }
            }
        }

        if q.phase == Phase::InputSamples && q.input_files.is_empty() && q.samples_pending == 0 {
            if q.sample_queue.is_empty() {
                die("no interesting input files");
            }
            match engine.server.as_ref() {
                Some(server) => {
                    let mut client = server.lock().unwrap();
                    {
                        let coverage = engine.coverage.lock().unwrap();
                        if let Err(e) = client.report_new_coverage(&coverage, None) {
                            worker_warn!("failed to report corpus coverage: {}", e);
                        }
                    }
                    q.last_server_update = Instant::now();
                    if let Err(e) =
                        client.get_updates(&mut q.server_samples, engine.stats.total_execs())
                    {
                        worker_warn!("failed to pull server updates: {}", e);
                    }
                    q.phase = Phase::ServerSamples;
                }
                None => q.phase = Phase::Fuzzing,
            }
        }

        if q.phase == Phase::ServerSamples && q.server_samples.is_empty() && q.samples_pending == 0
        {
            q.phase = Phase::Fuzzing;
        }

        match q.phase {
            Phase::Fuzzing => match q.sample_queue.pop() {
                Some(entry) => {
                    if entry.priority < q.min_priority {
                        q.min_priority = entry.priority;
                    }
                    Job::Fuzz {
                        entry,
                        discard: false,
                    }
                }
                None => Job::Wait,
            },
            Phase::InputSamples => {
                while let Some(path) = q.input_files.pop_front() {
                    worker_info!("running input sample {}", path.display());
                    match Sample::load(&path) {
                        Ok(mut sample) => {
                            if sample.len() > MAX_SAMPLE_SIZE {
                                worker_warn!(
                                    "input sample {} larger than the size cap, trimming",
                                    path.display()
                                );
                                sample.trim(MAX_SAMPLE_SIZE);
                            }
                            q.samples_pending += 1;
                            return Job::ProcessSample { sample };
                        }
                        Err(e) => worker_warn!("failed to load {}: {}", path.display(), e),
                    }
                }
                Job::Wait
            }
            Phase::ServerSamples => match q.server_samples.pop_front() {
                Some(sample) => {
                    q.samples_pending += 1;
                    Job::ProcessSample { sample }
                }
                None => Job::Wait,
            },
        }
    }

    fn job_done(&mut self, job: Job) {
        match job {
            Job::Wait => {}
            Job::Fuzz { entry, discard } => {
                let mut q = self.engine.queue.lock().unwrap();
                if discard {
                    self.engine.stats.inc_samples_discarded();
                } else {
                    q.sample_queue.push(entry);
                }
            }
            Job::ProcessSample { .. } => {
                let mut q = self.engine.queue.lock().unwrap();
                q.samples_pending -= 1;
            }
        }
    }

    fn deliver_or_die(&mut self, sample: &Sample) {
        if let Err(e) = self.delivery.deliver(sample) {
            worker_warn!("error delivering sample, retrying with a clean target: {}", e);
            self.instrumentation.clean_target();
            if let Err(e) = self.delivery.deliver(sample) {
                die(&format!("repeatedly failed to deliver sample: {}", e));
            }
        }
    }

    /// One classified execution: deliver, run, collect coverage. Crashes
    /// and hangs are persisted here, immediately on detection.
    fn run_and_get_coverage(
        &mut self,
        sample: &Sample,
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) -> (RunStatus, Coverage) {
        self.engine.stats.inc_total_execs();
        self.deliver_or_die(sample);

        let status = self
            .instrumentation
            .run(&self.target_argv, init_timeout_ms, timeout_ms);
        let coverage = self.instrumentation.take_coverage();

        if status == RunStatus::Crash {
            self.handle_crash(sample, init_timeout_ms, timeout_ms);
        }

        if status == RunStatus::Hang {
            let mut out = self.engine.output.lock().unwrap();
            if self.engine.config.save_hangs {
                let path = self
                    .engine
                    .config
                    .hangs_dir()
                    .join(format!("hang_{}", out.num_hangs));
                if let Err(e) = sample.save(&path) {
                    worker_warn!("failed to save hang {}: {}", path.display(), e);
                }
            }
            out.num_hangs += 1;
        }

        (status, coverage)
    }

    fn handle_crash(&mut self, sample: &Sample, init_timeout_ms: u64, timeout_ms: u64) {
        let mut crash_name = self.instrumentation.crash_name();
        if self.try_reproduce_crash(sample, init_timeout_ms, timeout_ms) == RunStatus::Crash {
            // the analysis run usually yields a better bucket name
            crash_name = self.instrumentation.crash_name();
        } else {
            crash_name = format!("flaky_{}", crash_name);
        }

        let (should_save, duplicates) = self.engine.crashes.record(&crash_name);
        if !should_save {
            return;
        }

        {
            let _out = self.engine.output.lock().unwrap();
            let path = self
                .engine
                .config
                .crash_dir()
                .join(format!("{}_{}", crash_name, duplicates));
            if let Err(e) = sample.save(&path) {
                worker_warn!("failed to save crash {}: {}", path.display(), e);
            }
        }

        if let Some(server) = self.engine.server.as_ref() {
            let mut client = server.lock().unwrap();
            if let Err(e) = client.report_crash(sample, &crash_name) {
                worker_warn!("failed to report crash: {}", e);
            }
        }
    }

    fn try_reproduce_crash(
        &mut self,
        sample: &Sample,
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) -> RunStatus {
        let mut status = RunStatus::Ok;
        for _ in 0..CRASH_REPRODUCE_TIMES {
            self.engine.stats.inc_total_execs();
            self.deliver_or_die(sample);
            status = self.instrumentation.run_with_crash_analysis(
                &self.target_argv,
                init_timeout_ms,
                timeout_ms,
            );
            self.instrumentation.clear_coverage();
            if status == RunStatus::Crash {
                return status;
            }
        }
        status
    }

    /// Execute a sample enough times to split its coverage into stable
    /// and variable edges, and accept it into the corpus if the stable
    /// part contains anything new. Returns the final run status and
    /// whether new coverage was found.
    pub fn run_sample(
        &mut self,
        sample: &mut Sample,
        trim: bool,
        report_to_server: bool,
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) -> (RunStatus, bool) {
        let mut filtered;
        let sample: &mut Sample = match self
            .output_filter
            .as_ref()
            .and_then(|f| f.filter(sample))
        {
            Some(s) => {
                filtered = s;
                &mut filtered
            }
            None => sample,
        };

        let (status, initial) = self.run_and_get_coverage(sample, init_timeout_ms, timeout_ms);
        if status != RunStatus::Ok {
            return (status, false);
        }
        if initial.is_empty() {
            return (status, false);
        }

        let mut stable = initial.clone();
        let mut total = initial;

        // clean target before retrying the sample
        self.instrumentation.clean_target();

        for _ in 0..SAMPLE_RETRY_TIMES {
            let (status, retry) = self.run_and_get_coverage(sample, init_timeout_ms, timeout_ms);
            if status != RunStatus::Ok {
                return (status, false);
            }
            total.merge(&retry);
            stable = stable.intersection(&retry);
        }

        let mut variable = total.difference(&stable);

        let interesting = self.engine.interesting_sample(&mut stable, &mut variable);
        if interesting {
            if trim {
                self.trim_sample(sample, &stable, init_timeout_ms, timeout_ms);
            }

            let sample_index = {
                let mut out = self.engine.output.lock().unwrap();
                let index = out.num_samples;
                let path = self.engine.config.sample_path(index);
                if let Err(e) = sample.save(&path) {
                    worker_warn!("failed to save sample {}: {}", path.display(), e);
                }
                out.num_samples += 1;
                index
            };

            if report_to_server {
                if let Some(server) = self.engine.server.as_ref() {
                    let mut client = server.lock().unwrap();
                    if let Err(e) = client.report_new_coverage(&stable, Some(sample)) {
                        worker_warn!("failed to report new coverage: {}", e);
                    }
                }
            }

            let shared = Arc::new(sample.clone());
            let mut entry = SampleQueueEntry::new(Arc::clone(&shared), sample_index);
            entry.context = Some(self.mutator.create_context(&shared));

            let mut q = self.engine.queue.lock().unwrap();
            q.all_samples.push(shared);
            q.sample_queue.push(entry);
        }

        if !variable.is_empty() && report_to_server {
            if let Some(server) = self.engine.server.as_ref() {
                let mut client = server.lock().unwrap();
                // no canonical reproducer for flaky edges
                if let Err(e) = client.report_new_coverage(&variable, None) {
                    worker_warn!("failed to report variable coverage: {}", e);
                }
            }
        }

        self.instrumentation.ignore_coverage(&total);

        (status, interesting)
    }

    /// Shrink the sample from the tail while its runs keep reproducing
    /// `stable`. The step halves whenever a truncation loses coverage,
    /// so over-trimming recovers at finer granularity.
    fn trim_sample(
        &mut self,
        sample: &mut Sample,
        stable: &Coverage,
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) {
        if sample.len() <= 1 {
            return;
        }

        let mut trim_step = TRIM_STEP_INITIAL;
        let mut trimmed_size = sample.len();
        let mut test = sample.clone();

        loop {
            if test.len() <= 1 {
                break;
            }
            while trim_step >= test.len() {
                trim_step /= 2;
            }
            if trim_step == 0 {
                break;
            }

            test.trim(test.len() - trim_step);

            let (status, coverage) = self.run_and_get_coverage(&test, init_timeout_ms, timeout_ms);
            if status != RunStatus::Ok {
                break;
            }

            if !coverage.contains(stable) {
                trim_step /= 2;
                if trim_step == 0 {
                    break;
                }
                test = sample.clone();
                test.trim(trimmed_size);
                continue;
            }

            trimmed_size = test.len();
        }

        if trimmed_size < sample.len() {
            sample.trim(trimmed_size);
        }
    }

    /// Mutate one corpus entry until the mutator ends the round or the
    /// entry disqualifies itself. Returns whether to discard the entry.
    fn fuzz_entry(&mut self, entry: &mut SampleQueueEntry) -> bool {
        if entry.context.is_none() {
            entry.context = Some(self.mutator.create_context(&entry.sample));
        }
        self.mutator
            .init_round(&entry.sample, entry.context.as_mut().unwrap());

        worker_info!("fuzzing sample {:05}", entry.sample_index);

        let init_timeout = self.engine.config.init_timeout_ms;
        let timeout = self.engine.config.timeout_ms;
        let hang_ratio = self.engine.config.acceptable_hang_ratio;
        let crash_ratio = self.engine.config.acceptable_crash_ratio;

        loop {
            if stop_soon() {
                return false;
            }

            let mut mutated = (*entry.sample).clone();
            if !self
                .mutator
                .mutate(&mut mutated, &mut self.rng, &self.all_samples_local)
            {
                return false;
            }
            if mutated.len() > MAX_SAMPLE_SIZE {
                mutated.trim(MAX_SAMPLE_SIZE);
            }

            let (status, new_coverage) =
                self.run_sample(&mut mutated, true, true, init_timeout, timeout);
            adjust_sample_priority(entry, new_coverage);
            self.mutator.notify_result(status, new_coverage);

            entry.num_runs += 1;
            if new_coverage {
                entry.num_newcoverage += 1;
            }
            if status == RunStatus::Hang {
                entry.num_hangs += 1;
            }
            if status == RunStatus::Crash {
                entry.num_crashes += 1;
            }

            if entry.num_hangs > 10
                && entry.num_hangs as f64 > entry.num_runs as f64 * hang_ratio
            {
                worker_warn!(
                    "sample {} produces too many hangs, discarding",
                    entry.sample_index
                );
                return true;
            }
            if entry.num_crashes > 100
                && entry.num_crashes as f64 > entry.num_runs as f64 * crash_ratio
            {
                worker_warn!(
                    "sample {} produces too many crashes, discarding",
                    entry.sample_index
                );
                return true;
            }
        }
    }
}
