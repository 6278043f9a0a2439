//! Session snapshot and restore.
//!
//! Samples and crashes are persisted the moment they are accepted, so
//! the snapshot only needs the counters and the global coverage;
//! the corpus itself is rebuilt from `samples/` on restore.

use crate::engine::{Engine, Phase};
use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quarry_core::coverage::Coverage;
use quarry_core::queue::SampleQueueEntry;
use quarry_core::sample::Sample;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;

/// Write `state.dat`: `u64 num_samples | u64 total_execs |
/// f64 min_priority | coverage blob`, little-endian.
///
/// A partial input drain must not be checkpointed, so nothing is written
/// while input samples are still being processed.
pub fn save_state(engine: &Engine) -> anyhow::Result<()> {
    let min_priority = {
        let q = engine.queue.lock().unwrap();
        if q.phase == Phase::InputSamples {
            return Ok(());
        }
        q.min_priority
    };

    let out = engine.output.lock().unwrap();
    let coverage = engine.coverage.lock().unwrap();

    let path = engine.config.state_file();
    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);

    w.write_u64::<LittleEndian>(out.num_samples)?;
    w.write_u64::<LittleEndian>(engine.stats.total_execs())?;
    w.write_f64::<LittleEndian>(min_priority as f64)?;
    coverage.write_to(&mut w)?;
    w.flush()?;

    Ok(())
}

/// Read `state.dat` back and rebuild the queue from the sample files on
/// disk. Restored entries share the stale priority floor; their mutator
/// contexts stay uninitialized until first fuzzed.
pub fn restore_state(engine: &Engine) -> anyhow::Result<()> {
    let mut out = engine.output.lock().unwrap();
    let mut coverage = engine.coverage.lock().unwrap();
    let mut q = engine.queue.lock().unwrap();

    let path = engine.config.state_file();
    let file = File::open(&path).with_context(|| {
        format!(
            "cannot restore from {} (did the previous session run long enough to snapshot?)",
            path.display()
        )
    })?;
    let mut r = BufReader::new(file);

    let num_samples = r.read_u64::<LittleEndian>()?;
    let total_execs = r.read_u64::<LittleEndian>()?;
    let min_priority = r.read_f64::<LittleEndian>()? as i64;
    *coverage = Coverage::read_from(&mut r).context("bad coverage blob in state file")?;

    out.num_samples = num_samples;
    engine.stats.set_total_execs(total_execs);
    q.min_priority = min_priority;

    for i in 0..num_samples {
        let path = engine.config.sample_path(i);
        let sample = Sample::load(&path)
            .with_context(|| format!("missing corpus sample {}", path.display()))?;
        let shared = Arc::new(sample);
        let mut entry = SampleQueueEntry::new(Arc::clone(&shared), i);
        // per-sample priorities are not persisted, the floor approximates
        entry.priority = min_priority;
        q.all_samples.push(shared);
        q.sample_queue.push(entry);
    }

    Ok(())
}
