//! Interfaces between the engine and its target-facing collaborators.

use crate::coverage::Coverage;
use crate::sample::Sample;
use std::io;

/// Outcome of one target execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Hang,
    Crash,
    /// The target could not be executed at all.
    Error,
}

/// A provider of instrumented target executions.
///
/// Implementations launch the target out of process, bound each run with
/// the given timeouts and report the edges the run covered. `init_timeout`
/// applies to the first run after the target was (re)started, `timeout`
/// to every run after that.
pub trait Instrumentation {
    fn run(&mut self, argv: &[String], init_timeout_ms: u64, timeout_ms: u64) -> RunStatus;

    /// Like [`Instrumentation::run`] but with any expensive crash triage
    /// the implementation supports enabled, so a crashing run yields the
    /// best possible crash name.
    fn run_with_crash_analysis(
        &mut self,
        argv: &[String],
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) -> RunStatus;

    /// Coverage captured by the most recent run, minus the ignore set.
    /// Clears the captured coverage.
    fn take_coverage(&mut self) -> Coverage;

    fn clear_coverage(&mut self);

    /// Edges the implementation should stop reporting. The engine feeds
    /// every accepted sample's total coverage back through this.
    fn ignore_coverage(&mut self, coverage: &Coverage);

    /// Kill any persistent target state so the next run starts clean.
    fn clean_target(&mut self);

    /// Bucket name of the most recent crash.
    fn crash_name(&self) -> String;
}

/// Transport that makes a sample visible to the target before a run.
pub trait SampleDelivery {
    fn deliver(&mut self, sample: &Sample) -> io::Result<()>;
}

/// Optional rewrite applied to a sample before execution.
///
/// Returning `None` executes the sample as-is. Returning `Some` executes
/// (and, on acceptance, stores) the normalized variant instead.
pub trait OutputFilter {
    fn filter(&self, sample: &Sample) -> Option<Sample>;
}

/// Forces a magic prefix onto every executed sample.
pub struct MagicOutputFilter {
    magic: Vec<u8>,
}

impl MagicOutputFilter {
    pub fn new(magic: Vec<u8>) -> Self {
        Self { magic }
    }
}

impl OutputFilter for MagicOutputFilter {
    fn filter(&self, sample: &Sample) -> Option<Sample> {
        if sample.as_bytes().starts_with(&self.magic) {
            return None;
        }
        let mut out = sample.clone();
        let len = out.len().min(self.magic.len());
        out.bytes_mut()[..len].copy_from_slice(&self.magic[..len]);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_filter_rewrites_prefix() {
        let f = MagicOutputFilter::new(b"MAGI".to_vec());
        let s = Sample::new(b"xxxxrest".to_vec());
        let out = f.filter(&s).unwrap();
        assert_eq!(out.as_bytes(), b"MAGIrest");

        // already carries the magic, no rewrite
        assert!(f.filter(&out).is_none());

        // shorter than the magic, rewritten up to its own length
        let short = Sample::new(b"ab".to_vec());
        assert_eq!(f.filter(&short).unwrap().as_bytes(), b"MA");
    }
}
