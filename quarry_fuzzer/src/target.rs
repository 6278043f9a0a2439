//! Out-of-process target execution.
//!
//! The target is expected to be built with an instrumentation runtime
//! that dumps the edges a run covered, in the coverage binary format, to
//! the file named by `QUARRY_COVERAGE_FILE`. A crashing run may leave a
//! bucket name in `QUARRY_CRASH_INFO`; otherwise the fatal signal names
//! the bucket.

use quarry_core::coverage::Coverage;
use quarry_core::exec::{Instrumentation, RunStatus};
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

pub const COVERAGE_FILE_ENV: &str = "QUARRY_COVERAGE_FILE";
pub const CRASH_INFO_ENV: &str = "QUARRY_CRASH_INFO";
pub const CRASH_ANALYSIS_ENV: &str = "QUARRY_CRASH_ANALYSIS";

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct CommandInstrumentation {
    coverage_file: PathBuf,
    crash_info_file: PathBuf,
    ignored: Coverage,
    collected: Coverage,
    last_crash_name: String,
    /// The next run is the first one after a (re)started target and gets
    /// the init timeout.
    fresh_target: bool,
}

impl CommandInstrumentation {
    pub fn new(coverage_file: PathBuf, crash_info_file: PathBuf) -> Self {
        Self {
            coverage_file,
            crash_info_file,
            ignored: Coverage::new(),
            collected: Coverage::new(),
            last_crash_name: String::new(),
            fresh_target: true,
        }
    }

    fn run_inner(&mut self, argv: &[String], timeout_ms: u64, analysis: bool) -> RunStatus {
        let _ = fs::remove_file(&self.coverage_file);
        let _ = fs::remove_file(&self.crash_info_file);
        self.collected = Coverage::new();

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env(COVERAGE_FILE_ENV, &self.coverage_file)
            .env(CRASH_INFO_ENV, &self.crash_info_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if analysis {
            cmd.env(CRASH_ANALYSIS_ENV, "1");
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("failed to spawn target {}: {}", argv[0], e);
                return RunStatus::Error;
            }
        };

        let status = match self.wait_with_timeout(&mut child, timeout_ms) {
            Some(status) => status,
            None => return RunStatus::Hang,
        };

        self.collect_artifacts();

        match status.signal() {
            Some(signal) => {
                self.last_crash_name = self.crash_bucket_name(signal);
                RunStatus::Crash
            }
            None => RunStatus::Ok,
        }
    }

    fn wait_with_timeout(
        &mut self,
        child: &mut Child,
        timeout_ms: u64,
    ) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return None;
                    }
                    sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    log::warn!("failed to wait for target: {}", e);
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
            }
        }
    }

    fn collect_artifacts(&mut self) {
        self.collected = match File::open(&self.coverage_file) {
            Ok(file) => match Coverage::read_from(&mut BufReader::new(file)) {
                Ok(raw) => raw.difference(&self.ignored),
                Err(e) => {
                    log::warn!("unreadable coverage artifact: {}", e);
                    Coverage::new()
                }
            },
            Err(_) => Coverage::new(),
        };
    }

    fn crash_bucket_name(&self, signal: i32) -> String {
        if let Ok(info) = fs::read_to_string(&self.crash_info_file) {
            if let Some(name) = info.lines().next() {
                let name = name.trim();
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        match signal {
            4 => "SIGILL".to_string(),
            6 => "SIGABRT".to_string(),
            7 => "SIGBUS".to_string(),
            8 => "SIGFPE".to_string(),
            11 => "SIGSEGV".to_string(),
            other => format!("signal_{}", other),
        }
    }

    fn pick_timeout(&mut self, init_timeout_ms: u64, timeout_ms: u64) -> u64 {
        if self.fresh_target {
            self.fresh_target = false;
            init_timeout_ms
        } else {
            timeout_ms
        }
    }
}

impl Instrumentation for CommandInstrumentation {
    fn run(&mut self, argv: &[String], init_timeout_ms: u64, timeout_ms: u64) -> RunStatus {
        let timeout = self.pick_timeout(init_timeout_ms, timeout_ms);
        self.run_inner(argv, timeout, false)
    }

    fn run_with_crash_analysis(
        &mut self,
        argv: &[String],
        init_timeout_ms: u64,
        timeout_ms: u64,
    ) -> RunStatus {
        let timeout = self.pick_timeout(init_timeout_ms, timeout_ms);
        self.run_inner(argv, timeout, true)
    }

    fn take_coverage(&mut self) -> Coverage {
        std::mem::take(&mut self.collected)
    }

    fn clear_coverage(&mut self) {
        self.collected = Coverage::new();
    }

    fn ignore_coverage(&mut self, coverage: &Coverage) {
        self.ignored.merge(coverage);
    }

    fn clean_target(&mut self) {
        let _ = fs::remove_file(&self.coverage_file);
        self.fresh_target = true;
    }

    fn crash_name(&self) -> String {
        self.last_crash_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrumentation(dir: &std::path::Path) -> CommandInstrumentation {
        CommandInstrumentation::new(dir.join("coverage.dat"), dir.join("crash_info"))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn clean_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        assert_eq!(instr.run(&sh("exit 0"), 5000, 5000), RunStatus::Ok);
        // non-zero exits are still not crashes
        assert_eq!(instr.run(&sh("exit 3"), 5000, 5000), RunStatus::Ok);
    }

    #[test]
    fn fatal_signal_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        let status = instr.run(&sh("kill -SEGV $$"), 5000, 5000);
        assert_eq!(status, RunStatus::Crash);
        assert_eq!(instr.crash_name(), "SIGSEGV");
    }

    #[test]
    fn crash_info_file_names_the_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        let script = format!(
            "echo write_av_0x41 > {}; kill -SEGV $$",
            dir.path().join("crash_info").display()
        );
        assert_eq!(instr.run(&sh(&script), 5000, 5000), RunStatus::Crash);
        assert_eq!(instr.crash_name(), "write_av_0x41");
    }

    #[test]
    fn timeout_is_a_hang() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        assert_eq!(instr.run(&sh("sleep 10"), 200, 200), RunStatus::Hang);
    }

    #[test]
    fn unspawnable_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        let argv = vec![dir.path().join("no_such_bin").display().to_string()];
        assert_eq!(instr.run(&argv, 1000, 1000), RunStatus::Error);
    }

    #[test]
    fn coverage_artifact_is_collected_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());

        let mut cov = Coverage::new();
        cov.add_edge("target", 1);
        cov.add_edge("target", 2);
        let mut blob = Vec::new();
        cov.write_to(&mut blob).unwrap();
        let prepared = dir.path().join("prepared");
        fs::write(&prepared, &blob).unwrap();

        let mut ignored = Coverage::new();
        ignored.add_edge("target", 1);
        instr.ignore_coverage(&ignored);

        let script = format!(
            "cp {} {}",
            prepared.display(),
            dir.path().join("coverage.dat").display()
        );
        assert_eq!(instr.run(&sh(&script), 5000, 5000), RunStatus::Ok);

        let collected = instr.take_coverage();
        assert!(collected.has_edge("target", 2));
        assert!(!collected.has_edge("target", 1));
        // taking clears
        assert!(instr.take_coverage().is_empty());
    }

    #[test]
    fn init_timeout_applies_only_to_the_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut instr = instrumentation(dir.path());
        // generous init timeout, tiny steady-state timeout
        assert_eq!(instr.run(&sh("sleep 0.05"), 5000, 10), RunStatus::Ok);
        assert_eq!(instr.run(&sh("sleep 0.05"), 5000, 10), RunStatus::Hang);
        instr.clean_target();
        assert_eq!(instr.run(&sh("sleep 0.05"), 5000, 10), RunStatus::Ok);
    }
}
