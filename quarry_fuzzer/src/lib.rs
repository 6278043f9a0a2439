//! Quarry fuzzing engine.

#[macro_use]
pub mod worker_log;
pub mod config;
pub mod crash;
pub mod delivery;
pub mod engine;
pub mod server;
pub mod state;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

use crate::config::Config;
use crate::engine::Engine;
use crate::server::{CoverageClient, TcpCoverageClient};
use crate::util::{stop_req, stop_soon};
use crate::worker::Worker;
use anyhow::Context;
use std::collections::VecDeque;
use std::fs::read_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Seconds between periodic snapshots.
pub const SAVE_INTERVAL_SECS: u64 = 300;

/// Run the engine: load or restore the corpus, spawn the workers and
/// sit in the status loop until a stop is requested.
pub fn boot(config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    config.setup_directories()?;

    let server: Option<Box<dyn CoverageClient + Send>> = config
        .server_addr
        .clone()
        .map(|addr| Box::new(TcpCoverageClient::new(addr)) as Box<dyn CoverageClient + Send>);
    let engine = Engine::new(config, server);

    if engine.config.resume {
        log::info!("restoring previous session");
        state::restore_state(&engine).context("failed to restore state")?;
        let restored = engine.queue.lock().unwrap().all_samples.len();
        log::info!("{} corpus samples restored", restored);
    } else {
        let input_dir = engine.config.input.clone().unwrap();
        let files = list_input_files(&input_dir)?;
        if files.is_empty() {
            anyhow::bail!("no input files in {}", input_dir.display());
        }
        log::info!("{} input files read", files.len());
        engine.queue.lock().unwrap().input_files = files;
    }

    setup_signal_handler();

    for id in 1..=engine.config.jobs {
        let engine = Arc::clone(&engine);
        thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                worker_log::set_worker_id(id);
                match Worker::setup(engine, id) {
                    Ok(mut worker) => worker.run(),
                    Err(e) => {
                        log::error!("failed to set up worker-{}: {:#}", id, e);
                        std::process::exit(1);
                    }
                }
            })
            .context("failed to spawn worker thread")?;
    }

    let mut last_execs = 0u64;
    let mut secs_since_last_save = 0u64;
    while !stop_soon() {
        thread::sleep(Duration::from_secs(1));
        secs_since_last_save += 1;
        if secs_since_last_save >= SAVE_INTERVAL_SECS {
            state::save_state(&engine).context("failed to save state")?;
            secs_since_last_save = 0;
        }
        engine.log_status(1, &mut last_execs);
    }

    log::info!("stop requested, saving state");
    state::save_state(&engine).context("failed to save final state")?;
    Ok(())
}

fn list_input_files(dir: &Path) -> anyhow::Result<VecDeque<PathBuf>> {
    let entries =
        read_dir(dir).with_context(|| format!("failed to read input dir {}", dir.display()))?;
    let mut files = VecDeque::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_file() {
            files.push_back(path);
        }
    }
    Ok(files)
}

fn setup_signal_handler() {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::Signals;

    thread::spawn(move || {
        let mut signals = match Signals::new(TERM_SIGNALS) {
            Ok(signals) => signals,
            Err(e) => {
                log::warn!("failed to install signal handler: {}", e);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            log::info!("signal {} received, stopping", signal);
            stop_req();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_listing_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = list_input_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn input_listing_fails_on_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_input_files(&dir.path().join("nope")).is_err());
    }
}
