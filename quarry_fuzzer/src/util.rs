use std::sync::atomic::{AtomicBool, Ordering};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Acquire)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Release)
}

/// Unrecoverable condition detected on a worker thread. Workers are
/// detached, so the process is taken down directly.
pub fn die(msg: &str) -> ! {
    log::error!("fatal: {}", msg);
    std::process::exit(1);
}
