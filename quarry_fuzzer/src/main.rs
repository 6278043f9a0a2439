use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use quarry_fuzzer::config::{Config, DeliveryMode};
use quarry_fuzzer::server::CoverageServer;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "quarry",
    version,
    about = "Coverage-guided fuzzer for out-of-process targets"
)]
struct Settings {
    /// Input corpus directory; '-' resumes from the previous session.
    #[arg(long, short = 'i', required_unless_present = "start_server")]
    input: Option<String>,
    /// Directory for samples, crashes, hangs and the session snapshot.
    #[arg(long, short = 'o', default_value = "output")]
    output: PathBuf,
    /// Parallel fuzzing workers.
    #[arg(long, short = 'j', default_value_t = 1)]
    jobs: usize,
    /// Per-execution timeout in milliseconds.
    #[arg(long, short = 't', default_value_t = i32::MAX as u64)]
    timeout: u64,
    /// Timeout for the first execution after a target start; defaults to
    /// --timeout.
    #[arg(long)]
    init_timeout: Option<u64>,
    /// Timeout used while ingesting the input corpus; defaults to
    /// --timeout.
    #[arg(long)]
    corpus_timeout: Option<u64>,
    /// Address of a coverage server to exchange samples with.
    #[arg(long)]
    server: Option<String>,
    /// Listen on this address as the coverage server instead of fuzzing.
    #[arg(long)]
    start_server: Option<String>,
    /// Restore the session from <OUTPUT>/state.dat.
    #[arg(long, alias = "restore")]
    resume: bool,
    /// Sample delivery transport (file or shmem).
    #[arg(long, default_value = "file")]
    delivery: DeliveryMode,
    /// Keep hanging samples under <OUTPUT>/hangs.
    #[arg(long)]
    save_hangs: bool,
    /// Target command line; '@@' is replaced with the per-worker input
    /// path or shared memory name.
    #[arg(last = true)]
    target_command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("QUARRY_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    if let Some(addr) = settings.start_server {
        let mut server = CoverageServer::new(settings.output);
        return server.run(&addr);
    }

    let resume = settings.resume || settings.input.as_deref() == Some("-");
    let input = settings
        .input
        .filter(|input| input != "-")
        .map(PathBuf::from);

    let config = Config {
        input,
        output: settings.output,
        jobs: settings.jobs,
        timeout_ms: settings.timeout,
        init_timeout_ms: settings.init_timeout.unwrap_or(settings.timeout),
        corpus_timeout_ms: settings.corpus_timeout.unwrap_or(settings.timeout),
        server_addr: settings.server,
        resume,
        delivery: settings.delivery,
        save_hangs: settings.save_hangs,
        target_command: settings.target_command,
        ..Config::default()
    };

    quarry_fuzzer::boot(config)
}
